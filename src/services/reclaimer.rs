//! src/services/reclaimer.rs
//!
//! Reclaimer: periodic sweep that evicts objects nobody asks for again.
//!
//! Each pass:
//! 1. walks the ledger for expired or exhausted rows, in id-ordered batches,
//!    and evicts them through the engine's shared eviction primitive;
//! 2. walks the blob directory for payloads with no ledger row and for
//!    abandoned temp files, and deletes those older than the grace period.

use crate::services::{blob_store::BlobKind, lifecycle::LifecycleEngine};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BATCH_SIZE: i64 = 500;
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(60 * 60);

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Ledger rows fetched per batch.
    pub batch_size: i64,
    /// Minimum age before an unreferenced file on disk is deleted. Must
    /// outlast the gap between an upload's last write and its ledger commit.
    pub orphan_grace: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub orphans_removed: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reclaimer {
    engine: LifecycleEngine,
    config: ReclaimerConfig,
}

impl Reclaimer {
    pub fn new(engine: LifecycleEngine, config: ReclaimerConfig) -> Self {
        Self { engine, config }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as of `now`. Individual failures are logged and counted,
    /// never fatal.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_due(now, &mut report).await;
        self.sweep_orphans(now, self.config.orphan_grace, &mut report).await;
        report
    }

    /// Sweep run before the server accepts any upload.
    ///
    /// Nothing can be in flight yet, so payloads without a ledger row and
    /// temp files left by a previous process are removed regardless of age.
    pub async fn sweep_startup(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();
        self.sweep_due(now, &mut report).await;
        self.sweep_orphans(now, Duration::ZERO, &mut report).await;
        report
    }

    async fn sweep_due(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let ledger = self.engine.ledger();
        let max_downloads = self.engine.policy().max_downloads;
        let batch_size = self.config.batch_size.max(1);
        let mut cursor: Option<String> = None;

        loop {
            let batch = match ledger
                .find_expired_or_exhausted(now, max_downloads, cursor.as_deref(), batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    error!("reclaimer could not query the ledger: {}", err);
                    report.failures += 1;
                    return;
                }
            };

            for record in &batch {
                match self.engine.evict_if_due(record, now).await {
                    Ok(Some(reason)) => {
                        debug!("reclaimed {} ({:?})", record.id, reason);
                        report.evicted += 1;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!("failed to reclaim {}: {}", record.id, err);
                        report.failures += 1;
                    }
                }
            }

            if (batch.len() as i64) < batch_size {
                break;
            }
            cursor = batch.last().map(|record| record.id.clone());
            tokio::task::yield_now().await;
        }
    }

    async fn sweep_orphans(&self, now: DateTime<Utc>, grace: Duration, report: &mut SweepReport) {
        let skip_age_check = grace.is_zero();
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let entries = match self.engine.blobs().scan().await {
            Ok(entries) => entries,
            Err(err) => {
                error!("reclaimer could not scan blob storage: {}", err);
                report.failures += 1;
                return;
            }
        };

        for entry in entries {
            let modified: DateTime<Utc> = entry.modified.into();
            if !skip_age_check && now.signed_duration_since(modified) < grace {
                continue;
            }

            if let BlobKind::Object { id } = &entry.kind {
                match self.engine.ledger().exists(id).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(err) => {
                        warn!("could not check ledger for {}: {}", id, err);
                        report.failures += 1;
                        continue;
                    }
                }
            }

            match self.engine.blobs().delete(&entry.location).await {
                Ok(true) => {
                    debug!("removed orphaned {:?} at {}", entry.kind, entry.location);
                    report.orphans_removed += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("failed to remove orphan {}: {}", entry.location, err);
                    report.failures += 1;
                }
            }
        }
    }

    /// Run a sweep immediately and then every `interval` until `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "reclaimer running every {:?} (batch size {})",
                self.config.interval, self.config.batch_size
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep_once().await;
                        if !report.is_empty() {
                            info!(
                                "reclaimer evicted {} files, removed {} orphans, {} failures",
                                report.evicted, report.orphans_removed, report.failures
                            );
                        }
                    }
                }
            }

            info!("reclaimer stopped");
        })
    }
}
