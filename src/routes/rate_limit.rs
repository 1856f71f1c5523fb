//! Per-client request limit, keyed on the peer IP from `ConnectInfo`.
//!
//! Requests without connection info (in-process callers) are not limited.

use crate::{errors::AppError, routes::auth::is_raw_upload, state::AppState};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

pub type IpRateLimiter = DefaultKeyedRateLimiter<IpAddr>;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Limiter allowing `per_minute` requests per address, refilled evenly over
/// the minute.
pub fn ip_rate_limiter(per_minute: NonZeroU32) -> Arc<IpRateLimiter> {
    Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute)))
}

/// Middleware answering 429 once an address has used up its quota.
pub async fn limit_per_ip(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return Ok(next.run(req).await);
    };
    let Some(ip) = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return Ok(next.run(req).await);
    };

    if limiter.check_key(&ip).is_err() {
        tracing::debug!("rate limited {} on {}", ip, req.uri().path());
        let err = AppError::new(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        return Err(if is_raw_upload(&req) { err.plain() } else { err });
    }

    Ok(next.run(req).await)
}

/// Periodically drop state for addresses whose quota has fully refilled.
pub fn spawn_pruner(
    limiter: Arc<IpRateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    limiter.retain_recent();
                }
            }
        }
    })
}
