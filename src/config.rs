use crate::{
    services::{
        lifecycle::{DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_TTL, RetentionPolicy},
        reclaimer::ReclaimerConfig,
    },
    units::{parse_duration, parse_size},
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};
use subtle::ConstantTimeEq;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 100;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub retention: RetentionPolicy,
    pub reclaimer: ReclaimerConfig,
    pub io_timeout: Duration,
    /// Requests per minute allowed from one client address; 0 disables.
    pub rate_limit_per_minute: u32,
    pub public_url: Option<String>,
    pub api_key: Option<ApiKey>,
}

/// Shared secret for the upload and API routes. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Constant-time comparison against a client-supplied key.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file sharing service")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded files are stored (overrides STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Upload size limit such as 1GB or 500MiB (overrides MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<String>,

    /// Downloads allowed per file (overrides MAX_DOWNLOADS)
    #[arg(long)]
    pub max_downloads: Option<i64>,

    /// Time to live such as 3d or 1w (overrides FILE_EXPIRE_AFTER)
    #[arg(long)]
    pub expire_after: Option<String>,

    /// Time between cleanup sweeps (overrides CLEANUP_INTERVAL)
    #[arg(long)]
    pub cleanup_interval: Option<String>,

    /// Ledger rows handled per sweep batch (overrides SWEEP_BATCH_SIZE)
    #[arg(long)]
    pub sweep_batch_size: Option<i64>,

    /// Transport read/write timeout (overrides IO_TIMEOUT)
    #[arg(long)]
    pub io_timeout: Option<String>,

    /// Requests per minute per client IP, 0 disables (overrides RATE_LIMIT_PER_MINUTE)
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Base URL used in download links (overrides PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Shared secret for uploads and the API (overrides API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over environment lookups over defaults.
    ///
    /// Empty environment values count as unset.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = match args.port {
            Some(port) => port,
            None => parse_env(&env_var, "PORT")?.unwrap_or(3000),
        };

        let max_downloads = match args.max_downloads {
            Some(value) => value,
            None => parse_env(&env_var, "MAX_DOWNLOADS")?.unwrap_or(1),
        };
        if max_downloads < 1 {
            bail!("MAX_DOWNLOADS must be at least 1, got {}", max_downloads);
        }

        let batch_size = match args.sweep_batch_size {
            Some(value) => value,
            None => parse_env(&env_var, "SWEEP_BATCH_SIZE")?
                .unwrap_or(ReclaimerConfig::default().batch_size),
        };
        if batch_size < 1 {
            bail!("SWEEP_BATCH_SIZE must be at least 1, got {}", batch_size);
        }

        let rate_limit_per_minute = match args.rate_limit {
            Some(value) => value,
            None => parse_env(&env_var, "RATE_LIMIT_PER_MINUTE")?
                .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE),
        };

        let max_upload_bytes = size_or_default(
            "MAX_UPLOAD_SIZE",
            args.max_upload_size.or_else(|| env_var("MAX_UPLOAD_SIZE")),
            DEFAULT_MAX_UPLOAD_BYTES,
        );
        let ttl = duration_or_default(
            "FILE_EXPIRE_AFTER",
            args.expire_after.or_else(|| env_var("FILE_EXPIRE_AFTER")),
            DEFAULT_TTL,
        );
        let interval = duration_or_default(
            "CLEANUP_INTERVAL",
            args.cleanup_interval.or_else(|| env_var("CLEANUP_INTERVAL")),
            ReclaimerConfig::default().interval,
        );
        let io_timeout = duration_or_default(
            "IO_TIMEOUT",
            args.io_timeout.or_else(|| env_var("IO_TIMEOUT")),
            DEFAULT_IO_TIMEOUT,
        );

        let public_url = args
            .public_url
            .or_else(|| env_var("PUBLIC_URL"))
            .map(|url| url.trim_end_matches('/').to_string());
        let api_key = args
            .api_key
            .or_else(|| env_var("API_KEY"))
            .map(ApiKey::new);

        Ok(Self {
            host: args
                .host
                .or_else(|| env_var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port,
            storage_dir: args
                .storage_dir
                .or_else(|| env_var("STORAGE_DIR"))
                .unwrap_or_else(|| "./uploads".into()),
            database_url: args
                .database_url
                .or_else(|| env_var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/fileuploader.db".into()),
            retention: RetentionPolicy {
                max_upload_bytes,
                max_downloads,
                ttl,
            },
            reclaimer: ReclaimerConfig {
                interval,
                batch_size,
                // Must outlast any single upload, which the transport caps at
                // io_timeout.
                orphan_grace: ReclaimerConfig::default()
                    .orphan_grace
                    .max(io_timeout.saturating_mul(2)),
            },
            io_timeout,
            rate_limit_per_minute,
            public_url,
            api_key,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse a numeric env var; absent is `Ok(None)`, garbage is an error.
fn parse_env<T, F>(env_var: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    env_var(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", key, value))
        })
        .transpose()
}

fn size_or_default(key: &str, raw: Option<String>, default: u64) -> u64 {
    match raw.as_deref().map(parse_size) {
        None => default,
        Some(Ok(bytes)) => bytes,
        Some(Err(err)) => {
            tracing::warn!("{}: {}, using default of {} bytes", key, err, default);
            default
        }
    }
}

fn duration_or_default(key: &str, raw: Option<String>, default: Duration) -> Duration {
    match raw.as_deref().map(parse_duration) {
        None => default,
        Some(Ok(duration)) => duration,
        Some(Err(err)) => {
            tracing::warn!("{}: {}, using default of {:?}", key, err, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(cli: &[&str], env: &[(&str, &str)]) -> Result<AppConfig> {
        let args = Args::try_parse_from(std::iter::once("ephemeral-store").chain(cli.iter().copied()))
            .expect("valid args");
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::resolve(args, |key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = resolve(&[], &[]).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.retention, RetentionPolicy::default());
        assert_eq!(cfg.retention.max_upload_bytes, 1024 * 1024 * 1024);
        assert_eq!(cfg.retention.ttl, Duration::from_secs(3 * 86_400));
        assert_eq!(cfg.reclaimer.interval, Duration::from_secs(3600));
        assert_eq!(cfg.io_timeout, Duration::from_secs(1800));
        assert!(cfg.reclaimer.orphan_grace >= cfg.io_timeout);
        assert_eq!(cfg.rate_limit_per_minute, 100);
        assert!(cfg.api_key.is_none());
        assert!(cfg.public_url.is_none());
    }

    #[test]
    fn rate_limit_can_be_set_or_disabled() {
        let cfg = resolve(&[], &[("RATE_LIMIT_PER_MINUTE", "20")]).unwrap();
        assert_eq!(cfg.rate_limit_per_minute, 20);
        let cfg = resolve(&["--rate-limit", "0"], &[("RATE_LIMIT_PER_MINUTE", "20")]).unwrap();
        assert_eq!(cfg.rate_limit_per_minute, 0);
        assert!(resolve(&[], &[("RATE_LIMIT_PER_MINUTE", "lots")]).is_err());
    }

    #[test]
    fn environment_is_read() {
        let cfg = resolve(
            &[],
            &[
                ("PORT", "8080"),
                ("MAX_UPLOAD_SIZE", "5GB"),
                ("MAX_DOWNLOADS", "3"),
                ("FILE_EXPIRE_AFTER", "1W"),
                ("API_KEY", "s3cret"),
                ("PUBLIC_URL", "https://files.example.com/"),
            ],
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.retention.max_upload_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(cfg.retention.max_downloads, 3);
        assert_eq!(cfg.retention.ttl, Duration::from_secs(7 * 86_400));
        assert!(cfg.api_key.as_ref().is_some_and(|key| key.matches("s3cret")));
        assert_eq!(cfg.public_url.as_deref(), Some("https://files.example.com"));
    }

    #[test]
    fn cli_overrides_environment() {
        let cfg = resolve(
            &["--port", "9000", "--max-downloads", "2", "--expire-after", "12h"],
            &[("PORT", "8080"), ("MAX_DOWNLOADS", "7"), ("FILE_EXPIRE_AFTER", "1d")],
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.retention.max_downloads, 2);
        assert_eq!(cfg.retention.ttl, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn bad_human_strings_fall_back_to_defaults() {
        let cfg = resolve(
            &[],
            &[("MAX_UPLOAD_SIZE", "lots"), ("FILE_EXPIRE_AFTER", "3 fortnights")],
        )
        .unwrap();
        assert_eq!(cfg.retention.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(cfg.retention.ttl, DEFAULT_TTL);
    }

    #[test]
    fn empty_values_count_as_unset() {
        let cfg = resolve(&[], &[("API_KEY", ""), ("PORT", " ")]).unwrap();
        assert!(cfg.api_key.is_none());
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert!(resolve(&[], &[("PORT", "http")]).is_err());
        assert!(resolve(&[], &[("MAX_DOWNLOADS", "0")]).is_err());
        assert!(resolve(&[], &[("SWEEP_BATCH_SIZE", "-5")]).is_err());
    }

    #[test]
    fn api_key_comparison_and_redaction() {
        let key = ApiKey::new("abc123");
        assert!(key.matches("abc123"));
        assert!(!key.matches("abc124"));
        assert!(!key.matches("abc"));
        assert!(!key.matches("abc1234"));
        assert!(!key.matches(""));
        assert_eq!(format!("{:?}", key), "ApiKey(***)");
    }
}
