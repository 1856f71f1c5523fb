//! Shared request context, built once at startup and cloned into handlers.

use crate::{
    config::ApiKey, routes::rate_limit::IpRateLimiter, services::lifecycle::LifecycleEngine,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: LifecycleEngine,
    pub settings: Arc<HttpSettings>,
    /// Per-address request limit; unlimited when `None`.
    pub rate_limiter: Option<Arc<IpRateLimiter>>,
}

/// Request-facing settings that are not part of the lifecycle policy.
#[derive(Debug, Clone, Default)]
pub struct HttpSettings {
    /// Base for download links; derived from the request when unset.
    pub public_url: Option<String>,
    /// Shared secret; the gate is disabled when unset.
    pub api_key: Option<ApiKey>,
}

impl AppState {
    pub fn new(engine: LifecycleEngine, settings: HttpSettings) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            rate_limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<IpRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }
}
