use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::Config;
use crate::error::{AppError, Result};

/// The number of vendor calls allowed in flight at once.
pub const UPSTREAM_SLOTS: usize = 64;

/// Timeout for a single vendor call.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds how many vendor calls the gateway makes concurrently.
#[derive(Clone)]
pub struct UpstreamLimiter {
    semaphore: Arc<Semaphore>,
}

impl UpstreamLimiter {
    /// Creates a new `UpstreamLimiter`.
    pub fn new(slots: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Acquires a permit from the semaphore.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("Upstream limiter closed: {}", e)))
    }
}

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Arc<Config>,
    /// HTTP client used for every vendor call.
    pub http: reqwest::Client,
    /// The upstream concurrency limiter.
    pub upstream_limiter: UpstreamLimiter,
}

impl AppState {
    /// Creates a new `AppState`.
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        tracing::info!("✅ Vendor HTTP client initialized");

        if config.signing_secret.is_none() || config.secondary_secret.is_none() {
            tracing::error!(
                "❌ Signing secrets are not configured; signed vendor endpoints will fail"
            );
        }

        let upstream_limiter = UpstreamLimiter::new(UPSTREAM_SLOTS);
        tracing::info!("✅ Upstream limiter initialized ({} slots)", UPSTREAM_SLOTS);

        Ok(AppState {
            config: Arc::new(config),
            http,
            upstream_limiter,
        })
    }
}
