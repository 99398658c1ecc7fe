use std::sync::Arc;

use axum::Router;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};

use crate::config::LoginRateLimit;

/// Wraps `router` in a per-IP burst limiter.
///
/// Keys on the peer address, so the router must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn limit_by_ip(router: Router, limit: LoginRateLimit) -> Router {
    let Some(config) = GovernorConfigBuilder::default()
        .per_second(limit.period_secs.max(1))
        .burst_size(limit.burst.max(1))
        .use_headers()
        .finish()
    else {
        tracing::error!("❌ Invalid login rate limit {:?}, limiter disabled", limit);
        return router;
    };

    tracing::info!(
        "✅ Login rate limit: burst {} / one every {}s",
        limit.burst,
        limit.period_secs
    );
    router.layer(GovernorLayer::new(Arc::new(config)))
}
