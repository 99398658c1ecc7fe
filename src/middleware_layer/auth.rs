use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_cookies::Cookies;

use crate::{
    error::AppError,
    models::session::{ACCESS_TOKEN_COOKIE, REGION_COOKIE, USER_ID_COOKIE, VIN_COOKIE},
    state::AppState,
};

/// Credentials and context recovered from the HttpOnly cookies.
#[derive(Clone)]
pub struct VendorSession {
    pub access_token: String,
    pub region: Option<String>,
    pub vin: Option<String>,
    pub user_id: Option<String>,
}

impl std::fmt::Debug for VendorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorSession")
            .field("access_token", &"<redacted>")
            .field("region", &self.region)
            .field("vin", &self.vin)
            .field("user_id", &self.user_id)
            .finish()
    }
}

fn non_empty(cookies: &Cookies, name: &str) -> Option<String> {
    cookies
        .get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

impl VendorSession {
    /// Reads the session from the request cookies; `None` without a bearer.
    pub fn from_cookies(cookies: &Cookies) -> Option<Self> {
        Some(Self {
            access_token: non_empty(cookies, ACCESS_TOKEN_COOKIE)?,
            region: non_empty(cookies, REGION_COOKIE),
            vin: non_empty(cookies, VIN_COOKIE),
            user_id: non_empty(cookies, USER_ID_COOKIE),
        })
    }
}

/// A middleware that requires a bearer cookie to be present.
///
/// The recovered [`VendorSession`] is inserted into the request extensions.
pub async fn require_auth(
    State(_state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    tracing::debug!("🔐 Checking authentication...");

    let Some(session) = VendorSession::from_cookies(&cookies) else {
        return AppError::Authentication("No access_token cookie".to_string()).into_response();
    };

    tracing::debug!("✅ Bearer cookie present (vin: {:?})", session.vin);
    request.extensions_mut().insert(session);

    next.run(request).await
}
