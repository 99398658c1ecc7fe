use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_cookies::cookie::SameSite;
use tower_cookies::cookie::time::Duration;
use tower_cookies::{Cookie, Cookies};

use crate::{
    config::Config,
    error::{AppError, Result},
    middleware_layer::auth::VendorSession,
    models::session::*,
    services::vendor,
    state::AppState,
    validation::auth::*,
};

/// Lifetime of the bearer cookie, in seconds.
const ACCESS_TOKEN_MAX_AGE: i64 = 86_400;

/// The request payload for login.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub remember_me: bool,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("region", &self.region)
            .field("remember_me", &self.remember_me)
            .finish_non_exhaustive()
    }
}

/// The response payload for authentication-related requests.
#[derive(Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
}

/// Creates a cookie with the gateway's security attributes.
///
/// Everything except the metadata cookie is HttpOnly.
fn create_secure_cookie(
    config: &Config,
    name: &'static str,
    value: String,
    max_age_secs: i64,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);

    if name != SESSION_META_COOKIE {
        cookie.set_http_only(true);
    }

    if config.production {
        cookie.set_secure(true);
        cookie.set_same_site(SameSite::None);
    } else {
        cookie.set_same_site(SameSite::Lax);
    }

    cookie.set_max_age(Duration::seconds(max_age_secs));
    cookie.set_path("/");

    cookie
}

/// Expires every auth cookie.
fn clear_auth_cookies(cookies: &Cookies) {
    for name in [
        ACCESS_TOKEN_COOKIE,
        REFRESH_TOKEN_COOKIE,
        VIN_COOKIE,
        USER_ID_COOKIE,
        REGION_COOKIE,
        SESSION_META_COOKIE,
    ] {
        let mut cookie = Cookie::new(name, "");
        cookie.set_max_age(Duration::seconds(0));
        cookie.set_path("/");
        cookies.remove(cookie);
    }
}

/// Handles login: password grant, vehicle lookup, cookie issuance.
pub async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<LoginRequest>,
) -> Result<Response> {
    tracing::info!("🔐 Login attempt - Payload: {:?}", payload);
    validate_email(&payload.email)?;
    validate_password(&payload.password)?;

    let config = state.config.clone();
    let (region_code, region) = config
        .region(payload.region.as_deref())
        .ok_or_else(|| AppError::Misconfigured("No vendor region configured".to_string()))?;

    let tokens = vendor::authenticate(&state, region, payload.email.trim(), &payload.password).await?;
    tracing::info!("✅ Vendor tokens issued for region {}", region_code);

    let vehicles = vendor::list_vehicles(&state, region, &tokens.access_token)
        .await
        .map_err(|e| {
            tracing::error!("❌ Login succeeded but vehicle lookup failed: {}", e);
            AppError::Upstream("Login succeeded but failed to load vehicle data".to_string())
        })?;

    let first = vehicles.first();
    let vin = first.map(|v| v.vin_code.clone());
    let user_id = first.and_then(|v| v.user_id.clone());

    let metadata = SessionMetadata::issue(
        region_code,
        vin.clone(),
        user_id.clone(),
        payload.remember_me,
        Utc::now(),
        config.session_hours,
        config.remember_days,
    );
    let session_secs = metadata.remaining_secs(metadata.issued_at);

    cookies.add(create_secure_cookie(
        &config,
        ACCESS_TOKEN_COOKIE,
        tokens.access_token,
        ACCESS_TOKEN_MAX_AGE,
    ));
    if let Some(refresh) = tokens.refresh_token {
        cookies.add(create_secure_cookie(&config, REFRESH_TOKEN_COOKIE, refresh, session_secs));
    }
    cookies.add(create_secure_cookie(
        &config,
        REGION_COOKIE,
        region_code.to_string(),
        session_secs,
    ));
    if let Some(vin) = vin {
        cookies.add(create_secure_cookie(&config, VIN_COOKIE, vin, session_secs));
    }
    if let Some(user_id) = user_id {
        cookies.add(create_secure_cookie(&config, USER_ID_COOKIE, user_id, session_secs));
    }

    let meta_value = metadata
        .to_cookie_value()
        .map_err(|e| AppError::Internal(format!("Session metadata serialization failed: {}", e)))?;
    cookies.add(create_secure_cookie(&config, SESSION_META_COOKIE, meta_value, session_secs));

    tracing::info!("✅ Session cookies issued ({} vehicles)", vehicles.len());

    let response = AuthResponse {
        success: true,
        message: "Logged in successfully".to_string(),
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Handles logout by expiring every auth cookie.
pub async fn logout(cookies: Cookies) -> Result<Response> {
    clear_auth_cookies(&cookies);
    tracing::info!("👋 Session cookies cleared");

    let response = AuthResponse {
        success: true,
        message: "Logged out".to_string(),
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Handles a single refresh attempt using the refresh cookie.
///
/// Any failure clears the session so the client falls back to login.
pub async fn refresh(State(state): State<AppState>, cookies: Cookies) -> Result<Response> {
    let Some(refresh_token) = cookies
        .get(REFRESH_TOKEN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
    else {
        clear_auth_cookies(&cookies);
        return Err(AppError::Authentication("No refresh_token cookie".to_string()));
    };

    let config = state.config.clone();
    let region_cookie = cookies.get(REGION_COOKIE).map(|c| c.value().to_string());
    let (_, region) = config
        .region(region_cookie.as_deref())
        .ok_or_else(|| AppError::Misconfigured("No vendor region configured".to_string()))?;

    let tokens = match vendor::refresh(&state, region, &refresh_token).await {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!("❌ Token refresh failed, clearing session: {}", e);
            clear_auth_cookies(&cookies);
            return Err(AppError::Authentication("Refresh rejected".to_string()));
        }
    };

    cookies.add(create_secure_cookie(
        &config,
        ACCESS_TOKEN_COOKIE,
        tokens.access_token,
        ACCESS_TOKEN_MAX_AGE,
    ));

    if let Some(rotated) = tokens.refresh_token {
        let remaining = cookies
            .get(SESSION_META_COOKIE)
            .and_then(|c| SessionMetadata::from_cookie_value(c.value()))
            .map(|m| m.remaining_secs(Utc::now()))
            .unwrap_or(config.session_hours * 3600);
        cookies.add(create_secure_cookie(&config, REFRESH_TOKEN_COOKIE, rotated, remaining));
    }

    tracing::info!("✅ Access token refreshed");

    let response = AuthResponse {
        success: true,
        message: "Session refreshed".to_string(),
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Returns the OIDC profile of the signed-in user.
pub async fn user(
    State(state): State<AppState>,
    Extension(session): Extension<VendorSession>,
) -> Result<Response> {
    let (_, region) = state
        .config
        .region(session.region.as_deref())
        .ok_or_else(|| AppError::Misconfigured("No vendor region configured".to_string()))?;

    let profile = vendor::user_profile(&state, region, &session.access_token).await?;

    Ok((StatusCode::OK, Json(serde_json::json!({ "data": profile }))).into_response())
}
