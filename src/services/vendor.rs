use http::{HeaderMap, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RegionConfig;
use crate::error::{AppError, Result};
use crate::models::vehicle::{VehicleRecord, dedupe_vehicles};
use crate::state::AppState;

/// Vendor path of the user-vehicle listing.
pub const USER_VEHICLE_PATH: &str = "ccarusermgnt/api/v1/user-vehicle";

/// Headers the vendor's mobile app sends on every call.
const MOBILE_APP_HEADERS: &[(&str, &str)] = &[
    ("x-service-name", "CAPP"),
    ("x-app-version", "1.10.3"),
    ("x-device-platform", "VFDashBoard"),
    ("x-device-family", "Community"),
    ("x-device-os-version", "1.0"),
    ("x-device-locale", "en-US"),
    ("x-timezone", "Asia/Ho_Chi_Minh"),
    ("x-device-identifier", "vfdashboard-community-edition"),
];

/// Standard headers plus a bearer credential.
pub fn vendor_headers(access_token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in MOBILE_APP_HEADERS {
        headers.insert(*name, HeaderValue::from_static(value));
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

    let mut bearer = HeaderValue::from_str(&format!("Bearer {}", access_token))
        .map_err(|_| AppError::Authentication("Malformed access token".to_string()))?;
    bearer.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, bearer);

    Ok(headers)
}

/// Tokens issued by the region's OAuth tenant.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Maps a failed token-endpoint status to a user-presentable category.
fn classify_token_failure(status: StatusCode, body: &str) -> AppError {
    let lowered = body.to_lowercase();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            AppError::RateLimitExceeded("Vendor throttled login".to_string())
        }
        StatusCode::FORBIDDEN
            if lowered.contains("blocked") || lowered.contains("unauthorized_client") =>
        {
            AppError::Forbidden
        }
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            if lowered.contains("too_many_attempts") {
                AppError::RateLimitExceeded("Vendor locked the account temporarily".to_string())
            } else {
                AppError::Authentication(format!("Token endpoint returned {}", status))
            }
        }
        s => AppError::Upstream(format!("Token endpoint returned {}", s)),
    }
}

async fn request_token(state: &AppState, region: &RegionConfig, payload: Value) -> Result<TokenSet> {
    if region.client_id.is_empty() {
        return Err(AppError::Misconfigured(
            "OAuth client id for region is not set".to_string(),
        ));
    }

    let _permit = state.upstream_limiter.acquire().await?;
    let url = format!("{}/oauth/token", region.auth_base);
    let response = state.http.post(&url).json(&payload).send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_token_failure(status, &body));
    }

    response
        .json::<TokenSet>()
        .await
        .map_err(|e| AppError::Upstream(format!("Unexpected token response: {}", e)))
}

/// Password grant against the region's OAuth tenant.
pub async fn authenticate(
    state: &AppState,
    region: &RegionConfig,
    email: &str,
    password: &str,
) -> Result<TokenSet> {
    tracing::debug!("🔐 Requesting vendor tokens");
    request_token(
        state,
        region,
        serde_json::json!({
            "client_id": region.client_id,
            "audience": region.audience,
            "grant_type": "password",
            "scope": "offline_access openid profile email",
            "username": email,
            "password": password,
        }),
    )
    .await
}

/// Exchanges a refresh token for a new access token.
pub async fn refresh(state: &AppState, region: &RegionConfig, refresh_token: &str) -> Result<TokenSet> {
    tracing::debug!("🔄 Refreshing vendor access token");
    request_token(
        state,
        region,
        serde_json::json!({
            "client_id": region.client_id,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        }),
    )
    .await
}

fn classify_api_failure(status: StatusCode, what: &str) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED => AppError::Authentication(format!("{} returned 401", what)),
        StatusCode::FORBIDDEN => AppError::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimitExceeded(format!("{} throttled", what)),
        s => AppError::Upstream(format!("{} returned {}", what, s)),
    }
}

/// Lists the account's vehicles, de-duplicated by VIN.
pub async fn list_vehicles(
    state: &AppState,
    region: &RegionConfig,
    access_token: &str,
) -> Result<Vec<VehicleRecord>> {
    let _permit = state.upstream_limiter.acquire().await?;
    let url = format!("{}/{}", region.api_base, USER_VEHICLE_PATH);
    let response = state
        .http
        .get(&url)
        .headers(vendor_headers(access_token)?)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_api_failure(status, "user-vehicle"));
    }

    let json: Value = response
        .json()
        .await
        .map_err(|e| AppError::Upstream(format!("Unexpected user-vehicle response: {}", e)))?;

    let vehicles: Vec<VehicleRecord> = json
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match serde_json::from_value(item.clone()) {
                    Ok(vehicle) => Some(vehicle),
                    Err(e) => {
                        tracing::warn!("⚠️ Skipping unreadable vehicle entry: {}", e);
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(dedupe_vehicles(vehicles))
}

/// Fetches the OIDC profile. Returned verbatim so unknown claims survive.
pub async fn user_profile(state: &AppState, region: &RegionConfig, access_token: &str) -> Result<Value> {
    let _permit = state.upstream_limiter.acquire().await?;
    let url = format!("{}/userinfo", region.auth_base);
    let response = state.http.get(&url).bearer_auth(access_token).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_api_failure(status, "userinfo"));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::Upstream(format!("Unexpected userinfo response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_failures_map_to_categories() {
        assert!(matches!(
            classify_token_failure(StatusCode::FORBIDDEN, r#"{"error":"invalid_grant"}"#),
            AppError::Authentication(_)
        ));
        assert!(matches!(
            classify_token_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            AppError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            classify_token_failure(StatusCode::UNAUTHORIZED, r#"{"error":"too_many_attempts"}"#),
            AppError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            classify_token_failure(StatusCode::FORBIDDEN, r#"{"error":"unauthorized_client"}"#),
            AppError::Forbidden
        ));
        assert!(matches!(
            classify_token_failure(StatusCode::BAD_GATEWAY, ""),
            AppError::Upstream(_)
        ));
    }

    #[test]
    fn bearer_header_is_sensitive() {
        let headers = vendor_headers("tok").unwrap();
        let auth = headers.get(header::AUTHORIZATION).unwrap();
        assert!(auth.is_sensitive());
        assert_eq!(auth, "Bearer tok");
        assert_eq!(headers.get("x-service-name").unwrap(), "CAPP");
    }
}
