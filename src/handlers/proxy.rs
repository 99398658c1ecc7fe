use axum::{
    body::{Body, Bytes},
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    config::Config,
    crypto::signer::{self, Signer},
    error::{AppError, Result},
    middleware_layer::auth::VendorSession,
    services::vendor,
    state::AppState,
};

/// Header naming the vehicle a call is about.
pub const VIN_HEADER: &str = "x-vin-code";
/// Header naming the vendor user (player) a call is made for.
pub const PLAYER_HEADER: &str = "x-player-identifier";

/// First segment of a normalized path, or `None` when the path tries to
/// walk upwards.
fn first_segment(normalized: &str) -> Option<&str> {
    let mut segments = normalized.trim_start_matches('/').split('/');
    let first = segments.next().filter(|s| !s.is_empty())?;
    if first == "." || first == ".." || segments.any(|s| s == "." || s == "..") {
        return None;
    }
    Some(first)
}

/// Whether `path` falls under one of `prefixes`.
///
/// Matching is by whole first segment: `ccarusermgnt/...` matches the
/// `ccarusermgnt` prefix but `ccarusermgnt-evil/...` does not.
pub fn is_allowed(path: &str, prefixes: &[String]) -> bool {
    let normalized = signer::normalize_path(path);
    match first_segment(&normalized) {
        Some(first) => prefixes.iter().any(|p| p == first),
        None => false,
    }
}

/// Splits the caller's query into the region selector and the query to
/// forward (everything except `region`).
fn split_query(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return (None, None);
    };

    let mut region = None;
    let mut forwarded = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("region", value)) => region = Some(value.to_string()),
            None if pair == "region" => {}
            _ => forwarded.push(pair),
        }
    }

    let forwarded = (!forwarded.is_empty()).then(|| forwarded.join("&"));
    (region, forwarded)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn signer_for(config: &Config) -> Result<Signer<'_>> {
    let primary = config.signing_secret.as_deref().ok_or_else(|| {
        AppError::Misconfigured("VF_SIGNING_SECRET is not set".to_string())
    })?;
    let secondary = config.secondary_secret.as_deref().ok_or_else(|| {
        AppError::Misconfigured("VF_SECONDARY_SECRET is not set".to_string())
    })?;

    Ok(Signer {
        primary_secret: primary.as_str(),
        secondary_secret: secondary.as_str(),
        platform: &config.platform,
    })
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| AppError::Validation(format!("Invalid value for {}", name)))?;
    headers.insert(name, value);
    Ok(())
}

/// Relays an allow-listed call to the vendor API.
///
/// The vendor's status and body come back unchanged; only the content type
/// header is carried over.
pub async fn proxy(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    incoming: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request_id = Uuid::new_v4();
    let config = state.config.clone();

    if !is_allowed(&path, &config.allowed_prefixes) {
        return Err(AppError::PathNotAllowed(path));
    }

    let session = VendorSession::from_cookies(&cookies)
        .ok_or_else(|| AppError::Authentication("No access_token cookie".to_string()))?;

    let normalized = signer::normalize_path(&path);
    let (region_param, forwarded_query) = split_query(query.as_deref());
    let (region_code, region) = config
        .region(region_param.as_deref().or(session.region.as_deref()))
        .ok_or_else(|| AppError::Misconfigured("No vendor region configured".to_string()))?;

    let vin = header_str(&incoming, VIN_HEADER).or_else(|| session.vin.clone());
    let player = header_str(&incoming, PLAYER_HEADER).or_else(|| session.user_id.clone());

    let mut headers = vendor::vendor_headers(&session.access_token)?;
    if let Some(vin) = &vin {
        insert_header(&mut headers, VIN_HEADER, vin)?;
    }
    if let Some(player) = &player {
        insert_header(&mut headers, PLAYER_HEADER, player)?;
    }

    let signed = first_segment(&normalized)
        .map(|first| config.signed_prefixes.iter().any(|p| p == first))
        .unwrap_or(false);

    if signed {
        let signer = signer_for(&config)?;
        let signature = signer.sign(
            method.as_str(),
            &normalized,
            vin.as_deref(),
            player.as_deref().unwrap_or_default(),
            Utc::now().timestamp_millis(),
        );
        insert_header(&mut headers, signer::PRIMARY_HEADER, &signature.primary)?;
        insert_header(&mut headers, signer::SECONDARY_HEADER, &signature.secondary)?;
        insert_header(
            &mut headers,
            signer::TIMESTAMP_HEADER,
            &signature.timestamp_ms.to_string(),
        )?;
    }

    let mut url = format!("{}{}", region.api_base, normalized);
    if let Some(q) = &forwarded_query {
        url.push('?');
        url.push_str(q);
    }

    tracing::debug!(
        %request_id,
        %method,
        path = %normalized,
        region = region_code,
        signed,
        "➡️  Proxying vendor call"
    );

    let mut outbound = state.http.request(method.clone(), &url).headers(headers);
    if method != Method::GET && method != Method::HEAD {
        outbound = outbound.body(body);
    }

    let upstream = {
        let _permit = state.upstream_limiter.acquire().await?;
        outbound
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("[{}] {}", request_id, e)))?
    };

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| AppError::Upstream(format!("[{}] {}", request_id, e)))?;

    tracing::info!(%request_id, %method, path = %normalized, status = status.as_u16(), "⬅️  Vendor responded");

    Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .map_err(|e| AppError::Internal(format!("Response build failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ALLOWED_PREFIXES;

    fn prefixes() -> Vec<String> {
        ALLOWED_PREFIXES.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn allows_listed_prefixes() {
        let p = prefixes();
        assert!(is_allowed("ccarusermgnt/api/v1/user-vehicle", &p));
        assert!(is_allowed("/ccaraccessmgmt/api/v1/telemetry/app/ping?x=1", &p));
        assert!(is_allowed("//ccarcharging//api/", &p));
    }

    #[test]
    fn rejects_lookalikes_and_traversal() {
        let p = prefixes();
        for bad in [
            "ccarusermgnt-evil/api",
            "ccarusermgntx",
            "evil/ccarusermgnt/api",
            "",
            "/",
            "ccarusermgnt/../admin",
            "../ccarusermgnt/api",
            "CCARUSERMGNT/api",
        ] {
            assert!(!is_allowed(bad, &p), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn region_is_stripped_from_forwarded_query() {
        assert_eq!(
            split_query(Some("region=us&page=2&size=100")),
            (Some("us".to_string()), Some("page=2&size=100".to_string()))
        );
        assert_eq!(split_query(Some("region=vn")), (Some("vn".to_string()), None));
        assert_eq!(split_query(None), (None, None));
        assert_eq!(split_query(Some("a=1")), (None, Some("a=1".to_string())));
    }
}
