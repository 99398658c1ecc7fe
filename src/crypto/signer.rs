//! Request signatures expected by the vendor's mobile backend.
//!
//! Both signatures are HMAC-SHA256 over a lowercase, underscore-joined
//! message, base64-encoded. They are pure functions of their inputs so a
//! fixed secret and timestamp always reproduce the same headers.

use base64::{Engine as _, engine::general_purpose};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the primary signature.
pub const PRIMARY_HEADER: &str = "x-hash";
/// Header carrying the secondary signature.
pub const SECONDARY_HEADER: &str = "x-hash-2";
/// Header carrying the millisecond timestamp both signatures were made with.
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Normalizes a request path for signing and forwarding.
///
/// Strips the query string, collapses duplicate slashes, drops a trailing
/// slash and enforces exactly one leading slash. Idempotent.
pub fn normalize_path(path: &str) -> String {
    let without_query = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = without_query.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn hmac_base64(key: &[u8], message: &str) -> String {
    // HMAC accepts any key length
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Computes the primary `X-HASH` signature.
///
/// Message: `method_path[_vehicleId]_secret_timestamp`, lowercased.
pub fn compute_signature(
    method: &str,
    path: &str,
    vehicle_id: Option<&str>,
    secret: &str,
    timestamp_ms: i64,
) -> String {
    let path = normalize_path(path);
    let timestamp = timestamp_ms.to_string();

    let mut parts: Vec<&str> = vec![method, &path];
    if let Some(vin) = vehicle_id.filter(|v| !v.is_empty()) {
        parts.push(vin);
    }
    parts.push(secret);
    parts.push(&timestamp);

    hmac_base64(secret.as_bytes(), &parts.join("_").to_lowercase())
}

/// Computes the secondary `X-HASH-2` signature.
///
/// Message: `platform[_vehicleId]_playerId_path_method_timestamp`, lowercased,
/// where `path` has its leading slash removed and remaining slashes turned
/// into underscores.
pub fn compute_secondary_signature(
    platform: &str,
    vehicle_id: Option<&str>,
    player_id: &str,
    path: &str,
    method: &str,
    secret: &str,
    timestamp_ms: i64,
) -> String {
    let path = normalize_path(path);
    let flat_path = path.trim_start_matches('/').replace('/', "_");
    let timestamp = timestamp_ms.to_string();

    let mut parts: Vec<&str> = vec![platform];
    if let Some(vin) = vehicle_id.filter(|v| !v.is_empty()) {
        parts.push(vin);
    }
    parts.push(player_id);
    parts.push(&flat_path);
    parts.push(method);
    parts.push(&timestamp);

    hmac_base64(secret.as_bytes(), &parts.join("_").to_lowercase())
}

/// The three headers attached to a signed vendor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub primary: String,
    pub secondary: String,
    pub timestamp_ms: i64,
}

/// Secrets and identity used to sign calls.
pub struct Signer<'a> {
    pub primary_secret: &'a str,
    pub secondary_secret: &'a str,
    pub platform: &'a str,
}

impl Signer<'_> {
    /// Signs one request. `vehicle_id` must be exactly what is sent in
    /// `x-vin-code`, or `None` when that header is absent.
    pub fn sign(
        &self,
        method: &str,
        path: &str,
        vehicle_id: Option<&str>,
        player_id: &str,
        timestamp_ms: i64,
    ) -> SignedHeaders {
        SignedHeaders {
            primary: compute_signature(method, path, vehicle_id, self.primary_secret, timestamp_ms),
            secondary: compute_secondary_signature(
                self.platform,
                vehicle_id,
                player_id,
                path,
                method,
                self.secondary_secret,
                timestamp_ms,
            ),
            timestamp_ms,
        }
    }
}
