use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// HttpOnly cookie holding the vendor bearer token.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
/// HttpOnly cookie holding the vendor refresh token.
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
pub const VIN_COOKIE: &str = "vin";
pub const USER_ID_COOKIE: &str = "user_id";
pub const REGION_COOKIE: &str = "region";
/// Script-readable cookie (and local-store key) with [`SessionMetadata`].
pub const SESSION_META_COOKIE: &str = "vf_session";

/// Non-sensitive facts about the signed-in session.
///
/// This is the only part of a session the dashboard can read. The bearer
/// and refresh tokens never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub region: String,
    #[serde(default)]
    pub remember_me: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl SessionMetadata {
    /// Builds metadata for a fresh session. Remembered sessions last
    /// `remember_days`, others `session_hours`.
    pub fn issue(
        region: &str,
        vin: Option<String>,
        user_id: Option<String>,
        remember_me: bool,
        now: DateTime<Utc>,
        session_hours: i64,
        remember_days: i64,
    ) -> Self {
        let lifetime = if remember_me {
            Duration::days(remember_days)
        } else {
            Duration::hours(session_hours)
        };
        Self {
            vin,
            user_id,
            region: region.to_string(),
            remember_me,
            issued_at: now,
            expires_at: now + lifetime,
        }
    }

    /// Seconds left until expiry, never negative.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Encodes the record as a cookie-safe value (URL-safe base64 of JSON).
    pub fn to_cookie_value(&self) -> Result<String, sonic_rs::Error> {
        let json = sonic_rs::to_string(self)?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    /// Decodes a cookie value; anything malformed is `None`.
    pub fn from_cookie_value(value: &str) -> Option<Self> {
        let bytes = general_purpose::URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        sonic_rs::from_slice(&bytes).ok()
    }
}
