use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Vendor path prefixes the proxy is willing to relay.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "ccarusermgnt",
    "ccaraccessmgmt",
    "ccarcharging",
    "modelmgmt",
];

/// Prefixes whose calls must carry `X-HASH` / `X-HASH-2`.
pub const SIGNED_PREFIXES: &[&str] = &["ccaraccessmgmt", "ccarcharging", "modelmgmt"];

/// Endpoints of one vendor region.
#[derive(Clone, Debug)]
pub struct RegionConfig {
    /// Base URL of the vehicle API (no trailing slash).
    pub api_base: String,
    /// Base URL of the OAuth tenant (no trailing slash).
    pub auth_base: String,
    pub client_id: String,
    pub audience: String,
}

/// Business codes and message fragments that mean "session expired" even
/// when the vendor answers 200.
#[derive(Clone, Debug)]
pub struct SessionExpiryRules {
    pub codes: Vec<i64>,
    pub message_fragments: Vec<String>,
}

impl Default for SessionExpiryRules {
    fn default() -> Self {
        Self {
            codes: vec![401, 10004],
            message_fragments: vec!["token expired".to_string(), "session expired".to_string()],
        }
    }
}

impl SessionExpiryRules {
    /// Returns `true` when `code` or `message` matches one of the rules.
    pub fn matches(&self, code: Option<i64>, message: Option<&str>) -> bool {
        if let Some(code) = code {
            if self.codes.contains(&code) {
                return true;
            }
        }
        match message {
            Some(msg) => {
                let msg = msg.to_lowercase();
                self.message_fragments
                    .iter()
                    .any(|fragment| msg.contains(&fragment.to_lowercase()))
            }
            None => false,
        }
    }
}

/// Burst limit applied to the login route per client IP.
#[derive(Clone, Copy, Debug)]
pub struct LoginRateLimit {
    /// Seconds for one attempt to replenish.
    pub period_secs: u64,
    pub burst: u32,
}

/// The gateway's configuration.
#[derive(Clone)]
pub struct Config {
    /// The address the gateway listens on.
    pub bind_addr: SocketAddr,
    /// Whether cookies are issued with `Secure` and `SameSite=None`.
    pub production: bool,
    /// Region used when a request names none or an unknown one.
    pub default_region: String,
    /// Vendor endpoints keyed by region code.
    pub regions: HashMap<String, RegionConfig>,
    /// Secret for the primary `X-HASH` signature.
    pub signing_secret: Option<Zeroizing<String>>,
    /// Secret for the secondary `X-HASH-2` signature.
    pub secondary_secret: Option<Zeroizing<String>>,
    /// Platform identifier folded into the secondary signature.
    pub platform: String,
    pub allowed_prefixes: Vec<String>,
    pub signed_prefixes: Vec<String>,
    /// Lifetime of a default session, in hours.
    pub session_hours: i64,
    /// Lifetime of a remembered session, in days.
    pub remember_days: i64,
    /// Origins allowed to call the gateway with credentials.
    pub cors_origins: Vec<String>,
    pub expiry_rules: SessionExpiryRules,
    /// `None` disables login rate limiting.
    pub login_rate_limit: Option<LoginRateLimit>,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        let default_region = env::var("DEFAULT_REGION").unwrap_or_else(|_| "vn".to_string());

        let mut regions = HashMap::new();
        for (code, defaults) in builtin_regions() {
            let upper = code.to_uppercase();
            let region = RegionConfig {
                api_base: env::var(format!("VF_{}_API_BASE", upper)).unwrap_or(defaults.api_base),
                auth_base: env::var(format!("VF_{}_AUTH_BASE", upper))
                    .unwrap_or(defaults.auth_base),
                client_id: env::var(format!("VF_{}_CLIENT_ID", upper))
                    .unwrap_or(defaults.client_id),
                audience: env::var(format!("VF_{}_AUDIENCE", upper)).unwrap_or(defaults.audience),
            };
            if region.client_id.is_empty() {
                tracing::warn!("⚠️  VF_{}_CLIENT_ID is not set, logins for '{}' will be rejected", upper, code);
            }
            regions.insert(code.to_string(), region);
        }

        if !regions.contains_key(&default_region) {
            anyhow::bail!("DEFAULT_REGION '{}' is not a known region", default_region);
        }

        let signing_secret = env::var("VF_SIGNING_SECRET").ok().map(Zeroizing::new);
        let secondary_secret = env::var("VF_SECONDARY_SECRET").ok().map(Zeroizing::new);

        let expiry_rules = match (env::var("VF_EXPIRED_CODES"), env::var("VF_EXPIRED_MESSAGES")) {
            (Err(_), Err(_)) => SessionExpiryRules::default(),
            (codes, messages) => {
                let defaults = SessionExpiryRules::default();
                SessionExpiryRules {
                    codes: match codes {
                        Ok(raw) => parse_list(&raw)
                            .into_iter()
                            .map(|c| c.parse::<i64>())
                            .collect::<std::result::Result<_, _>>()
                            .context("VF_EXPIRED_CODES must be a comma-separated list of integers")?,
                        Err(_) => defaults.codes,
                    },
                    message_fragments: match messages {
                        Ok(raw) => parse_list(&raw),
                        Err(_) => defaults.message_fragments,
                    },
                }
            }
        };

        Ok(Self {
            bind_addr: env::var("BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
                .parse()
                .context("Invalid BIND_ADDR")?,
            production: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string())
                == "production",
            default_region,
            regions,
            signing_secret,
            secondary_secret,
            platform: env::var("VF_PLATFORM").unwrap_or_else(|_| "android".to_string()),
            allowed_prefixes: ALLOWED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            signed_prefixes: SIGNED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            session_hours: env::var("SESSION_HOURS")
                .unwrap_or_else(|_| "12".to_string())
                .parse()
                .context("Invalid SESSION_HOURS")?,
            remember_days: env::var("REMEMBER_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid REMEMBER_DAYS")?,
            cors_origins: parse_list(
                &env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:4321".to_string()),
            ),
            expiry_rules,
            login_rate_limit: Some(LoginRateLimit {
                period_secs: env::var("LOGIN_PERIOD_SECS")
                    .unwrap_or_else(|_| "12".to_string())
                    .parse()
                    .context("Invalid LOGIN_PERIOD_SECS")?,
                burst: env::var("LOGIN_BURST")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("Invalid LOGIN_BURST")?,
            }),
        })
    }

    /// Looks up a region, falling back to the default region.
    ///
    /// Returns `None` only when no region is configured at all.
    pub fn region(&self, code: Option<&str>) -> Option<(&str, &RegionConfig)> {
        code.and_then(|code| self.regions.get_key_value(code))
            .or_else(|| self.regions.get_key_value(&self.default_region))
            .map(|(key, region)| (key.as_str(), region))
    }

    /// A configuration pointing every region at `base`, used by tests that
    /// stand up a mock vendor.
    pub fn for_mock_vendor(base: &str) -> Self {
        let region = RegionConfig {
            api_base: base.trim_end_matches('/').to_string(),
            auth_base: base.trim_end_matches('/').to_string(),
            client_id: "test-client".to_string(),
            audience: "https://vendor.test/api".to_string(),
        };
        let regions = ["vn", "us", "eu"]
            .into_iter()
            .map(|code| (code.to_string(), region.clone()))
            .collect();

        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            production: false,
            default_region: "vn".to_string(),
            regions,
            signing_secret: Some(Zeroizing::new("test-primary-secret".to_string())),
            secondary_secret: Some(Zeroizing::new("test-secondary-secret".to_string())),
            platform: "android".to_string(),
            allowed_prefixes: ALLOWED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            signed_prefixes: SIGNED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            session_hours: 12,
            remember_days: 30,
            cors_origins: vec!["http://localhost:4321".to_string()],
            expiry_rules: SessionExpiryRules::default(),
            login_rate_limit: None,
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn builtin_regions() -> Vec<(&'static str, RegionConfig)> {
    vec![
        (
            "vn",
            RegionConfig {
                api_base: "https://mobile.connected-car.vinfast.vn".to_string(),
                auth_base: "https://vin3s.au.auth0.com".to_string(),
                client_id: String::new(),
                audience: "https://vin3s.au.auth0.com/api/v2/".to_string(),
            },
        ),
        (
            "us",
            RegionConfig {
                api_base: "https://mobile.connected-car.vinfastauto.us".to_string(),
                auth_base: "https://vinfast-us-prod.us.auth0.com".to_string(),
                client_id: String::new(),
                audience: "https://vinfast-us-prod.us.auth0.com/api/v2/".to_string(),
            },
        ),
        (
            "eu",
            RegionConfig {
                api_base: "https://mobile.connected-car.vinfastauto.eu".to_string(),
                auth_base: "https://vinfast-eu-prod.eu.auth0.com".to_string(),
                client_id: String::new(),
                audience: "https://vinfast-eu-prod.eu.auth0.com/api/v2/".to_string(),
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_region_falls_back_to_default() {
        let config = Config::for_mock_vendor("http://vendor.test");
        let (code, _) = config.region(Some("mars")).unwrap();
        assert_eq!(code, "vn");
        let (code, _) = config.region(None).unwrap();
        assert_eq!(code, "vn");
        let (code, _) = config.region(Some("us")).unwrap();
        assert_eq!(code, "us");
    }

    #[test]
    fn expiry_rules_match_code_or_message() {
        let rules = SessionExpiryRules::default();
        assert!(rules.matches(Some(10004), None));
        assert!(rules.matches(None, Some("Access Token Expired, please login")));
        assert!(!rules.matches(Some(200), Some("ok")));
        assert!(!rules.matches(None, None));
    }
}
