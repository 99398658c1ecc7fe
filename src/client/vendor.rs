use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, Url};
use serde_json::{Value, json};

use super::enrichment::{self, Enricher};
use super::error::ClientError;
use super::session::SessionManager;
use super::storage::LocalStore;
use crate::config::SessionExpiryRules;
use crate::handlers::proxy::{PLAYER_HEADER, VIN_HEADER};
use crate::models::charging::{ChargingStation, HistoryPage, parse_stations};
use crate::models::lenient::value_as_f64;
use crate::models::session::{SESSION_META_COOKIE, SessionMetadata};
use crate::models::telemetry::{
    AliasEntry, Enrichment, FullTelemetry, ResourceId, TelemetryReading, TelemetrySnapshot,
    alias_requests, core_request, parse_telemetry,
};
use crate::models::vehicle::{UserProfile, VehicleRecord, dedupe_vehicles};
use crate::services::vendor::USER_VEHICLE_PATH;
use crate::sync::source::{ChargingHistorySource, StationSource, TelemetrySource};

pub const TELEMETRY_PING_PATH: &str = "ccaraccessmgmt/api/v1/telemetry/app/ping";
pub const RAW_TELEMETRY_PATH: &str = "ccaraccessmgmt/api/v1/telemetry/list_resource";
pub const ALIAS_PATH: &str = "modelmgmt/api/v2/vehicle-model/mobile-app/vehicle/get-alias";
pub const STATION_SEARCH_PATH: &str = "ccarcharging/api/v1/stations/search";
pub const HISTORY_SEARCH_PATH: &str = "ccarcharging/api/v1/charging-sessions/search";

/// Alias catalog version every vehicle model is expected to have.
pub const FALLBACK_ALIAS_VERSION: &str = "1.0";
/// Search radius for nearby stations, in metres.
const STATION_RADIUS_M: u32 = 20_000;
/// Order statuses of finished charging sessions.
const FINISHED_ORDER_STATUSES: [u32; 3] = [3, 5, 7];

/// Settings for a [`VendorClient`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Base URL of the gateway.
    pub gateway_url: String,
    pub default_region: String,
    pub expiry_rules: SessionExpiryRules,
    pub geocode_base: String,
    pub weather_base: String,
    pub lookup_timeout: Duration,
    /// Used for the local session record when the gateway's metadata cookie
    /// cannot be read.
    pub session_hours: i64,
    pub remember_days: i64,
}

impl ClientOptions {
    pub fn new(gateway_url: &str) -> Self {
        Self {
            gateway_url: gateway_url.to_string(),
            default_region: "vn".to_string(),
            expiry_rules: SessionExpiryRules::default(),
            geocode_base: enrichment::DEFAULT_GEOCODE_BASE.to_string(),
            weather_base: enrichment::DEFAULT_WEATHER_BASE.to_string(),
            lookup_timeout: enrichment::DEFAULT_LOOKUP_TIMEOUT,
            session_hours: 12,
            remember_days: 30,
        }
    }
}

/// Typed access to the vendor API through the gateway.
///
/// Credentials live in the gateway's HttpOnly cookies, held by this
/// client's cookie jar; the client itself only ever sees
/// [`SessionMetadata`].
pub struct VendorClient {
    http: reqwest::Client,
    jar: Arc<Jar>,
    gateway: Url,
    options: ClientOptions,
    session: SessionManager,
    enricher: Enricher,
}

fn proxy_path(vendor_path: &str) -> String {
    format!("api/proxy/{}", vendor_path)
}

/// Pulls the array of items out of `{data: [..]}` or `{data: {<key>: [..]}}`.
fn data_array<'a>(json: &'a Value, nested_key: &str) -> Option<&'a Vec<Value>> {
    let data = json.get("data")?;
    data.as_array()
        .or_else(|| data.get(nested_key).and_then(Value::as_array))
}

impl VendorClient {
    pub fn new(options: ClientOptions, storage: Arc<dyn LocalStore>) -> Result<Self, ClientError> {
        let gateway = Url::parse(&format!("{}/", options.gateway_url.trim_end_matches('/')))
            .map_err(|e| ClientError::Network(format!("Invalid gateway URL: {}", e)))?;

        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .timeout(Duration::from_secs(30))
            .build()?;

        let enricher = Enricher::with_endpoints(
            http.clone(),
            &options.geocode_base,
            &options.weather_base,
            options.lookup_timeout,
        );

        Ok(Self {
            http,
            jar,
            gateway,
            options,
            session: SessionManager::new(storage),
            enricher,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.gateway
            .join(path)
            .map_err(|e| ClientError::Network(format!("Invalid request path {}: {}", path, e)))
    }

    fn region(&self) -> String {
        self.session
            .auth()
            .read(|a| a.region.clone())
            .unwrap_or_else(|| self.options.default_region.clone())
    }

    /// The metadata cookie as currently held by the jar.
    fn metadata_from_jar(&self) -> Option<SessionMetadata> {
        let header = self.jar.cookies(&self.gateway)?;
        let header = header.to_str().ok()?;
        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_META_COOKIE)
            .and_then(|(_, value)| SessionMetadata::from_cookie_value(value))
    }

    /// The stored session, falling back to the gateway's metadata cookie.
    pub fn restore_session(&self) -> Option<SessionMetadata> {
        if let Some(metadata) = self.session.restore_session() {
            return Some(metadata);
        }
        let metadata = self.metadata_from_jar().filter(|m| !m.is_expired(Utc::now()))?;
        if let Err(e) = self.session.save(&metadata) {
            tracing::warn!("⚠️ Could not persist session from cookie: {}", e);
        }
        Some(metadata)
    }

    /// Signs in through the gateway and stores the resulting session.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
        region: &str,
        remember_me: bool,
    ) -> Result<SessionMetadata, ClientError> {
        tracing::info!("🔐 Signing in (region {})", region);

        let response = self
            .http
            .post(self.url("api/login")?)
            .json(&json!({
                "email": email,
                "password": password,
                "region": region,
                "rememberMe": remember_me,
            }))
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            tracing::warn!("❌ Sign-in rejected with status {}", status);
            return Err(match status {
                400 => ClientError::InvalidCredentials,
                status => ClientError::from_status(status),
            });
        }

        let metadata = self.metadata_from_jar().unwrap_or_else(|| {
            SessionMetadata::issue(
                region,
                None,
                None,
                remember_me,
                Utc::now(),
                self.options.session_hours,
                self.options.remember_days,
            )
        });
        self.session.save(&metadata)?;

        tracing::info!("✅ Signed in, session valid until {}", metadata.expires_at);
        Ok(metadata)
    }

    /// Ends the session locally and at the gateway.
    pub async fn logout(&self) {
        match self.url("api/logout") {
            Ok(url) => {
                if let Err(e) = self.http.post(url).send().await {
                    tracing::warn!("⚠️ Gateway logout failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("⚠️ {}", e),
        }
        self.session.clear();
        tracing::info!("👋 Signed out");
    }

    async fn refresh_access(&self) -> bool {
        let Ok(url) = self.url("api/refresh") else {
            return false;
        };
        match self.http.post(url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("🔄 Access token refreshed");
                true
            }
            Ok(response) => {
                tracing::warn!("❌ Refresh rejected with status {}", response.status());
                false
            }
            Err(e) => {
                tracing::warn!("❌ Refresh failed: {}", e);
                false
            }
        }
    }

    fn indicates_expired_session(&self, json: &Value) -> bool {
        let code = ["code", "errorCode", "status"]
            .into_iter()
            .find_map(|key| json.get(key).and_then(value_as_f64))
            .map(|c| c as i64);
        let message = ["message", "error"]
            .into_iter()
            .find_map(|key| json.get(key).and_then(Value::as_str));
        self.options.expiry_rules.matches(code, message)
    }

    /// Sends one gateway call, refreshing once when the session has expired.
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        vin: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        if !self.session.auth().read(|a| a.authenticated) {
            return Err(ClientError::NotAuthenticated);
        }

        let mut refreshed = false;
        loop {
            let mut request = self
                .http
                .request(method.clone(), self.url(path)?)
                .query(&[("region", self.region())])
                .query(query);
            if let Some(vin) = vin {
                request = request.header(VIN_HEADER, vin);
            }
            if let Some(player) = self.session.auth().read(|a| a.user_id.clone()) {
                request = request.header(PLAYER_HEADER, player);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            let json = if status == reqwest::StatusCode::UNAUTHORIZED {
                None
            } else if status.is_success() {
                let bytes = response.bytes().await?;
                let json = if bytes.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))?
                };
                Some(json).filter(|j| !self.indicates_expired_session(j))
            } else {
                tracing::warn!("❌ {} {} failed with status {}", method, path, status);
                return Err(ClientError::from_status(status.as_u16()));
            };

            if let Some(json) = json {
                return Ok(json);
            }
            if !refreshed && self.refresh_access().await {
                refreshed = true;
                continue;
            }

            tracing::warn!("🔒 Session expired, sign-in required");
            self.session.expire();
            return Err(ClientError::SessionExpired);
        }
    }

    /// Lists the account's vehicles. The first one becomes the session's
    /// vehicle unless the session already points at one of them.
    pub async fn list_vehicles(&self) -> Result<Vec<VehicleRecord>, ClientError> {
        let json = self
            .call(Method::GET, &proxy_path(USER_VEHICLE_PATH), &[], None, None)
            .await?;

        let vehicles: Vec<VehicleRecord> = data_array(&json, "content")
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let vehicles = dedupe_vehicles(vehicles);

        let current = self.session.auth().read(|a| a.vin.clone());
        let keeps_current = current
            .as_deref()
            .is_some_and(|vin| vehicles.iter().any(|v| v.vin_code == vin));
        if let (false, Some(first)) = (keeps_current, vehicles.first()) {
            self.session
                .set_active_vehicle(Some(first.vin_code.clone()), first.user_id.clone())?;
        }

        tracing::debug!("🚗 {} vehicles listed", vehicles.len());
        Ok(vehicles)
    }

    pub async fn get_user_profile(&self) -> Result<UserProfile, ClientError> {
        let json = self.call(Method::GET, "api/user", &[], None, None).await?;
        let data = json.get("data").cloned().unwrap_or(json);
        serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Core telemetry for `vin`, mapped onto a snapshot. An unrecognised
    /// envelope yields an empty snapshot.
    pub async fn get_telemetry_core(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError> {
        let (requests, lookup) = core_request();
        let body = serde_json::to_value(&requests).map_err(|e| ClientError::Decode(e.to_string()))?;

        let json = self
            .call(Method::POST, &proxy_path(TELEMETRY_PING_PATH), &[], Some(vin), Some(&body))
            .await?;

        let readings: Vec<TelemetryReading> = match json.get("data").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            None => {
                tracing::warn!("⚠️ Telemetry response for {} had no data array", vin);
                Vec::new()
            }
        };

        Ok(parse_telemetry(vin, &readings, &lookup))
    }

    pub async fn enrich(&self, lat: f64, lon: f64) -> Enrichment {
        self.enricher.enrich(lat, lon).await
    }

    /// Core telemetry with location and weather folded in.
    pub async fn get_telemetry(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError> {
        let mut snapshot = self.get_telemetry_core(vin).await?;
        if let Some((lat, lon)) = snapshot.position() {
            snapshot.apply_enrichment(self.enrich(lat, lon).await);
        }
        Ok(snapshot)
    }

    pub async fn get_aliases(&self, vin: &str, version: &str) -> Result<Vec<AliasEntry>, ClientError> {
        let json = self
            .call(
                Method::GET,
                &proxy_path(ALIAS_PATH),
                &[("version", version.to_string())],
                Some(vin),
                None,
            )
            .await?;

        Ok(data_array(&json, "resources")
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Raw values for `resources`, unmapped.
    pub async fn get_raw_telemetry(
        &self,
        vin: &str,
        resources: &[ResourceId],
    ) -> Result<Vec<Value>, ClientError> {
        let body = serde_json::to_value(resources).map_err(|e| ClientError::Decode(e.to_string()))?;
        let json = self
            .call(Method::POST, &proxy_path(RAW_TELEMETRY_PATH), &[], Some(vin), Some(&body))
            .await?;

        Ok(json
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Every alias of the vehicle's model with its raw value. Falls back to
    /// catalog `1.0` when `alias_version` yields nothing.
    pub async fn get_full_telemetry(
        &self,
        vin: &str,
        alias_version: &str,
    ) -> Result<FullTelemetry, ClientError> {
        let mut version = alias_version.to_string();
        let mut aliases = match self.get_aliases(vin, &version).await {
            Ok(aliases) => aliases,
            Err(e) if version != FALLBACK_ALIAS_VERSION => {
                tracing::warn!("⚠️ Alias catalog {} failed: {}", version, e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if aliases.is_empty() && version != FALLBACK_ALIAS_VERSION {
            tracing::info!("No aliases for catalog {}, trying {}", version, FALLBACK_ALIAS_VERSION);
            version = FALLBACK_ALIAS_VERSION.to_string();
            aliases = self.get_aliases(vin, &version).await?;
        }

        if aliases.is_empty() {
            return Err(ClientError::NoData("No aliases found for vehicle".to_string()));
        }

        let raw = self.get_raw_telemetry(vin, &alias_requests(&aliases)).await?;
        tracing::debug!("📡 Full telemetry for {}: {} aliases, {} values", vin, aliases.len(), raw.len());

        Ok(FullTelemetry {
            alias_version: version,
            aliases,
            raw,
        })
    }

    pub async fn search_charging_stations(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<ChargingStation>, ClientError> {
        let body = json!({
            "latitude": lat,
            "longitude": lon,
            "radius": STATION_RADIUS_M,
        });
        let json = self
            .call(Method::POST, &proxy_path(STATION_SEARCH_PATH), &[], None, Some(&body))
            .await?;
        Ok(parse_stations(&json))
    }

    pub async fn search_charging_history(
        &self,
        vin: &str,
        page: u32,
        size: u32,
    ) -> Result<HistoryPage, ClientError> {
        let body = json!({ "orderStatus": FINISHED_ORDER_STATUSES });
        let json = self
            .call(
                Method::POST,
                &proxy_path(HISTORY_SEARCH_PATH),
                &[("page", page.to_string()), ("size", size.to_string())],
                Some(vin),
                Some(&body),
            )
            .await?;
        Ok(HistoryPage::parse(&json))
    }
}

#[async_trait]
impl TelemetrySource for VendorClient {
    async fn vehicles(&self) -> Result<Vec<VehicleRecord>, ClientError> {
        self.list_vehicles().await
    }

    async fn user_profile(&self) -> Result<UserProfile, ClientError> {
        self.get_user_profile().await
    }

    async fn core_telemetry(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError> {
        self.get_telemetry_core(vin).await
    }

    async fn enrichment(&self, lat: f64, lon: f64) -> Enrichment {
        self.enrich(lat, lon).await
    }

    async fn full_telemetry(
        &self,
        vin: &str,
        alias_version: &str,
    ) -> Result<FullTelemetry, ClientError> {
        self.get_full_telemetry(vin, alias_version).await
    }
}

#[async_trait]
impl ChargingHistorySource for VendorClient {
    async fn history_page(&self, vin: &str, page: u32, size: u32) -> Result<HistoryPage, ClientError> {
        self.search_charging_history(vin, page, size).await
    }
}

#[async_trait]
impl StationSource for VendorClient {
    async fn stations_near(&self, lat: f64, lon: f64) -> Result<Vec<ChargingStation>, ClientError> {
        self.search_charging_stations(lat, lon).await
    }
}
