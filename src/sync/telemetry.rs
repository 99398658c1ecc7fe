use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};

use super::coalesce::InFlight;
use super::source::TelemetrySource;
use super::store::Store;
use crate::client::error::ClientError;
use crate::models::telemetry::{AliasEntry, FullTelemetry, TelemetrySnapshot, deep_scan};
use crate::models::vehicle::{VehicleRecord, dedupe_vehicles};

/// How long a full telemetry scan stays fresh.
pub const FULL_TELEMETRY_TTL_SECS: i64 = 5 * 60;

/// Load phase of one vehicle's telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPhase {
    #[default]
    Uninitialized,
    Loading,
    Ready,
}

/// Reference data and last known telemetry for one vehicle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VehicleCacheEntry {
    pub info: Option<VehicleRecord>,
    pub telemetry: Option<TelemetrySnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullTelemetryEntry {
    pub telemetry: FullTelemetry,
    pub fetched_at: DateTime<Utc>,
}

/// Everything the dashboard renders about vehicles.
#[derive(Debug, Clone, Default)]
pub struct VehicleState {
    pub vehicles: Vec<VehicleRecord>,
    pub active_vin: Option<String>,
    pub active_info: Option<VehicleRecord>,
    /// Live view of the active vehicle.
    pub live: TelemetrySnapshot,
    pub cache: HashMap<String, VehicleCacheEntry>,
    pub phases: HashMap<String, LoadPhase>,
    /// At least one telemetry fetch is pending.
    pub is_refreshing: bool,
    pub is_enriching: bool,
    pub is_initialized: bool,
    pub user_name: Option<String>,
    pub user_avatar: Option<String>,
    pub full_telemetry: HashMap<String, FullTelemetryEntry>,
    pub is_scanning: bool,
    /// Deep-scan candidates from the last full scan.
    pub debug_log: Vec<AliasEntry>,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl VehicleState {
    pub fn phase(&self, vin: &str) -> LoadPhase {
        self.phases.get(vin).copied().unwrap_or_default()
    }

    fn cached_telemetry(&self, vin: &str) -> Option<&TelemetrySnapshot> {
        self.cache.get(vin).and_then(|e| e.telemetry.as_ref())
    }
}

struct Inner {
    source: Arc<dyn TelemetrySource>,
    store: Store<VehicleState>,
    in_flight: InFlight<Result<TelemetrySnapshot, ClientError>>,
    pending: AtomicUsize,
}

/// Keeps [`VehicleState`] in step with the vendor.
///
/// Concurrent fetches for one VIN share a single vendor call. Results land
/// in the VIN's cache entry and reach the live view only while that VIN is
/// still the active one.
#[derive(Clone)]
pub struct TelemetrySynchronizer {
    inner: Arc<Inner>,
}

impl TelemetrySynchronizer {
    pub fn new(source: Arc<dyn TelemetrySource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store: Store::default(),
                in_flight: InFlight::new(),
                pending: AtomicUsize::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Store<VehicleState> {
        &self.inner.store
    }

    pub fn state(&self) -> VehicleState {
        self.inner.store.get()
    }

    /// Applies a snapshot for `vin`. See [`TelemetrySynchronizer`].
    pub fn update_vehicle_data(&self, vin: &str, snapshot: TelemetrySnapshot) -> TelemetrySnapshot {
        self.inner.update_vehicle_data(vin, snapshot)
    }

    /// Fetches telemetry for `vin`, joining a fetch already in flight.
    pub async fn fetch_telemetry(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError> {
        let inner = self.inner.clone();
        let key = vin.to_string();
        self.inner
            .in_flight
            .run(vin, move || async move { inner.fetch_and_apply(&key).await })
            .await
    }

    /// Makes `vin` the active vehicle.
    ///
    /// The live view is replaced in one step, from cached telemetry when
    /// there is some and from a neutral snapshot otherwise; in the latter
    /// case this waits for a fetch.
    pub async fn switch_vehicle(&self, vin: &str) -> Result<(), ClientError> {
        let switched = self.inner.store.update(|s| {
            let info = s.vehicles.iter().find(|v| v.vin_code == vin).cloned()?;
            let cached = s.cached_telemetry(vin).cloned();
            let has_cache = cached.is_some();

            if let Some(image) = info.profile_image.clone() {
                s.user_avatar = Some(image);
            }
            s.active_vin = Some(vin.to_string());
            s.active_info = Some(info);
            s.live = cached.unwrap_or_else(|| TelemetrySnapshot::neutral(vin));
            s.last_updated = s.live.last_updated;
            s.error = None;
            if !has_cache {
                s.phases.insert(vin.to_string(), LoadPhase::Loading);
            }
            Some(has_cache)
        });

        match switched {
            None => {
                tracing::warn!("⚠️ Cannot switch to unknown vehicle {}", vin);
                Err(ClientError::UnknownVehicle(vin.to_string()))
            }
            Some(true) => {
                tracing::debug!("🚗 Switched to {} from cache", vin);
                Ok(())
            }
            Some(false) => {
                tracing::debug!("🚗 Switched to {}, fetching telemetry", vin);
                self.fetch_telemetry(vin).await.map(|_| ())
            }
        }
    }

    /// Drops cached telemetry (keeping reference data) and refetches `vin`.
    pub async fn refresh_vehicle(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError> {
        self.inner.store.update(|s| {
            for entry in s.cache.values_mut() {
                entry.telemetry = None;
            }
            for phase in s.phases.values_mut() {
                *phase = LoadPhase::Uninitialized;
            }
            if s.active_vin.as_deref() == Some(vin) {
                s.live = TelemetrySnapshot::neutral(vin);
                s.last_updated = None;
            }
            s.phases.insert(vin.to_string(), LoadPhase::Loading);
        });
        self.fetch_telemetry(vin).await
    }

    /// Loads the vehicle list and activates the first vehicle unless the
    /// active one is still listed. Returns the active VIN.
    pub async fn fetch_vehicles(&self) -> Result<Option<String>, ClientError> {
        let vehicles = match self.inner.source.vehicles().await {
            Ok(vehicles) => dedupe_vehicles(vehicles),
            Err(e) => {
                tracing::error!("❌ Vehicle list failed: {}", e);
                self.inner.store.update(|s| s.error = Some(e.to_string()));
                return Err(e);
            }
        };

        let target = self.inner.store.update(|s| {
            for vehicle in &vehicles {
                s.cache.entry(vehicle.vin_code.clone()).or_default().info = Some(vehicle.clone());
            }
            s.cache
                .retain(|vin, _| vehicles.iter().any(|v| &v.vin_code == vin));
            s.vehicles = vehicles;
            s.error = None;

            let keeps_active = s
                .active_vin
                .as_deref()
                .is_some_and(|vin| s.vehicles.iter().any(|v| v.vin_code == vin));
            if keeps_active {
                None
            } else {
                s.vehicles.first().map(|v| v.vin_code.clone())
            }
        });

        if let Some(vin) = target {
            self.switch_vehicle(&vin).await?;
        }

        Ok(self.inner.store.read(|s| s.active_vin.clone()))
    }

    /// Loads the signed-in user's name and avatar.
    pub async fn fetch_user(&self) -> Result<(), ClientError> {
        match self.inner.source.user_profile().await {
            Ok(profile) => {
                self.inner.store.update(|s| {
                    s.user_name = profile.name.or(profile.sub);
                    let has_vehicle_image = s
                        .active_info
                        .as_ref()
                        .is_some_and(|info| info.profile_image.is_some());
                    if !has_vehicle_image {
                        s.user_avatar = profile.picture;
                    }
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("⚠️ User profile failed: {}", e);
                self.inner.store.update(|s| s.error = Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Scans the full alias catalog of `vin`, reusing a scan younger than
    /// five minutes unless `force` is set.
    pub async fn fetch_full_telemetry(&self, vin: &str, force: bool) -> Result<(), ClientError> {
        let now = Utc::now();
        let (fresh, version) = self.inner.store.read(|s| {
            let fresh = s
                .full_telemetry
                .get(vin)
                .is_some_and(|e| now - e.fetched_at < Duration::seconds(FULL_TELEMETRY_TTL_SECS));
            let version = s
                .vehicles
                .iter()
                .find(|v| v.vin_code == vin)
                .map(|v| v.alias_version().to_string())
                .unwrap_or_else(|| "1.0".to_string());
            (fresh, version)
        });

        if fresh && !force {
            tracing::debug!("Using cached full telemetry for {}", vin);
            return Ok(());
        }

        self.inner.store.update(|s| s.is_scanning = true);
        let result = self.inner.source.full_telemetry(vin, &version).await;

        self.inner.store.update(|s| {
            s.is_scanning = false;
            match &result {
                Ok(full) => {
                    s.debug_log = deep_scan(&full.aliases);
                    s.full_telemetry.insert(
                        vin.to_string(),
                        FullTelemetryEntry {
                            telemetry: full.clone(),
                            fetched_at: now,
                        },
                    );
                }
                Err(e) => s.error = Some(e.to_string()),
            }
        });

        match result {
            Ok(full) => {
                tracing::info!("🔎 Full scan of {}: {} aliases", vin, full.aliases.len());
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ Full telemetry scan failed for {}: {}", vin, e);
                Err(e)
            }
        }
    }
}

impl Inner {
    fn update_vehicle_data(&self, vin: &str, mut snapshot: TelemetrySnapshot) -> TelemetrySnapshot {
        let now = Utc::now();
        snapshot.vin = vin.to_string();
        snapshot.last_updated = Some(now);

        self.store.update(|s| {
            s.cache.entry(vin.to_string()).or_default().telemetry = Some(snapshot.clone());

            if s.active_vin.as_deref() == Some(vin) {
                s.live = snapshot.clone();
                s.last_updated = Some(now);
            }
            s.phases.insert(vin.to_string(), LoadPhase::Ready);
        });

        snapshot
    }

    async fn fetch_and_apply(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError> {
        // the counter only moves under the store's write lock, together with the flag
        self.store.update(|s| {
            self.pending.fetch_add(1, Ordering::SeqCst);
            s.is_refreshing = true;
            let phase = s.phases.entry(vin.to_string()).or_default();
            if *phase == LoadPhase::Uninitialized {
                *phase = LoadPhase::Loading;
            }
        });

        let result = self.source.core_telemetry(vin).await;

        match result {
            Ok(snapshot) => {
                let snapshot = self.update_vehicle_data(vin, snapshot);
                self.store.update(|s| {
                    s.is_initialized = true;
                    s.error = None;
                    s.is_refreshing = self.pending.fetch_sub(1, Ordering::SeqCst) > 1;
                });
                tracing::debug!("📡 Telemetry applied for {}", vin);
                Ok(self.enrich(vin, snapshot).await)
            }
            Err(e) => {
                tracing::error!("❌ Telemetry fetch failed for {}: {}", vin, e);
                self.store.update(|s| {
                    s.error = Some(e.to_string());
                    s.is_refreshing = self.pending.fetch_sub(1, Ordering::SeqCst) > 1;
                    if s.cached_telemetry(vin).is_none() {
                        s.phases.insert(vin.to_string(), LoadPhase::Uninitialized);
                    }
                });
                Err(e)
            }
        }
    }

    /// Merges location and weather into an already-applied snapshot, only
    /// where that snapshot is still the current one.
    async fn enrich(&self, vin: &str, mut snapshot: TelemetrySnapshot) -> TelemetrySnapshot {
        let Some((lat, lon)) = snapshot.position() else {
            return snapshot;
        };

        self.store.update(|s| s.is_enriching = true);
        let enrichment = self.source.enrichment(lat, lon).await;
        let stamp = snapshot.last_updated;

        self.store.update(|s| {
            s.is_enriching = false;
            if let Some(cached) = s.cache.get_mut(vin).and_then(|e| e.telemetry.as_mut()) {
                if cached.last_updated == stamp {
                    cached.apply_enrichment(enrichment.clone());
                }
            }
            if s.active_vin.as_deref() == Some(vin) && s.live.last_updated == stamp {
                s.live.apply_enrichment(enrichment.clone());
            }
        });

        snapshot.apply_enrichment(enrichment);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telemetry::{Doors, Enrichment};
    use crate::models::vehicle::UserProfile;
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct FakeSource {
        vehicles: Vec<VehicleRecord>,
        snapshots: HashMap<String, TelemetrySnapshot>,
        delay: StdDuration,
        enrichment_delay: StdDuration,
        telemetry_calls: AtomicUsize,
        full_calls: AtomicUsize,
    }

    #[async_trait]
    impl TelemetrySource for FakeSource {
        async fn vehicles(&self) -> Result<Vec<VehicleRecord>, ClientError> {
            Ok(self.vehicles.clone())
        }

        async fn user_profile(&self) -> Result<UserProfile, ClientError> {
            Ok(UserProfile {
                sub: Some("auth0|1".to_string()),
                name: None,
                email: None,
                picture: Some("https://img/avatar.png".to_string()),
            })
        }

        async fn core_telemetry(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError> {
            self.telemetry_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.snapshots
                .get(vin)
                .cloned()
                .ok_or(ClientError::ServerError)
        }

        async fn enrichment(&self, _lat: f64, _lon: f64) -> Enrichment {
            tokio::time::sleep(self.enrichment_delay).await;
            Enrichment {
                location_address: Some("1, Hồ Chí Minh, VN".to_string()),
                weather_temp: Some(31.0),
                ..Default::default()
            }
        }

        async fn full_telemetry(
            &self,
            _vin: &str,
            alias_version: &str,
        ) -> Result<FullTelemetry, ClientError> {
            self.full_calls.fetch_add(1, Ordering::SeqCst);
            Ok(FullTelemetry {
                alias_version: alias_version.to_string(),
                aliases: serde_json::from_value(serde_json::json!([
                    {"alias": "VEHICLE_FIRMWARE_VERSION", "devObjID": "34196"},
                    {"alias": "SEAT_HEATER", "devObjID": "34200"}
                ]))
                .unwrap(),
                raw: vec![serde_json::json!({"objectId": "34196", "value": "1.2"})],
            })
        }
    }

    fn vehicle(vin: &str) -> VehicleRecord {
        VehicleRecord {
            vin_code: vin.to_string(),
            ..Default::default()
        }
    }

    fn snapshot(vin: &str, doors_open: bool, battery: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            battery_level: Some(battery),
            doors: Doors {
                front_left: doors_open,
                trunk: doors_open,
                ..Default::default()
            },
            climate: crate::models::telemetry::Climate {
                inside_temp: doors_open.then_some(35.0),
                ..Default::default()
            },
            ..TelemetrySnapshot::neutral(vin)
        }
    }

    fn source_with(vins: &[(&str, TelemetrySnapshot)]) -> FakeSource {
        FakeSource {
            vehicles: vins.iter().map(|(vin, _)| vehicle(vin)).collect(),
            snapshots: vins
                .iter()
                .map(|(vin, snap)| (vin.to_string(), snap.clone()))
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_coalesce() {
        let mut source = source_with(&[("A", snapshot("A", false, 80.0))]);
        source.delay = StdDuration::from_millis(50);
        let source = Arc::new(source);
        let sync = TelemetrySynchronizer::new(source.clone());

        let (first, second) = tokio::join!(sync.fetch_telemetry("A"), sync.fetch_telemetry("A"));

        assert_eq!(source.telemetry_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.unwrap(), second.unwrap());
        let state = sync.state();
        assert!(!state.is_refreshing);
        assert_eq!(state.phase("A"), LoadPhase::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refreshing_flag_clears_once_overlapping_fetches_settle() {
        let mut source = source_with(&[
            ("A", snapshot("A", false, 80.0)),
            ("B", snapshot("B", false, 40.0)),
            ("C", snapshot("C", false, 20.0)),
        ]);
        source.delay = StdDuration::from_millis(2);
        let sync = TelemetrySynchronizer::new(Arc::new(source));

        for _ in 0..25 {
            let tasks: Vec<_> = ["A", "B", "C", "missing"]
                .into_iter()
                .map(|vin| {
                    let sync = sync.clone();
                    tokio::spawn(async move { sync.fetch_telemetry(vin).await })
                })
                .collect();
            for task in tasks {
                let _ = task.await.unwrap();
            }
            assert!(!sync.state().is_refreshing);
        }
        assert_eq!(sync.inner.pending.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inactive_vin_updates_only_its_cache() {
        let source = Arc::new(source_with(&[
            ("A", snapshot("A", false, 80.0)),
            ("B", snapshot("B", true, 40.0)),
        ]));
        let sync = TelemetrySynchronizer::new(source);
        sync.fetch_vehicles().await.unwrap();
        assert_eq!(sync.state().active_vin.as_deref(), Some("A"));

        sync.fetch_telemetry("B").await.unwrap();
        let state = sync.state();
        assert_eq!(state.live.vin, "A");
        assert_eq!(state.live.battery_level, Some(80.0));
        assert_eq!(state.cached_telemetry("B").unwrap().battery_level, Some(40.0));
    }

    #[tokio::test]
    async fn switching_never_shows_previous_vehicle_fields() {
        let source = Arc::new(source_with(&[
            ("A", snapshot("A", true, 80.0)),
            ("B", snapshot("B", false, 40.0)),
        ]));
        let sync = TelemetrySynchronizer::new(source.clone());
        sync.fetch_vehicles().await.unwrap();
        sync.fetch_telemetry("B").await.unwrap();

        let mut rx = sync.store().subscribe();
        let _ = rx.borrow_and_update();
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let done = state.active_vin.as_deref() == Some("B");
                seen.push(state);
                if done {
                    break;
                }
            }
            seen
        });

        let calls_before = source.telemetry_calls.load(Ordering::SeqCst);
        sync.switch_vehicle("B").await.unwrap();
        assert_eq!(source.telemetry_calls.load(Ordering::SeqCst), calls_before);

        for state in watcher.await.unwrap() {
            if state.active_vin.as_deref() == Some("B") {
                assert_eq!(state.live.vin, "B");
                assert_eq!(state.live.doors, Doors::default());
                assert_eq!(state.live.climate.inside_temp, None);
            }
        }
    }

    #[tokio::test]
    async fn switching_to_uncached_vehicle_starts_from_neutral() {
        let mut source = source_with(&[
            ("A", snapshot("A", true, 80.0)),
            ("B", snapshot("B", false, 40.0)),
        ]);
        source.delay = StdDuration::from_millis(80);
        let sync = TelemetrySynchronizer::new(Arc::new(source));
        sync.fetch_vehicles().await.unwrap();
        assert!(sync.state().live.doors.front_left);

        let switching = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.switch_vehicle("B").await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let during = sync.state();
        assert_eq!(during.live, TelemetrySnapshot::neutral("B"));
        assert_eq!(during.phase("B"), LoadPhase::Loading);
        assert!(during.is_refreshing);

        switching.await.unwrap().unwrap();
        let after = sync.state();
        assert_eq!(after.live.battery_level, Some(40.0));
        assert_eq!(after.phase("B"), LoadPhase::Ready);
    }

    #[tokio::test]
    async fn ready_does_not_wait_for_enrichment() {
        let mut located = snapshot("A", false, 80.0);
        located.latitude = Some(10.77);
        located.longitude = Some(106.7);
        let mut source = source_with(&[("A", located)]);
        source.enrichment_delay = StdDuration::from_millis(100);
        let sync = TelemetrySynchronizer::new(Arc::new(source));
        sync.store().update(|s| s.vehicles = vec![vehicle("A")]);

        let fetching = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.switch_vehicle("A").await })
        };
        tokio::time::sleep(StdDuration::from_millis(40)).await;

        let during = sync.state();
        assert_eq!(during.phase("A"), LoadPhase::Ready);
        assert!(during.is_enriching);
        assert_eq!(during.live.battery_level, Some(80.0));
        assert_eq!(during.live.enrichment.location_address, None);

        fetching.await.unwrap().unwrap();
        let after = sync.state();
        assert!(!after.is_enriching);
        assert_eq!(after.live.enrichment.weather_temp, Some(31.0));
        assert_eq!(
            after.cached_telemetry("A").unwrap().enrichment.location_address.as_deref(),
            Some("1, Hồ Chí Minh, VN")
        );
    }

    #[tokio::test]
    async fn failures_land_in_error_field() {
        let source = Arc::new(FakeSource {
            vehicles: vec![vehicle("A")],
            ..Default::default()
        });
        let sync = TelemetrySynchronizer::new(source);
        let result = sync.fetch_vehicles().await;

        assert_eq!(result, Err(ClientError::ServerError));
        let state = sync.state();
        assert_eq!(state.error.as_deref(), Some(ClientError::ServerError.to_string().as_str()));
        assert_eq!(state.phase("A"), LoadPhase::Uninitialized);
        assert!(!state.is_refreshing);
    }

    #[tokio::test]
    async fn refresh_vehicle_drops_cached_telemetry() {
        let source = Arc::new(source_with(&[
            ("A", snapshot("A", false, 80.0)),
            ("B", snapshot("B", false, 40.0)),
        ]));
        let sync = TelemetrySynchronizer::new(source.clone());
        sync.fetch_vehicles().await.unwrap();
        sync.fetch_telemetry("B").await.unwrap();

        sync.refresh_vehicle("A").await.unwrap();
        let state = sync.state();
        assert!(state.cached_telemetry("B").is_none());
        assert!(state.cache.get("B").unwrap().info.is_some());
        assert_eq!(state.phase("B"), LoadPhase::Uninitialized);
        assert_eq!(state.live.battery_level, Some(80.0));
    }

    #[tokio::test]
    async fn user_profile_falls_back_to_subject() {
        let sync = TelemetrySynchronizer::new(Arc::new(FakeSource::default()));
        sync.fetch_user().await.unwrap();
        let state = sync.state();
        assert_eq!(state.user_name.as_deref(), Some("auth0|1"));
        assert_eq!(state.user_avatar.as_deref(), Some("https://img/avatar.png"));
    }

    #[tokio::test]
    async fn full_scan_is_cached_for_five_minutes() {
        let source = Arc::new(source_with(&[("A", snapshot("A", false, 80.0))]));
        let sync = TelemetrySynchronizer::new(source.clone());

        sync.fetch_full_telemetry("A", false).await.unwrap();
        sync.fetch_full_telemetry("A", false).await.unwrap();
        assert_eq!(source.full_calls.load(Ordering::SeqCst), 1);

        let state = sync.state();
        assert!(!state.is_scanning);
        assert_eq!(state.debug_log.len(), 1);
        assert_eq!(state.full_telemetry["A"].telemetry.alias_version, "1.0");

        sync.fetch_full_telemetry("A", true).await.unwrap();
        assert_eq!(source.full_calls.load(Ordering::SeqCst), 2);
    }
}
