use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::source::StationSource;
use super::store::Store;
use crate::client::error::ClientError;
use crate::models::charging::{ChargingStation, haversine_km};

/// How long a station search stays valid.
pub const STATION_TTL_MINUTES: i64 = 15;
/// Moving further than this from the last search triggers a new one.
pub const REFETCH_DISTANCE_KM: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct StationState {
    pub stations: Vec<ChargingStation>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub last_fetch: Option<(f64, f64)>,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub show_stations: bool,
    /// Empty means every connector type.
    pub connector_type: String,
    pub only_available: bool,
}

impl Default for StationState {
    fn default() -> Self {
        Self {
            stations: Vec::new(),
            is_loading: false,
            error: None,
            last_fetch: None,
            last_fetch_at: None,
            show_stations: true,
            connector_type: String::new(),
            only_available: false,
        }
    }
}

impl StationState {
    /// Stations to draw under the current toggles.
    pub fn visible(&self) -> Vec<ChargingStation> {
        if !self.show_stations {
            return Vec::new();
        }
        self.stations
            .iter()
            .filter(|s| self.connector_type.is_empty() || s.supports(&self.connector_type))
            .filter(|s| !self.only_available || s.has_available_connector())
            .cloned()
            .collect()
    }

    fn is_fresh_for(&self, lat: f64, lon: f64, now: DateTime<Utc>) -> bool {
        let Some(at) = self.last_fetch_at else {
            return false;
        };
        if now - at >= Duration::minutes(STATION_TTL_MINUTES) {
            return false;
        }
        match self.last_fetch {
            Some((last_lat, last_lon)) => haversine_km(lat, lon, last_lat, last_lon) < REFETCH_DISTANCE_KM,
            None => true,
        }
    }
}

/// Nearby public charging stations, searched around the vehicle.
#[derive(Clone)]
pub struct ChargingStationFinder {
    source: Arc<dyn StationSource>,
    store: Arc<Store<StationState>>,
}

impl ChargingStationFinder {
    pub fn new(source: Arc<dyn StationSource>) -> Self {
        Self {
            source,
            store: Arc::new(Store::default()),
        }
    }

    pub fn store(&self) -> &Store<StationState> {
        &self.store
    }

    pub fn state(&self) -> StationState {
        self.store.get()
    }

    /// Searches around `(lat, lon)` unless the last search is recent and
    /// close enough. Errors land in the state as well.
    pub async fn fetch(&self, lat: f64, lon: f64, force: bool) -> Result<(), ClientError> {
        let now = Utc::now();
        if !force && self.store.read(|s| s.is_fresh_for(lat, lon, now)) {
            return Ok(());
        }

        self.store.update(|s| {
            s.is_loading = true;
            s.error = None;
        });

        match self.source.stations_near(lat, lon).await {
            Ok(stations) => {
                tracing::debug!("⚡ {} charging stations near {:.4},{:.4}", stations.len(), lat, lon);
                self.store.update(|s| {
                    s.stations = stations;
                    s.is_loading = false;
                    s.error = None;
                    s.last_fetch = Some((lat, lon));
                    s.last_fetch_at = Some(Utc::now());
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ Charging station search failed: {}", e);
                self.store.update(|s| {
                    s.is_loading = false;
                    s.error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    pub fn toggle_stations(&self) {
        self.store.update(|s| s.show_stations = !s.show_stations);
    }

    pub fn set_connector_filter(&self, connector_type: &str) {
        self.store
            .update(|s| s.connector_type = connector_type.to_string());
    }

    pub fn set_availability_filter(&self, only_available: bool) {
        self.store.update(|s| s.only_available = only_available);
    }

    pub fn visible(&self) -> Vec<ChargingStation> {
        self.store.read(StationState::visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStations {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StationSource for FixedStations {
        async fn stations_near(&self, _lat: f64, _lon: f64) -> Result<Vec<ChargingStation>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                ChargingStation {
                    station_id: Some("a".to_string()),
                    connector_types: vec!["CCS2".to_string()],
                    available_connectors: Some(2.0),
                    ..Default::default()
                },
                ChargingStation {
                    station_id: Some("b".to_string()),
                    connector_types: vec!["CHAdeMO".to_string()],
                    available_connectors: Some(0.0),
                    ..Default::default()
                },
            ])
        }
    }

    fn finder() -> (ChargingStationFinder, Arc<FixedStations>) {
        let source = Arc::new(FixedStations {
            calls: AtomicUsize::new(0),
        });
        (ChargingStationFinder::new(source.clone()), source)
    }

    #[tokio::test]
    async fn refetches_only_after_moving_far_enough() {
        let (finder, source) = finder();
        finder.fetch(21.0285, 105.8542, false).await.unwrap();
        // about 1 km away
        finder.fetch(21.0375, 105.8542, false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // about 11 km away
        finder.fetch(21.1285, 105.8542, false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        finder.fetch(21.1285, 105.8542, true).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_search_is_repeated() {
        let (finder, source) = finder();
        finder.fetch(10.0, 106.0, false).await.unwrap();
        finder
            .store()
            .update(|s| s.last_fetch_at = Some(Utc::now() - Duration::minutes(16)));
        finder.fetch(10.0, 106.0, false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn filters_apply_to_visible_stations() {
        let (finder, _) = finder();
        finder.fetch(10.0, 106.0, false).await.unwrap();
        assert_eq!(finder.visible().len(), 2);

        finder.set_connector_filter("CCS2");
        assert_eq!(finder.visible().len(), 1);

        finder.set_connector_filter("");
        finder.set_availability_filter(true);
        let visible = finder.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].station_id.as_deref(), Some("a"));

        finder.toggle_stations();
        assert!(finder.visible().is_empty());
    }
}
