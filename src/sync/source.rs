use async_trait::async_trait;

use crate::client::error::ClientError;
use crate::models::charging::{ChargingStation, HistoryPage};
use crate::models::telemetry::{Enrichment, FullTelemetry, TelemetrySnapshot};
use crate::models::vehicle::{UserProfile, VehicleRecord};

/// Where the telemetry synchronizer gets its data.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn vehicles(&self) -> Result<Vec<VehicleRecord>, ClientError>;

    async fn user_profile(&self) -> Result<UserProfile, ClientError>;

    /// Core telemetry without enrichment.
    async fn core_telemetry(&self, vin: &str) -> Result<TelemetrySnapshot, ClientError>;

    /// Best effort; failed lookups come back empty.
    async fn enrichment(&self, lat: f64, lon: f64) -> Enrichment;

    async fn full_telemetry(
        &self,
        vin: &str,
        alias_version: &str,
    ) -> Result<FullTelemetry, ClientError>;
}

#[async_trait]
pub trait ChargingHistorySource: Send + Sync {
    async fn history_page(&self, vin: &str, page: u32, size: u32)
    -> Result<HistoryPage, ClientError>;
}

#[async_trait]
pub trait StationSource: Send + Sync {
    async fn stations_near(&self, lat: f64, lon: f64) -> Result<Vec<ChargingStation>, ClientError>;
}
