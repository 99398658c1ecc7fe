use std::collections::HashSet;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::lenient::{self, value_as_f64};

/// One line of a charging bill.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChargingItem {
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub cost: Option<f64>,
    /// Price per unit.
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub price: Option<f64>,
    pub unit: Option<String>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub energy: Option<f64>,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub from: i64,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub to: i64,
}

impl ChargingItem {
    /// Idle (parking) fees show up as items priced per minute.
    pub fn is_idle_fee(&self) -> bool {
        let unit = self.unit.as_deref().unwrap_or_default().to_lowercase();
        let name = self.name.as_deref().unwrap_or_default().to_lowercase();
        unit.contains("min") || name.contains("idle") || name.contains("chiếm chỗ")
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChargingPromotion {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub discount: Option<f64>,
}

/// A completed (or in-progress) charging session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChargingSession {
    #[serde(deserialize_with = "lenient::string_opt")]
    pub id: Option<String>,
    pub vehicle_id: Option<String>,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub plugged_time: i64,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub start_charge_time: i64,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub end_charge_time: i64,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub unplugged_time: i64,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub created_date: i64,
    pub charging_station_name: Option<String>,
    pub charging_station_address: Option<String>,
    pub province: Option<String>,
    pub district: Option<String>,
    pub location_id: Option<String>,
    pub connector_id: Option<String>,
    pub evse_id: Option<String>,
    pub items: Vec<ChargingItem>,
    #[serde(rename = "totalKWCharged", deserialize_with = "lenient::f64_opt")]
    pub total_kw_charged: Option<f64>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub amount: Option<f64>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub final_amount: Option<f64>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub discount: Option<f64>,
    pub promotions: Vec<ChargingPromotion>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub order_status: Option<f64>,
    pub status: Option<String>,
}

impl ChargingSession {
    /// Identity used for de-duplication: the vendor id when present, else a
    /// composite of start time, station and creation date.
    pub fn identity(&self) -> String {
        match self.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => format!("id:{}", id),
            None => {
                let start = [self.plugged_time, self.start_charge_time, self.created_date]
                    .into_iter()
                    .find(|t| *t > 0)
                    .unwrap_or(0);
                format!(
                    "synth:{}|{}|{}",
                    start,
                    self.charging_station_name.as_deref().unwrap_or_default(),
                    self.created_date
                )
            }
        }
    }

    /// Epoch milliseconds used for time filtering, `None` when unknown.
    pub fn session_time_ms(&self) -> Option<i64> {
        [self.start_charge_time, self.plugged_time, self.created_date]
            .into_iter()
            .find(|t| *t > 0)
    }

    pub fn session_time(&self) -> Option<DateTime<Utc>> {
        self.session_time_ms().and_then(DateTime::from_timestamp_millis)
    }

    /// Regular charging lines (everything that is not an idle fee).
    pub fn fee_items(&self) -> impl Iterator<Item = &ChargingItem> {
        self.items.iter().filter(|i| !i.is_idle_fee())
    }

    pub fn idle_fee(&self) -> Option<&ChargingItem> {
        self.items.iter().find(|i| i.is_idle_fee())
    }

    /// kWh charged, from the total when reported, else summed over items.
    pub fn energy_kwh(&self) -> f64 {
        self.total_kw_charged
            .unwrap_or_else(|| self.fee_items().filter_map(|i| i.energy).sum())
    }

    /// Whether the session falls in `year` (and `month` when given, 1-12).
    pub fn falls_in(&self, year: i32, month: Option<u32>) -> bool {
        match self.session_time() {
            Some(t) => t.year() == year && month.is_none_or(|m| t.month() == m),
            None => false,
        }
    }
}

/// Concatenates lists, keeping the first occurrence of each identity.
pub fn merge_sessions<I>(lists: I) -> Vec<ChargingSession>
where
    I: IntoIterator<Item = Vec<ChargingSession>>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for session in list {
            if seen.insert(session.identity()) {
                out.push(session);
            }
        }
    }
    out
}

/// Result of reading one page of charging history, whatever its envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionsPage {
    Sessions(Vec<ChargingSession>),
    Empty,
}

impl SessionsPage {
    /// Tries each known envelope in order:
    /// `{data: [..]}`, `{data: {content: [..]}}`, `{content: [..]}`, `[..]`.
    /// Anything else is `Empty`.
    pub fn parse(json: &Value) -> Self {
        let candidates = [
            json.get("data").filter(|d| d.is_array()),
            json.get("data").and_then(|d| d.get("content")).filter(|c| c.is_array()),
            json.get("content").filter(|c| c.is_array()),
            Some(json).filter(|j| j.is_array()),
        ];

        match candidates.into_iter().flatten().next() {
            Some(Value::Array(items)) => {
                let sessions: Vec<ChargingSession> = items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect();
                if sessions.is_empty() {
                    SessionsPage::Empty
                } else {
                    SessionsPage::Sessions(sessions)
                }
            }
            _ => SessionsPage::Empty,
        }
    }

    pub fn into_vec(self) -> Vec<ChargingSession> {
        match self {
            SessionsPage::Sessions(sessions) => sessions,
            SessionsPage::Empty => Vec::new(),
        }
    }
}

/// Vendor-reported total record count, checked across the envelope variants
/// the history endpoint has been seen to use.
pub fn total_records(json: &Value, fallback: u64) -> u64 {
    let metadata = json
        .get("metadata")
        .or_else(|| json.get("data").and_then(|d| d.get("metadata")));

    let candidates = [
        metadata.and_then(|m| m.get("totalRecords")),
        metadata.and_then(|m| m.get("totalElements")),
        json.get("data").and_then(|d| d.get("totalElements")),
        json.get("totalElements"),
        json.get("data").and_then(|d| d.get("totalRecords")),
        json.get("totalRecords"),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(value_as_f64)
        .find(|n| *n > 0.0)
        .map(|n| n as u64)
        .unwrap_or(fallback)
}

/// One page of charging history with the vendor's total count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryPage {
    pub sessions: Vec<ChargingSession>,
    pub total_records: u64,
}

impl HistoryPage {
    pub fn parse(json: &Value) -> Self {
        let sessions = SessionsPage::parse(json).into_vec();
        let total_records = total_records(json, sessions.len() as u64);
        Self {
            sessions,
            total_records,
        }
    }
}

/// A public charging station near the vehicle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChargingStation {
    #[serde(deserialize_with = "lenient::string_opt")]
    pub station_id: Option<String>,
    pub station_name: Option<String>,
    pub address: Option<String>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub latitude: Option<f64>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub longitude: Option<f64>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub total_connectors: Option<f64>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub available_connectors: Option<f64>,
    pub connector_types: Vec<String>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub max_power: Option<f64>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub distance: Option<f64>,
}

impl ChargingStation {
    pub fn has_available_connector(&self) -> bool {
        self.available_connectors.is_some_and(|n| n > 0.0)
    }

    pub fn supports(&self, connector_type: &str) -> bool {
        self.connector_types.iter().any(|t| t == connector_type)
    }
}

/// Reads a station list from `{data: {content}}`, `{data: [..]}`,
/// `{content: [..]}` or a bare array.
pub fn parse_stations(json: &Value) -> Vec<ChargingStation> {
    let candidates = [
        json.get("data").and_then(|d| d.get("content")).filter(|c| c.is_array()),
        json.get("data").filter(|d| d.is_array()),
        json.get("content").filter(|c| c.is_array()),
        Some(json).filter(|j| j.is_array()),
    ];

    match candidates.into_iter().flatten().next() {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}
