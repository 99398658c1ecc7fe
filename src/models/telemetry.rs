use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::lenient::{self, value_as_bool, value_as_f64, value_as_string};

/// An (object, instance, resource) triple addressing one telemetry value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    pub object_id: String,
    pub instance_id: String,
    pub resource_id: String,
}

impl ResourceId {
    pub fn new(object: &str, instance: &str, resource: &str) -> Self {
        Self {
            object_id: object.to_string(),
            instance_id: instance.to_string(),
            resource_id: resource.to_string(),
        }
    }

    /// Parses `/object/instance/resource`.
    pub fn parse(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [o, i, r] => Some(Self::new(o, i, r)),
            _ => None,
        }
    }

    pub fn path(&self) -> String {
        format!("/{}/{}/{}", self.object_id, self.instance_id, self.resource_id)
    }
}

/// Static alias map: snapshot field name → resource triple.
pub const CORE_ALIASES: &[(&str, &str, &str, &str)] = &[
    ("battery_level", "34180", "1", "9"),
    ("range", "34180", "1", "10"),
    ("charging_status", "34183", "1", "7"),
    ("target_soc", "34183", "1", "11"),
    ("remaining_charging_time", "34183", "1", "12"),
    ("soh_percentage", "34220", "1", "2"),
    ("battery_health_12v", "34220", "1", "5"),
    ("battery_type", "34220", "1", "7"),
    ("battery_serial", "34220", "1", "8"),
    ("battery_manufacture_date", "34220", "1", "9"),
    ("odometer", "34199", "0", "3"),
    ("speed", "34188", "0", "1"),
    ("gear_position", "34187", "0", "1"),
    ("ignition_status", "34187", "0", "4"),
    ("handbrake_status", "34187", "0", "6"),
    ("latitude", "6", "0", "0"),
    ("longitude", "6", "0", "1"),
    ("heading", "6", "0", "6"),
    ("is_locked", "34213", "1", "1"),
    ("central_lock_status", "34213", "1", "2"),
    ("window_status", "34213", "1", "6"),
    ("door_fl", "34215", "1", "1"),
    ("door_fr", "34215", "2", "1"),
    ("door_rl", "34215", "3", "1"),
    ("door_rr", "34215", "4", "1"),
    ("trunk_status", "34215", "5", "1"),
    ("hood_status", "34215", "6", "1"),
    ("tire_pressure_fl", "34190", "1", "1"),
    ("tire_pressure_fr", "34190", "2", "1"),
    ("tire_pressure_rl", "34190", "3", "1"),
    ("tire_pressure_rr", "34190", "4", "1"),
    ("tire_temp_fl", "34190", "1", "2"),
    ("tire_temp_fr", "34190", "2", "2"),
    ("tire_temp_rl", "34190", "3", "2"),
    ("tire_temp_rr", "34190", "4", "2"),
    ("inside_temp", "34224", "1", "1"),
    ("outside_temp", "34224", "1", "2"),
    ("climate_driver_temp", "34224", "1", "3"),
    ("climate_passenger_temp", "34224", "1", "4"),
    ("fan_speed", "34224", "1", "5"),
    ("bms_version", "34196", "1", "1"),
    ("gateway_version", "34196", "2", "1"),
    ("mhu_version", "34196", "3", "1"),
    ("vcu_version", "34196", "4", "1"),
    ("bcm_version", "34196", "5", "1"),
    ("firmware_version", "34196", "6", "1"),
    ("tbox_version", "34196", "7", "1"),
    ("thermal_warning", "34234", "1", "1"),
    ("service_alert", "34234", "1", "2"),
];

/// Resources always requested even though the alias map does not name them.
pub const FALLBACK_RESOURCES: &[&str] = &[
    "/34180/1/9",
    "/34183/1/7",
    "/34199/0/3",
    "/6/0/0",
    "/6/0/1",
    "/34196/0/1",
    "/34234/1/3",
];

/// Builds the batch request list plus a path → field lookup.
///
/// Alias entries come first; fallback resources are appended only when
/// not already present.
pub fn core_request() -> (Vec<ResourceId>, HashMap<String, &'static str>) {
    let mut requests = Vec::with_capacity(CORE_ALIASES.len() + FALLBACK_RESOURCES.len());
    let mut path_to_field = HashMap::with_capacity(CORE_ALIASES.len());

    for &(field, o, i, r) in CORE_ALIASES {
        let id = ResourceId::new(o, i, r);
        path_to_field.insert(id.path(), field);
        requests.push(id);
    }

    for path in FALLBACK_RESOURCES {
        if let Some(id) = ResourceId::parse(path) {
            if !requests.contains(&id) {
                requests.push(id);
            }
        }
    }

    (requests, path_to_field)
}

/// One value from the vendor's raw telemetry array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryReading {
    #[serde(deserialize_with = "lenient::string_opt")]
    pub object_id: Option<String>,
    #[serde(deserialize_with = "lenient::string_opt")]
    pub instance_id: Option<String>,
    #[serde(deserialize_with = "lenient::string_opt")]
    pub resource_id: Option<String>,
    /// Some firmware reports `"<object>_<instance>_<resource>"` instead.
    pub device_key: Option<String>,
    pub value: Value,
    #[serde(deserialize_with = "lenient::epoch_ms")]
    pub last_modified_date: i64,
}

impl TelemetryReading {
    pub fn path(&self) -> Option<String> {
        match (&self.object_id, &self.instance_id, &self.resource_id) {
            (Some(o), Some(i), Some(r)) => Some(format!("/{}/{}/{}", o, i, r)),
            _ => self
                .device_key
                .as_deref()
                .map(|key| format!("/{}", key.replace('_', "/"))),
        }
    }
}

/// One row of the vendor's per-model alias catalog.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasEntry {
    pub alias: Option<String>,
    #[serde(rename = "resourceName")]
    pub resource_name: Option<String>,
    #[serde(rename = "devObjID", deserialize_with = "lenient::string_opt")]
    pub dev_obj_id: Option<String>,
    #[serde(rename = "devObjInstID", deserialize_with = "lenient::string_opt")]
    pub dev_obj_inst_id: Option<String>,
    #[serde(rename = "devRsrcID", deserialize_with = "lenient::string_opt")]
    pub dev_rsrc_id: Option<String>,
}

impl AliasEntry {
    /// The triple to request, or `None` when the entry has no device object.
    pub fn resource(&self) -> Option<ResourceId> {
        let object = self.dev_obj_id.as_deref().filter(|o| !o.is_empty())?;
        Some(ResourceId::new(
            object,
            self.dev_obj_inst_id.as_deref().unwrap_or("0"),
            self.dev_rsrc_id.as_deref().unwrap_or("0"),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Doors {
    pub front_left: bool,
    pub front_right: bool,
    pub rear_left: bool,
    pub rear_right: bool,
    pub trunk: bool,
    pub hood: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tires {
    pub pressure_fl: Option<f64>,
    pub pressure_fr: Option<f64>,
    pub pressure_rl: Option<f64>,
    pub pressure_rr: Option<f64>,
    pub temp_fl: Option<f64>,
    pub temp_fr: Option<f64>,
    pub temp_rl: Option<f64>,
    pub temp_rr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Climate {
    pub inside_temp: Option<f64>,
    pub outside_temp: Option<f64>,
    pub driver_temp: Option<f64>,
    pub passenger_temp: Option<f64>,
    pub fan_speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatteryDetails {
    pub target_soc: Option<f64>,
    pub remaining_charging_time: Option<f64>,
    pub soh_percentage: Option<f64>,
    pub health_12v: Option<String>,
    pub battery_type: Option<String>,
    pub serial: Option<String>,
    pub manufacture_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EcuVersions {
    pub bms: Option<String>,
    pub gateway: Option<String>,
    pub mhu: Option<String>,
    pub vcu: Option<String>,
    pub bcm: Option<String>,
    pub firmware: Option<String>,
    pub tbox: Option<String>,
}

/// Reverse-geocoding and weather data attached after the fact.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Enrichment {
    pub location_address: Option<String>,
    pub weather_address: Option<String>,
    pub weather_temp: Option<f64>,
    pub weather_code: Option<i64>,
}

/// Live status of one vehicle.
///
/// `TelemetrySnapshot::neutral(vin)` is the clean slate every vehicle switch
/// starts from; all groups are replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub vin: String,
    pub battery_level: Option<f64>,
    pub range: Option<f64>,
    pub odometer: Option<f64>,
    pub speed: Option<f64>,
    pub charging: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading: Option<f64>,
    pub gear_position: Option<String>,
    pub ignition_status: Option<String>,
    pub is_locked: Option<bool>,
    pub central_lock: Option<bool>,
    pub handbrake: Option<bool>,
    pub window_status: Option<String>,
    pub thermal_warning: Option<bool>,
    pub service_alert: Option<bool>,
    pub doors: Doors,
    pub tires: Tires,
    pub climate: Climate,
    pub battery: BatteryDetails,
    pub versions: EcuVersions,
    pub enrichment: Enrichment,
    pub last_updated: Option<DateTime<Utc>>,
}

impl TelemetrySnapshot {
    pub fn neutral(vin: &str) -> Self {
        Self {
            vin: vin.to_string(),
            ..Default::default()
        }
    }

    /// Coordinates when both are present and not the (0, 0) placeholder.
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat != 0.0 || lon != 0.0 => Some((lat, lon)),
            _ => None,
        }
    }

    /// Assigns one named field. Unknown names are ignored.
    pub fn apply_field(&mut self, field: &str, value: &Value) {
        let num = || value_as_f64(value);
        let flag = || value_as_bool(value);
        let text = || value_as_string(value);

        match field {
            "battery_level" => self.battery_level = num(),
            "range" => self.range = num(),
            "odometer" => self.odometer = num(),
            "speed" => self.speed = num(),
            "charging_status" => self.charging = flag(),
            "latitude" => self.latitude = num(),
            "longitude" => self.longitude = num(),
            "heading" => self.heading = num(),
            "gear_position" => self.gear_position = text(),
            "ignition_status" => self.ignition_status = text(),
            "is_locked" => self.is_locked = flag(),
            "central_lock_status" => self.central_lock = flag(),
            "handbrake_status" => self.handbrake = flag(),
            "window_status" => self.window_status = text(),
            "thermal_warning" => self.thermal_warning = flag(),
            "service_alert" => self.service_alert = flag(),
            "door_fl" => self.doors.front_left = flag().unwrap_or(false),
            "door_fr" => self.doors.front_right = flag().unwrap_or(false),
            "door_rl" => self.doors.rear_left = flag().unwrap_or(false),
            "door_rr" => self.doors.rear_right = flag().unwrap_or(false),
            "trunk_status" => self.doors.trunk = flag().unwrap_or(false),
            "hood_status" => self.doors.hood = flag().unwrap_or(false),
            "tire_pressure_fl" => self.tires.pressure_fl = num(),
            "tire_pressure_fr" => self.tires.pressure_fr = num(),
            "tire_pressure_rl" => self.tires.pressure_rl = num(),
            "tire_pressure_rr" => self.tires.pressure_rr = num(),
            "tire_temp_fl" => self.tires.temp_fl = num(),
            "tire_temp_fr" => self.tires.temp_fr = num(),
            "tire_temp_rl" => self.tires.temp_rl = num(),
            "tire_temp_rr" => self.tires.temp_rr = num(),
            "inside_temp" => self.climate.inside_temp = num(),
            "outside_temp" => self.climate.outside_temp = num(),
            "climate_driver_temp" => self.climate.driver_temp = num(),
            "climate_passenger_temp" => self.climate.passenger_temp = num(),
            "fan_speed" => self.climate.fan_speed = num(),
            "target_soc" => self.battery.target_soc = num(),
            "remaining_charging_time" => self.battery.remaining_charging_time = num(),
            "soh_percentage" => self.battery.soh_percentage = num(),
            "battery_health_12v" => self.battery.health_12v = text(),
            "battery_type" => self.battery.battery_type = text(),
            "battery_serial" => self.battery.serial = text(),
            "battery_manufacture_date" => self.battery.manufacture_date = text(),
            "bms_version" => self.versions.bms = text(),
            "gateway_version" => self.versions.gateway = text(),
            "mhu_version" => self.versions.mhu = text(),
            "vcu_version" => self.versions.vcu = text(),
            "bcm_version" => self.versions.bcm = text(),
            "firmware_version" => self.versions.firmware = text(),
            "tbox_version" => self.versions.tbox = text(),
            _ => {}
        }
    }

    /// Folds enrichment into the snapshot. Absent lookups leave fields alone.
    pub fn apply_enrichment(&mut self, enrichment: Enrichment) {
        if enrichment.location_address.is_some() {
            self.enrichment.location_address = enrichment.location_address;
        }
        if enrichment.weather_address.is_some() {
            self.enrichment.weather_address = enrichment.weather_address;
        }
        if enrichment.weather_temp.is_some() {
            self.enrichment.weather_temp = enrichment.weather_temp;
        }
        if enrichment.weather_code.is_some() {
            self.enrichment.weather_code = enrichment.weather_code;
        }
    }
}

/// Maps raw readings onto a snapshot through `path_to_field`.
///
/// Readings for unknown paths are skipped. When several readings share a
/// path, the most recently modified one wins.
pub fn parse_telemetry(
    vin: &str,
    readings: &[TelemetryReading],
    path_to_field: &HashMap<String, &str>,
) -> TelemetrySnapshot {
    let mut snapshot = TelemetrySnapshot::neutral(vin);
    let mut newest: HashMap<&str, i64> = HashMap::new();

    for reading in readings {
        let Some(path) = reading.path() else { continue };
        let Some(&field) = path_to_field.get(&path) else { continue };

        let seen = newest.entry(field).or_insert(i64::MIN);
        if reading.last_modified_date < *seen {
            continue;
        }
        *seen = reading.last_modified_date;
        snapshot.apply_field(field, &reading.value);
    }

    snapshot
}

/// Keywords that mark an alias as worth surfacing in the deep scan.
pub const DEEP_SCAN_KEYWORDS: &[&str] = &[
    "SERVICE",
    "MAINTENANCE",
    "WARRANTY",
    "BOOKING",
    "APPOINTMENT",
    "NEXT",
    "SCHEDULE",
    "OTA",
    "UPDATE",
    "FIRMWARE",
    "VERSION",
    "ENERGY",
    "CONSUMPTION",
    "EFFICIENCY",
    "TRIP",
    "HISTORY",
    "NOTIFICATION",
    "ALERT",
    "ERROR",
    "FAULT",
    "DIAGNOSTIC",
    "RECALL",
    "CAMPAIGN",
];

/// Aliases whose name or resource name contains a deep-scan keyword.
pub fn deep_scan(aliases: &[AliasEntry]) -> Vec<AliasEntry> {
    aliases
        .iter()
        .filter(|entry| {
            let name = entry.resource_name.as_deref().unwrap_or_default().to_uppercase();
            let alias = entry.alias.as_deref().unwrap_or_default().to_uppercase();
            DEEP_SCAN_KEYWORDS
                .iter()
                .any(|k| name.contains(k) || alias.contains(k))
        })
        .cloned()
        .collect()
}

/// Request triples for every alias that names a device object, deduplicated.
pub fn alias_requests(aliases: &[AliasEntry]) -> Vec<ResourceId> {
    let mut requests: Vec<ResourceId> = Vec::with_capacity(aliases.len());
    for id in aliases.iter().filter_map(AliasEntry::resource) {
        if !requests.contains(&id) {
            requests.push(id);
        }
    }
    requests
}

/// The complete alias catalog of a vehicle with the raw values behind it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FullTelemetry {
    /// Catalog version that actually answered (after any fallback).
    pub alias_version: String,
    pub aliases: Vec<AliasEntry>,
    pub raw: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn core_request_dedupes_fallbacks() {
        let (requests, lookup) = core_request();
        let unique: std::collections::HashSet<_> = requests.iter().collect();
        assert_eq!(unique.len(), requests.len());
        assert_eq!(lookup.get("/34180/1/9"), Some(&"battery_level"));
        assert!(requests.contains(&ResourceId::new("34234", "1", "3")));
    }

    #[test]
    fn parses_mixed_reading_shapes() {
        let (_, lookup) = core_request();
        let readings: Vec<TelemetryReading> = serde_json::from_value(json!([
            {"objectId": "34180", "instanceId": "1", "resourceId": "9", "value": "81"},
            {"objectId": 6, "instanceId": 0, "resourceId": 0, "value": 10.77},
            {"deviceKey": "6_0_1", "value": "106.7"},
            {"objectId": "34215", "instanceId": "1", "resourceId": "1", "value": "1"},
            {"objectId": "34196", "instanceId": "1", "resourceId": "1", "value": "BMS-2.1"},
            {"objectId": "9999", "instanceId": "9", "resourceId": "9", "value": "ignored"}
        ]))
        .unwrap();

        let snap = parse_telemetry("VIN1", &readings, &lookup);
        assert_eq!(snap.vin, "VIN1");
        assert_eq!(snap.battery_level, Some(81.0));
        assert_eq!(snap.position(), Some((10.77, 106.7)));
        assert!(snap.doors.front_left);
        assert_eq!(snap.versions.bms.as_deref(), Some("BMS-2.1"));
        assert_eq!(snap.range, None);
    }

    #[test]
    fn newest_reading_wins() {
        let (_, lookup) = core_request();
        let readings: Vec<TelemetryReading> = serde_json::from_value(json!([
            {"objectId": "34188", "instanceId": "0", "resourceId": "1", "value": 50, "lastModifiedDate": 2000},
            {"objectId": "34188", "instanceId": "0", "resourceId": "1", "value": 20, "lastModifiedDate": 1000}
        ]))
        .unwrap();
        assert_eq!(parse_telemetry("V", &readings, &lookup).speed, Some(50.0));
    }

    #[test]
    fn alias_entry_without_device_object_is_skipped() {
        let entry: AliasEntry =
            serde_json::from_value(json!({"alias": "X", "devObjID": "", "devRsrcID": "1"})).unwrap();
        assert!(entry.resource().is_none());
        let entry: AliasEntry =
            serde_json::from_value(json!({"alias": "Y", "devObjID": 34183})).unwrap();
        assert_eq!(entry.resource(), Some(ResourceId::new("34183", "0", "0")));
    }

    #[test]
    fn deep_scan_matches_keywords_in_either_name() {
        let aliases: Vec<AliasEntry> = serde_json::from_value(json!([
            {"alias": "VEHICLE_NEXT_SERVICE_DATE", "devObjID": "34300"},
            {"alias": "X", "resourceName": "ota update status", "devObjID": "34301"},
            {"alias": "DOOR", "resourceName": "door", "devObjID": "34215"},
            {"alias": "NO_OBJ", "resourceName": "firmware"}
        ]))
        .unwrap();

        let found: Vec<_> = deep_scan(&aliases)
            .into_iter()
            .filter_map(|a| a.alias)
            .collect();
        assert_eq!(found, vec!["VEHICLE_NEXT_SERVICE_DATE", "X", "NO_OBJ"]);
        assert_eq!(alias_requests(&aliases).len(), 3);
    }
}
