use serde::{Deserialize, Serialize};

use crate::models::lenient;

/// A vehicle as listed by the vendor's user-vehicle endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VehicleRecord {
    pub vin_code: String,
    #[serde(deserialize_with = "lenient::string_opt")]
    pub user_id: Option<String>,
    pub marketing_name: Option<String>,
    pub vehicle_variant: Option<String>,
    pub color: Option<String>,
    pub exterior_color: Option<String>,
    pub interior_color: Option<String>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub year_of_product: Option<f64>,
    pub vehicle_name: Option<String>,
    pub customized_vehicle_name: Option<String>,
    pub user_vehicle_type: Option<String>,
    pub vehicle_image: Option<String>,
    pub profile_image: Option<String>,
    pub warranty_expiration_date: Option<String>,
    #[serde(deserialize_with = "lenient::f64_opt")]
    pub warranty_mileage: Option<f64>,
    #[serde(deserialize_with = "lenient::string_opt")]
    pub vehicle_alias_version: Option<String>,
}

impl VehicleRecord {
    /// Exterior colour, falling back to the generic colour field.
    pub fn display_color(&self) -> Option<&str> {
        self.exterior_color.as_deref().or(self.color.as_deref())
    }

    /// Alias catalog version, `1.0` when the vendor omits it.
    pub fn alias_version(&self) -> &str {
        self.vehicle_alias_version.as_deref().unwrap_or("1.0")
    }
}

/// Drops later duplicates of the same `vinCode`, keeping list order.
pub fn dedupe_vehicles(vehicles: Vec<VehicleRecord>) -> Vec<VehicleRecord> {
    let mut seen = std::collections::HashSet::new();
    vehicles
        .into_iter()
        .filter(|v| !v.vin_code.is_empty() && seen.insert(v.vin_code.clone()))
        .collect()
}

/// Profile returned by the OAuth tenant's `userinfo` endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub sub: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub picture: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_user_id_and_missing_fields() {
        let v: VehicleRecord = serde_json::from_str(
            r#"{"vinCode":"RLLV1","userId":123,"yearOfProduct":"2024","exteriorColor":"Blue"}"#,
        )
        .unwrap();
        assert_eq!(v.user_id.as_deref(), Some("123"));
        assert_eq!(v.year_of_product, Some(2024.0));
        assert_eq!(v.display_color(), Some("Blue"));
        assert_eq!(v.alias_version(), "1.0");
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mk = |vin: &str, name: &str| VehicleRecord {
            vin_code: vin.into(),
            marketing_name: Some(name.into()),
            ..Default::default()
        };
        let out = dedupe_vehicles(vec![mk("A", "first"), mk("B", "b"), mk("A", "second")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].marketing_name.as_deref(), Some("first"));
    }
}
