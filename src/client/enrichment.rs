use std::time::Duration;

use serde::Deserialize;
use tokio::time::timeout;

use crate::models::telemetry::Enrichment;

pub const DEFAULT_GEOCODE_BASE: &str = "https://nominatim.openstreetmap.org";
pub const DEFAULT_WEATHER_BASE: &str = "https://api.open-meteo.com";
/// Upper bound on each lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Administrative prefixes dropped from Vietnamese place names.
const ADMIN_PREFIXES: &[&str] = &["Thành phố", "Tỉnh", "Quận", "Huyện", "Xã", "Phường"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NominatimAddress {
    city_district: Option<String>,
    district: Option<String>,
    county: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
    province: Option<String>,
    country_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NominatimResponse {
    address: NominatimAddress,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature: Option<f64>,
    weathercode: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    current_weather: Option<CurrentWeather>,
}

/// Strips one leading administrative prefix, case-insensitively.
pub fn strip_admin_prefix(name: &str) -> String {
    let name = name.trim();
    for prefix in ADMIN_PREFIXES {
        let mut chars = name.char_indices();
        let mut end = 0;
        let matched = prefix.chars().all(|p| match chars.next() {
            Some((i, c)) if c.to_lowercase().eq(p.to_lowercase()) => {
                end = i + c.len_utf8();
                true
            }
            _ => false,
        });
        let rest = &name[end..];
        if matched && rest.starts_with(char::is_whitespace) {
            return rest.trim().to_string();
        }
    }
    name.to_string()
}

fn join_parts(parts: &[Option<String>]) -> Option<String> {
    let joined = parts
        .iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    (!joined.is_empty()).then_some(joined)
}

/// Builds `(location_address, weather_address)` from a geocoder address.
fn format_address(address: &NominatimAddress) -> (Option<String>, Option<String>) {
    let district = address
        .city_district
        .as_deref()
        .or(address.district.as_deref())
        .or(address.county.as_deref())
        .map(strip_admin_prefix);
    let city = address
        .city
        .as_deref()
        .or(address.town.as_deref())
        .or(address.village.as_deref())
        .or(address.state.as_deref())
        .or(address.province.as_deref())
        .map(strip_admin_prefix);
    let country = Some(
        address
            .country_code
            .as_deref()
            .unwrap_or("vn")
            .to_uppercase(),
    );

    (
        join_parts(&[district, city.clone(), country.clone()]),
        join_parts(&[city, country]),
    )
}

/// Looks up a readable place name and current weather for a position.
#[derive(Clone)]
pub struct Enricher {
    http: reqwest::Client,
    geocode_base: String,
    weather_base: String,
    lookup_timeout: Duration,
}

impl Enricher {
    pub fn with_endpoints(
        http: reqwest::Client,
        geocode_base: &str,
        weather_base: &str,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            http,
            geocode_base: geocode_base.trim_end_matches('/').to_string(),
            weather_base: weather_base.trim_end_matches('/').to_string(),
            lookup_timeout,
        }
    }

    /// Runs both lookups concurrently, each under its own timeout. A failed
    /// or slow lookup leaves its fields empty.
    pub async fn enrich(&self, lat: f64, lon: f64) -> Enrichment {
        let (geo, weather) = tokio::join!(
            timeout(self.lookup_timeout, self.reverse_geocode(lat, lon)),
            timeout(self.lookup_timeout, self.current_weather(lat, lon)),
        );

        let mut enrichment = Enrichment::default();

        match geo {
            Ok(Ok((location, weather_address))) => {
                enrichment.location_address = location;
                enrichment.weather_address = weather_address;
            }
            Ok(Err(e)) => tracing::warn!("⚠️ Reverse geocoding failed: {}", e),
            Err(_) => tracing::warn!("⌛ Reverse geocoding timed out"),
        }

        match weather {
            Ok(Ok(Some(current))) => {
                enrichment.weather_temp = current.temperature;
                enrichment.weather_code = current.weathercode;
            }
            Ok(Ok(None)) => tracing::debug!("Weather response had no current_weather"),
            Ok(Err(e)) => tracing::warn!("⚠️ Weather lookup failed: {}", e),
            Err(_) => tracing::warn!("⌛ Weather lookup timed out"),
        }

        enrichment
    }

    async fn reverse_geocode(
        &self,
        lat: f64,
        lon: f64,
    ) -> reqwest::Result<(Option<String>, Option<String>)> {
        let response: NominatimResponse = self
            .http
            .get(format!("{}/reverse", self.geocode_base))
            .query(&[
                ("format", "json".to_string()),
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
            ])
            .header(reqwest::header::USER_AGENT, "vfdash/0.1")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(format_address(&response.address))
    }

    async fn current_weather(&self, lat: f64, lon: f64) -> reqwest::Result<Option<CurrentWeather>> {
        let response: WeatherResponse = self
            .http
            .get(format!("{}/v1/forecast", self.weather_base))
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("current_weather", "true".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.current_weather)
    }
}
