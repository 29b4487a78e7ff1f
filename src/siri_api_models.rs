// API models and data fetching for AC Transit (Alameda-Contra Costa Transit District)
// 511 SF Bay Open Data portal: https://511.org/open-data/transit
//
// 511 API Endpoints:
// - Vehicle Monitoring SIRI: http://api.511.org/transit/VehicleMonitoring?api_key=...&agency=AC&format=json
//
// The API is rate limited to 60 requests per hour per key, which is why the
// refresh task in main.rs polls slightly slower than once a minute.

use reqwest::blocking;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::US::Pacific;

// ============================================================================
// Vendor Payload (SIRI VehicleMonitoring envelope)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VehicleEnvelope {
    #[serde(default)]
    pub siri: SiriPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SiriPayload {
    #[serde(default)]
    pub service_delivery: ServiceDelivery,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceDelivery {
    #[serde(default)]
    pub vehicle_monitoring_delivery: VehicleMonitoringDelivery,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VehicleMonitoringDelivery {
    #[serde(default)]
    pub vehicle_activity: Vec<VehicleActivity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VehicleActivity {
    #[serde(default)]
    pub monitored_vehicle_journey: RawVehicleJourney,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawVehicleJourney {
    #[serde(default)]
    pub line_ref: String,
    #[serde(default)]
    pub published_line_name: String,
    #[serde(default)]
    pub direction_ref: String,
    #[serde(default)]
    pub origin_name: String,
    #[serde(default)]
    pub destination_name: String,
    // null for vehicles that do not report occupancy
    pub occupancy: Option<String>,
    #[serde(default)]
    pub vehicle_location: RawVehicleLocation,
    // the whole block is null for vehicles between monitored stops
    pub monitored_call: Option<RawMonitoredCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawVehicleLocation {
    #[serde(default)]
    pub latitude: String,
    #[serde(default)]
    pub longitude: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawMonitoredCall {
    pub stop_point_name: Option<String>,
    pub expected_arrival_time: Option<String>,
}

// ============================================================================
// Domain Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub line_ref: String,
    pub line_name: String,
    pub direction: String,
    pub pretty_direction: String,
    pub origin: String,
    pub destination: String,
    pub marker_icon: String,
    pub latitude: f64,
    pub longitude: f64,
    pub occupancy: String,
    pub next_stop: NextStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextStop {
    pub name: Option<String>,
    pub expected_arrival: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineDescriptor {
    pub id: String,
    pub name: String,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum TransitError {
    ConfigError(String),
    NetworkError(String),
    ApiError {
        status: u16,
        status_text: String,
        body: String,
    },
    ParseError(String),
}

impl std::fmt::Display for TransitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitError::ConfigError(e) => write!(f, "Configuration error: {}", e),
            TransitError::NetworkError(e) => write!(f, "Network error: {}", e),
            TransitError::ApiError { status, status_text, .. } => {
                write!(f, "API error: {} {}", status, status_text)
            }
            TransitError::ParseError(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for TransitError {}

pub type Result<T> = std::result::Result<T, TransitError>;

// ============================================================================
// Transform Layer
// ============================================================================

pub fn pretty_direction(direction: &str) -> &'static str {
    match direction {
        "N" => "North",
        "S" => "South",
        "E" => "East",
        "W" => "West",
        _ => "Direction Not Found",
    }
}

pub fn pretty_occupancy(occupancy: &str) -> &'static str {
    match occupancy {
        "seatsAvailable" => "Seats Available",
        "full" => "Full",
        _ => "Unknown",
    }
}

// Anything other than the four compass codes keeps the East icon, matching
// the icon set this map has always shipped with.
pub fn marker_icon(direction: &str) -> &'static str {
    match direction {
        "N" => "busIcons/busNorth.png",
        "S" => "busIcons/busSouth.png",
        "E" => "busIcons/busEast.png",
        "W" => "busIcons/busWest.png",
        _ => "busIcons/busEast.png",
    }
}

fn parse_arrival_timestamp(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.timestamp())
}

/// Flatten one monitored journey into a domain record. Total: malformed
/// fields degrade to fallback values, unparseable coordinates become NaN.
pub fn unmarshal_vehicle(journey: RawVehicleJourney) -> VehicleRecord {
    let latitude = journey.vehicle_location.latitude.parse::<f64>().unwrap_or(f64::NAN);
    let longitude = journey.vehicle_location.longitude.parse::<f64>().unwrap_or(f64::NAN);

    let next_stop = NextStop {
        name: journey
            .monitored_call
            .as_ref()
            .and_then(|call| call.stop_point_name.as_deref())
            .filter(|name| !name.is_empty())
            .map(String::from),
        expected_arrival: journey
            .monitored_call
            .as_ref()
            .and_then(|call| call.expected_arrival_time.as_deref())
            .and_then(parse_arrival_timestamp),
    };

    VehicleRecord {
        pretty_direction: pretty_direction(&journey.direction_ref).to_string(),
        marker_icon: marker_icon(&journey.direction_ref).to_string(),
        occupancy: pretty_occupancy(journey.occupancy.as_deref().unwrap_or("")).to_string(),
        direction: journey.direction_ref,
        line_ref: journey.line_ref,
        line_name: journey.published_line_name,
        origin: journey.origin_name,
        destination: journey.destination_name,
        latitude,
        longitude,
        next_stop,
    }
}

// ============================================================================
// Fetch Client
// ============================================================================

pub struct TransitClient {
    api_key: String,
    agency: String,
    http: blocking::Client,
}

impl TransitClient {
    const BASE_URL: &'static str = "http://api.511.org/transit/VehicleMonitoring";
    const API_KEY_ENV: &'static str = "TRANSIT_511_API_KEY";
    pub const DEFAULT_AGENCY: &'static str = "AC";
    const REQUEST_TIMEOUT_SECS: u64 = 30;

    pub fn new(api_key: String, agency: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(TransitError::ConfigError("API key is empty".to_string()));
        }

        let http = blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransitError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(TransitClient {
            api_key,
            agency: agency.to_string(),
            http,
        })
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var(Self::API_KEY_ENV).map_err(|_| {
            TransitError::ConfigError(format!(
                "{} is not set (get a free key at https://511.org/open-data/token)",
                Self::API_KEY_ENV
            ))
        })?;
        Self::new(api_key, Self::DEFAULT_AGENCY)
    }

    pub fn agency(&self) -> &str {
        &self.agency
    }

    /// One fetch attempt against the vehicle monitoring endpoint. No retry
    /// and no caching here; rescheduling is the refresh task's job.
    pub fn fetch_vehicles(&self) -> Result<Vec<VehicleRecord>> {
        let url = format!(
            "{}?api_key={}&agency={}&format=json",
            Self::BASE_URL,
            self.api_key,
            self.agency
        );

        let response = self.http.get(&url)
            .send()
            .map_err(|e| TransitError::NetworkError(format!("Failed to fetch vehicles: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransitError::ApiError {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
                body: response.text().unwrap_or_default(),
            });
        }

        let body = response.text()
            .map_err(|e| TransitError::NetworkError(format!("Failed to read response: {}", e)))?;

        // 511 prefixes its JSON bodies with a UTF-8 BOM
        let body = body.trim_start_matches('\u{feff}');

        let envelope: VehicleEnvelope = serde_json::from_str(body)
            .map_err(|e| TransitError::ParseError(format!("Invalid JSON response: {}", e)))?;

        let activity = envelope.siri.service_delivery.vehicle_monitoring_delivery.vehicle_activity;

        Ok(activity
            .into_iter()
            .map(|entry| unmarshal_vehicle(entry.monitored_vehicle_journey))
            .collect())
    }
}

// ============================================================================
// Refresh State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPhase {
    Idle,
    Loading,
    Error,
}

#[derive(Debug, Clone)]
pub struct VehicleCache {
    pub vehicles: Vec<VehicleRecord>,
    pub phase: RefreshPhase,
    pub last_updated: Option<i64>,
    pub last_error: Option<String>,
}

impl VehicleCache {
    // Starts out loading: the refresh task fetches immediately on startup.
    pub fn new() -> Self {
        VehicleCache {
            vehicles: Vec::new(),
            phase: RefreshPhase::Loading,
            last_updated: None,
            last_error: None,
        }
    }

    /// Enter the loading phase. Returns false if a fetch is already in
    /// flight, so at most one request runs at a time no matter how the
    /// timer and manual refreshes interleave.
    pub fn begin_refresh(&mut self) -> bool {
        if self.phase == RefreshPhase::Loading {
            return false;
        }
        self.phase = RefreshPhase::Loading;
        true
    }

    pub fn apply_success(&mut self, vehicles: Vec<VehicleRecord>, now: i64) {
        self.vehicles = vehicles;
        self.phase = RefreshPhase::Idle;
        self.last_updated = Some(now);
        self.last_error = None;
    }

    /// Record a failed fetch. The previous vehicle list stays in place so
    /// the map keeps showing the last known positions.
    pub fn apply_failure(&mut self, error: &TransitError) {
        self.phase = RefreshPhase::Error;
        self.last_error = Some(error.to_string());
    }
}

impl Default for VehicleCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Filter Derivations
// ============================================================================

pub fn derive_filtered(vehicles: &[VehicleRecord], selected: &str) -> Vec<VehicleRecord> {
    if selected.is_empty() {
        return vehicles.to_vec();
    }
    vehicles
        .iter()
        .filter(|vehicle| vehicle.line_ref == selected)
        .cloned()
        .collect()
}

/// Distinct lines observed in the current vehicle list, in first-seen order.
/// Recomputed from scratch every time, so lines with no active vehicles
/// drop out of the picker on the next poll. Vehicles with an empty line
/// name never contribute an entry.
pub fn derive_lines(vehicles: &[VehicleRecord]) -> Vec<LineDescriptor> {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();

    for vehicle in vehicles {
        if vehicle.line_name.is_empty() {
            continue;
        }
        if seen.insert(vehicle.line_ref.clone()) {
            lines.push(LineDescriptor {
                id: vehicle.line_ref.clone(),
                name: vehicle.line_name.clone(),
            });
        }
    }

    lines
}

// ============================================================================
// Timestamp Helpers
// ============================================================================

pub fn get_current_timestamp() -> i64 {
    Utc::now().timestamp()
}

pub fn format_timestamp_full(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(dt) => {
            let pacific_time = dt.with_timezone(&Pacific);
            pacific_time.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        None => format!("Invalid timestamp: {}", timestamp),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ENVELOPE: &str = r#"{
        "Siri": {
            "ServiceDelivery": {
                "ResponseTimestamp": "2022-06-05T01:22:15Z",
                "VehicleMonitoringDelivery": {
                    "ResponseTimestamp": "2022-06-05T01:22:15Z",
                    "VehicleActivity": [
                        {
                            "RecordedAtTime": "2022-06-05T01:22:04Z",
                            "MonitoredVehicleJourney": {
                                "LineRef": "1T",
                                "PublishedLineName": "Tempo",
                                "DirectionRef": "N",
                                "OriginName": "Uptown Transit Center",
                                "DestinationName": "San Leandro BART",
                                "Occupancy": "seatsAvailable",
                                "VehicleLocation": {
                                    "Latitude": "37.81",
                                    "Longitude": "-122.26"
                                },
                                "MonitoredCall": {
                                    "StopPointName": "Broadway & 20th St",
                                    "ExpectedArrivalTime": "2022-06-05T01:25:00Z"
                                }
                            }
                        }
                    ]
                }
            }
        }
    }"#;

    fn sample_vehicle(line_ref: &str, line_name: &str) -> VehicleRecord {
        VehicleRecord {
            line_ref: line_ref.to_string(),
            line_name: line_name.to_string(),
            direction: "N".to_string(),
            pretty_direction: "North".to_string(),
            origin: "Origin".to_string(),
            destination: "Destination".to_string(),
            marker_icon: "busIcons/busNorth.png".to_string(),
            latitude: 37.8,
            longitude: -122.26,
            occupancy: "Seats Available".to_string(),
            next_stop: NextStop {
                name: None,
                expected_arrival: None,
            },
        }
    }

    #[test]
    fn direction_mapping_covers_compass_codes() {
        assert_eq!(pretty_direction("N"), "North");
        assert_eq!(pretty_direction("S"), "South");
        assert_eq!(pretty_direction("E"), "East");
        assert_eq!(pretty_direction("W"), "West");
        assert_eq!(pretty_direction("NE"), "Direction Not Found");
        assert_eq!(pretty_direction(""), "Direction Not Found");
    }

    #[test]
    fn occupancy_mapping_covers_known_codes() {
        assert_eq!(pretty_occupancy("seatsAvailable"), "Seats Available");
        assert_eq!(pretty_occupancy("full"), "Full");
        assert_eq!(pretty_occupancy("standingAvailable"), "Unknown");
        assert_eq!(pretty_occupancy(""), "Unknown");
    }

    #[test]
    fn unmapped_direction_falls_back_to_east_icon() {
        assert_eq!(marker_icon("N"), "busIcons/busNorth.png");
        assert_eq!(marker_icon("S"), "busIcons/busSouth.png");
        assert_eq!(marker_icon("E"), "busIcons/busEast.png");
        assert_eq!(marker_icon("W"), "busIcons/busWest.png");
        assert_eq!(marker_icon("X"), "busIcons/busEast.png");
    }

    #[test]
    fn envelope_unmarshals_into_domain_record() {
        let envelope: VehicleEnvelope = serde_json::from_str(SAMPLE_ENVELOPE).unwrap();
        let activity = envelope.siri.service_delivery.vehicle_monitoring_delivery.vehicle_activity;
        assert_eq!(activity.len(), 1);

        let vehicle = unmarshal_vehicle(activity.into_iter().next().unwrap().monitored_vehicle_journey);
        assert_eq!(vehicle.line_ref, "1T");
        assert_eq!(vehicle.line_name, "Tempo");
        assert_eq!(vehicle.direction, "N");
        assert_eq!(vehicle.pretty_direction, "North");
        assert_eq!(vehicle.origin, "Uptown Transit Center");
        assert_eq!(vehicle.destination, "San Leandro BART");
        assert_eq!(vehicle.marker_icon, "busIcons/busNorth.png");
        assert_eq!(vehicle.occupancy, "Seats Available");
        assert_eq!(vehicle.latitude, 37.81);
        assert_eq!(vehicle.longitude, -122.26);
        assert_eq!(vehicle.next_stop.name.as_deref(), Some("Broadway & 20th St"));
        assert_eq!(vehicle.next_stop.expected_arrival, Some(1654392300));
    }

    #[test]
    fn null_monitored_call_leaves_next_stop_empty() {
        let raw = r#"{
            "LineRef": "51A",
            "PublishedLineName": "51A",
            "DirectionRef": "S",
            "OriginName": "Rockridge BART",
            "DestinationName": "Fruitvale BART",
            "Occupancy": null,
            "VehicleLocation": { "Latitude": "37.84", "Longitude": "-122.25" },
            "MonitoredCall": null
        }"#;
        let journey: RawVehicleJourney = serde_json::from_str(raw).unwrap();
        let vehicle = unmarshal_vehicle(journey);

        assert_eq!(vehicle.next_stop.name, None);
        assert_eq!(vehicle.next_stop.expected_arrival, None);
        assert_eq!(vehicle.occupancy, "Unknown");
    }

    #[test]
    fn empty_stop_name_treated_as_absent() {
        let journey = RawVehicleJourney {
            monitored_call: Some(RawMonitoredCall {
                stop_point_name: Some(String::new()),
                expected_arrival_time: None,
            }),
            ..Default::default()
        };
        let vehicle = unmarshal_vehicle(journey);

        assert_eq!(vehicle.next_stop.name, None);
        assert_eq!(vehicle.next_stop.expected_arrival, None);
    }

    #[test]
    fn unparseable_coordinates_become_nan() {
        let journey = RawVehicleJourney {
            vehicle_location: RawVehicleLocation {
                latitude: "not-a-latitude".to_string(),
                longitude: String::new(),
            },
            ..Default::default()
        };
        let vehicle = unmarshal_vehicle(journey);

        assert!(vehicle.latitude.is_nan());
        assert!(vehicle.longitude.is_nan());
    }

    #[test]
    fn arrival_timestamp_parsing() {
        assert_eq!(parse_arrival_timestamp("2022-06-05T01:25:00Z"), Some(1654392300));
        assert_eq!(parse_arrival_timestamp("2022-06-04T18:25:00-07:00"), Some(1654392300));
        assert_eq!(parse_arrival_timestamp("yesterday"), None);
        assert_eq!(parse_arrival_timestamp(""), None);
    }

    #[test]
    fn empty_selection_is_identity_filter() {
        let vehicles = vec![
            sample_vehicle("1T", "Tempo"),
            sample_vehicle("51A", "51A"),
            sample_vehicle("6", "6"),
        ];
        assert_eq!(derive_filtered(&vehicles, ""), vehicles);
    }

    #[test]
    fn selection_filters_by_line_ref_preserving_order() {
        let vehicles = vec![
            sample_vehicle("1T", "Tempo"),
            sample_vehicle("51A", "51A"),
            sample_vehicle("1T", "Tempo"),
            sample_vehicle("6", "6"),
        ];

        let filtered = derive_filtered(&vehicles, "1T");
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|v| v.line_ref == "1T"));
        assert_eq!(filtered, vec![vehicles[0].clone(), vehicles[2].clone()]);

        // same inputs, same output
        assert_eq!(derive_filtered(&vehicles, "1T"), filtered);
    }

    #[test]
    fn unknown_line_yields_empty_list() {
        let vehicles = vec![sample_vehicle("1T", "Tempo")];
        assert!(derive_filtered(&vehicles, "99Z").is_empty());
    }

    #[test]
    fn lines_are_unique_in_first_seen_order() {
        // overlap as if two successive polls both reported 1T and 51A
        let vehicles = vec![
            sample_vehicle("1T", "Tempo"),
            sample_vehicle("51A", "51A"),
            sample_vehicle("1T", "Tempo"),
            sample_vehicle("NL", "NL"),
            sample_vehicle("51A", "51A"),
        ];

        let lines = derive_lines(&vehicles);
        assert_eq!(
            lines,
            vec![
                LineDescriptor { id: "1T".to_string(), name: "Tempo".to_string() },
                LineDescriptor { id: "51A".to_string(), name: "51A".to_string() },
                LineDescriptor { id: "NL".to_string(), name: "NL".to_string() },
            ]
        );
    }

    #[test]
    fn lines_skip_empty_names() {
        let vehicles = vec![
            sample_vehicle("1T", ""),
            sample_vehicle("51A", "51A"),
            sample_vehicle("1T", "Tempo"),
        ];

        let lines = derive_lines(&vehicles);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].id, "51A");
        // the named sighting of 1T still registers even though an unnamed
        // one came first
        assert_eq!(lines[1].id, "1T");
        assert_eq!(lines[1].name, "Tempo");
    }

    #[test]
    fn cache_starts_loading_and_guards_single_flight() {
        let mut cache = VehicleCache::new();
        assert_eq!(cache.phase, RefreshPhase::Loading);
        // already loading: entering again is a no-op
        assert!(!cache.begin_refresh());

        cache.apply_success(vec![sample_vehicle("1T", "Tempo")], 1_654_392_300);
        assert_eq!(cache.phase, RefreshPhase::Idle);
        assert_eq!(cache.last_updated, Some(1_654_392_300));
        assert_eq!(cache.last_error, None);

        assert!(cache.begin_refresh());
        assert_eq!(cache.phase, RefreshPhase::Loading);
    }

    #[test]
    fn rate_limited_fetch_keeps_previous_vehicles() {
        let mut cache = VehicleCache::new();
        cache.apply_success(vec![sample_vehicle("1T", "Tempo")], 1_654_392_300);
        assert!(cache.begin_refresh());

        let error = TransitError::ApiError {
            status: 429,
            status_text: "Too Many Requests".to_string(),
            body: "rate limit exceeded".to_string(),
        };
        cache.apply_failure(&error);

        assert_eq!(cache.phase, RefreshPhase::Error);
        assert_eq!(cache.vehicles.len(), 1);
        assert_eq!(cache.last_updated, Some(1_654_392_300));
        assert!(cache.last_error.as_deref().unwrap().contains("429"));

        // the timer recovers from the error phase without special casing
        assert!(cache.begin_refresh());
        assert_eq!(cache.phase, RefreshPhase::Loading);
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        assert!(matches!(
            TransitClient::new(String::new(), TransitClient::DEFAULT_AGENCY),
            Err(TransitError::ConfigError(_))
        ));
        assert!(matches!(
            TransitClient::new("   ".to_string(), "AC"),
            Err(TransitError::ConfigError(_))
        ));
    }
}
