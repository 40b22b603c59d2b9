/// Transit REST API client (HAFAS-style, e.g. `v6.db.transport.rest`)
///
/// Two endpoints are used:
///
/// - `GET {base}/stops/{station}/departures?duration=..` - station board with
///   `tripId`, `when`, `plannedWhen`, `delay` (seconds), `line.fahrtNr` and,
///   when the backend knows it, `currentTripPosition`.
/// - `GET {base}/trips/{tripId}?polyline=true` - trip detail with origin,
///   destination, planned times and the route polyline as a GeoJSON
///   `FeatureCollection` of points.
///
/// Coordinates leave this module as `[lon, lat]`.
use crate::config::Products;
use crate::models::{Departure, TripDetail};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

/// Source of departures and trip detail, the tracker's only upstream
#[async_trait]
pub trait TransitSource: Send + Sync {
    async fn fetch_departures(
        &self,
        station_id: &str,
        query: &DepartureQuery,
    ) -> Result<Vec<Departure>, TransitError>;

    async fn resolve_trip(&self, trip_id: &str) -> Result<TripDetail, TransitError>;
}

/// Filter options for a station board request
#[derive(Debug, Clone, Copy)]
pub struct DepartureQuery {
    pub duration_minutes: u32,
    pub products: Products,
}

#[derive(Debug, Clone)]
pub struct TransitClient {
    client: reqwest::Client,
    base_url: String,
}

impl TransitClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransitError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Execute a GET request and return the non-empty body
    async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, TransitError> {
        debug!(url = %url, "Requesting transit API");

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| TransitError::NetworkError(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransitError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            return Err(TransitError::HttpError(format!(
                "HTTP {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        if text.trim().is_empty() {
            return Err(TransitError::EmptyBody);
        }

        Ok(text)
    }
}

#[async_trait]
impl TransitSource for TransitClient {
    async fn fetch_departures(
        &self,
        station_id: &str,
        query: &DepartureQuery,
    ) -> Result<Vec<Departure>, TransitError> {
        let url = format!(
            "{}/stops/{}/departures",
            self.base_url,
            urlencoding::encode(station_id)
        );

        let mut params: Vec<(&str, String)> = vec![
            ("duration", query.duration_minutes.to_string()),
            ("linesOfStops", "false".to_string()),
            ("remarks", "true".to_string()),
            ("language", "en".to_string()),
            ("pretty", "false".to_string()),
        ];
        params.extend(
            query
                .products
                .as_query()
                .into_iter()
                .map(|(name, enabled)| (name, enabled.to_string())),
        );

        let body = self.get_text(&url, &params).await?;
        parse_departures(&body)
    }

    async fn resolve_trip(&self, trip_id: &str) -> Result<TripDetail, TransitError> {
        let url = format!("{}/trips/{}", self.base_url, urlencoding::encode(trip_id));
        let params = [
            ("stopovers", "true".to_string()),
            ("remarks", "true".to_string()),
            ("polyline", "true".to_string()),
            ("language", "en".to_string()),
            ("pretty", "false".to_string()),
        ];

        let body = self.get_text(&url, &params).await?;
        parse_trip(&body)
    }
}

/// Decode a station board response
pub fn parse_departures(body: &str) -> Result<Vec<Departure>, TransitError> {
    let response: DeparturesResponse = serde_json::from_str(body).map_err(|e| {
        error!(
            error = %e,
            body_preview = %body.chars().take(500).collect::<String>(),
            "Failed to parse departures response"
        );
        TransitError::ParseError(e.to_string())
    })?;

    Ok(response
        .departures
        .into_iter()
        .filter_map(ApiDeparture::into_departure)
        .collect())
}

/// Decode a trip response; origin and destination must be named and located
pub fn parse_trip(body: &str) -> Result<TripDetail, TransitError> {
    let response: TripResponse = serde_json::from_str(body).map_err(|e| {
        error!(
            error = %e,
            body_preview = %body.chars().take(500).collect::<String>(),
            "Failed to parse trip response"
        );
        TransitError::ParseError(e.to_string())
    })?;

    let trip = response.trip;

    let (origin_name, origin) = trip
        .origin
        .and_then(ApiStop::named_location)
        .ok_or_else(|| TransitError::IncompleteTrip("origin".to_string()))?;
    let (destination_name, destination) = trip
        .destination
        .and_then(ApiStop::named_location)
        .ok_or_else(|| TransitError::IncompleteTrip("destination".to_string()))?;

    let scheduled_departure = trip
        .planned_departure
        .as_deref()
        .or(trip.departure.as_deref())
        .and_then(parse_time)
        .ok_or_else(|| TransitError::IncompleteTrip("departure time".to_string()))?;
    let scheduled_arrival = trip
        .planned_arrival
        .as_deref()
        .or(trip.arrival.as_deref())
        .and_then(parse_time)
        .ok_or_else(|| TransitError::IncompleteTrip("arrival time".to_string()))?;

    let route = trip
        .polyline
        .map(|polyline| {
            polyline
                .features
                .iter()
                .filter_map(|feature| match feature.geometry.coordinates.as_slice() {
                    [lon, lat, ..] => Some([*lon, *lat]),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(TripDetail {
        origin_name,
        origin,
        destination_name,
        destination,
        scheduled_departure,
        scheduled_arrival,
        route,
    })
}

fn parse_time(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).ok()
}

#[derive(Debug, Deserialize)]
struct DeparturesResponse {
    departures: Vec<ApiDeparture>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiDeparture {
    trip_id: Option<String>,
    when: Option<String>,
    planned_when: Option<String>,
    delay: Option<i64>,
    line: Option<ApiLine>,
    destination: Option<ApiStop>,
    current_trip_position: Option<ApiLocation>,
}

impl ApiDeparture {
    /// Entries without trip handle or run number cannot be tracked
    fn into_departure(self) -> Option<Departure> {
        let line = self.line?;
        let run_id = line.fahrt_nr.filter(|n| !n.is_empty())?;
        let trip_id = self.trip_id.filter(|t| !t.is_empty())?;

        Some(Departure {
            run_id,
            trip_id,
            line_name: line.name.unwrap_or_default(),
            planned_when: self.planned_when,
            when: self.when,
            delay_secs: self.delay.unwrap_or(0),
            reported_position: self.current_trip_position.and_then(ApiLocation::lon_lat),
            destination_name: self.destination.and_then(|d| d.name),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLine {
    name: Option<String>,
    fahrt_nr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiStop {
    name: Option<String>,
    location: Option<ApiLocation>,
}

impl ApiStop {
    fn named_location(self) -> Option<(String, [f64; 2])> {
        let name = self.name.filter(|n| !n.is_empty())?;
        let location = self.location?.lon_lat()?;
        Some((name, location))
    }
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl ApiLocation {
    fn lon_lat(self) -> Option<[f64; 2]> {
        Some([self.longitude?, self.latitude?])
    }
}

#[derive(Debug, Deserialize)]
struct TripResponse {
    trip: ApiTrip,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiTrip {
    origin: Option<ApiStop>,
    destination: Option<ApiStop>,
    departure: Option<String>,
    planned_departure: Option<String>,
    arrival: Option<String>,
    planned_arrival: Option<String>,
    polyline: Option<ApiPolyline>,
}

#[derive(Debug, Deserialize)]
struct ApiPolyline {
    #[serde(default)]
    features: Vec<ApiFeature>,
}

#[derive(Debug, Deserialize)]
struct ApiFeature {
    geometry: ApiGeometry,
}

#[derive(Debug, Deserialize)]
struct ApiGeometry {
    #[serde(default)]
    coordinates: Vec<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Unexpected response: {0}")]
    HttpError(String),
    #[error("Empty response body")]
    EmptyBody,
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("Incomplete trip data: missing {0}")]
    IncompleteTrip(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPARTURES: &str = r#"{
        "departures": [
            {
                "tripId": "1|200845|0|80|19102026",
                "when": "2026-10-19T10:07:00+02:00",
                "plannedWhen": "2026-10-19T10:02:00+02:00",
                "delay": 300,
                "line": { "name": "ICE 123", "fahrtNr": "123" },
                "destination": { "name": "Hamburg Hbf" },
                "currentTripPosition": { "type": "location", "latitude": 52.52, "longitude": 13.37 }
            },
            {
                "tripId": "1|300000|0|80|19102026",
                "when": null,
                "plannedWhen": "2026-10-19T10:15:00+02:00",
                "delay": null,
                "line": { "name": "RE 1", "fahrtNr": "4711" }
            },
            {
                "tripId": "1|400000|0|80|19102026",
                "when": "2026-10-19T10:20:00+02:00",
                "line": { "name": "Bus 100" }
            }
        ],
        "realtimeDataUpdatedAt": 1760860800
    }"#;

    const TRIP: &str = r#"{
        "trip": {
            "origin": { "name": "Berlin Hbf", "location": { "latitude": 52.525589, "longitude": 13.369549 } },
            "destination": { "name": "Hamburg Hbf", "location": { "latitude": 53.552736, "longitude": 10.006909 } },
            "departure": "2026-10-19T10:07:00+02:00",
            "plannedDeparture": "2026-10-19T10:02:00+02:00",
            "arrival": "2026-10-19T12:00:00+02:00",
            "plannedArrival": "2026-10-19T11:55:00+02:00",
            "polyline": {
                "type": "FeatureCollection",
                "features": [
                    { "type": "Feature", "geometry": { "type": "Point", "coordinates": [13.369549, 52.525589] } },
                    { "type": "Feature", "geometry": { "type": "Point", "coordinates": [11.0, 53.0] } },
                    { "type": "Feature", "geometry": { "type": "Point", "coordinates": [] } },
                    { "type": "Feature", "geometry": { "type": "Point", "coordinates": [10.006909, 53.552736] } }
                ]
            }
        }
    }"#;

    #[test]
    fn test_parse_departures() {
        let departures = parse_departures(DEPARTURES).unwrap();
        // The bus has no run number and is dropped
        assert_eq!(departures.len(), 2);

        let ice = &departures[0];
        assert_eq!(ice.run_id, "123");
        assert_eq!(ice.line_name, "ICE 123");
        assert_eq!(ice.delay_secs, 300);
        assert_eq!(ice.reported_position, Some([13.37, 52.52]));
        assert_eq!(ice.destination_name.as_deref(), Some("Hamburg Hbf"));

        let re = &departures[1];
        assert_eq!(re.when, None);
        assert_eq!(re.delay_secs, 0);
        assert_eq!(re.reported_position, None);
    }

    #[test]
    fn test_parse_departures_rejects_garbage() {
        assert!(matches!(
            parse_departures("<html>busy</html>"),
            Err(TransitError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_trip_prefers_planned_times() {
        let trip = parse_trip(TRIP).unwrap();
        assert_eq!(trip.origin_name, "Berlin Hbf");
        assert_eq!(trip.origin, [13.369549, 52.525589]);
        assert_eq!(trip.destination, [10.006909, 53.552736]);
        assert_eq!(trip.scheduled_departure.to_rfc3339(), "2026-10-19T10:02:00+02:00");
        assert_eq!(trip.scheduled_arrival.to_rfc3339(), "2026-10-19T11:55:00+02:00");
        // Feature without coordinates is skipped
        assert_eq!(trip.route.len(), 3);
        assert_eq!(trip.route[1], [11.0, 53.0]);
    }

    #[test]
    fn test_parse_trip_requires_named_endpoints() {
        let unnamed = TRIP.replace(r#""name": "Hamburg Hbf""#, r#""name": """#);
        assert!(matches!(
            parse_trip(&unnamed),
            Err(TransitError::IncompleteTrip(field)) if field == "destination"
        ));
    }

    #[test]
    fn test_parse_trip_without_polyline() {
        let body = r#"{"trip": {
            "origin": { "name": "A", "location": { "latitude": 0.0, "longitude": 0.0 } },
            "destination": { "name": "B", "location": { "latitude": 10.0, "longitude": 0.0 } },
            "departure": "2026-10-19T10:00:00Z",
            "arrival": "2026-10-19T11:00:00Z"
        }}"#;
        let trip = parse_trip(body).unwrap();
        assert!(trip.route.is_empty());
        assert_eq!(trip.scheduled_departure.to_rfc3339(), "2026-10-19T10:00:00+00:00");
    }
}
