// Copyright 2025 The CityPulse Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Backend snapshot fetchers.
//!
//! The backend wraps every collection in a `{success, count, <key>: [...]}`
//! envelope. A failed envelope or transport error is a [`FeedError`] (the
//! refresh driver keeps the last-good snapshot); a single malformed record
//! inside a healthy envelope is skipped with a warning and the rest of the
//! snapshot survives.

use chrono::Utc;
use city_sync::{
    Category, CongestionLevel, Coordinates, Entity, EntityDetails, EntityId, EntityKind, FeedError,
    Snapshot, UsageReading,
};
use log::warn;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// HTTP client for the dashboard backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BuildingWire {
    id: i64,
    name: String,
    #[serde(default)]
    address: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    square_feet: u32,
    #[serde(default)]
    category: String,
    #[serde(default)]
    year_built: u16,
}

#[derive(Debug, Deserialize)]
struct EnergyReadingWire {
    building_id: i64,
    reading_date: String,
    usage: f64,
    cost: f64,
}

#[derive(Debug, Deserialize)]
struct IntersectionWire {
    id: i64,
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    streets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TrafficDataWire {
    intersection_id: i64,
    reading_timestamp: String,
    #[serde(default)]
    total_vehicle_count: u32,
    #[serde(default)]
    average_speed: f64,
    congestion_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StationWire {
    id: i64,
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WeatherDataWire {
    station_id: i64,
    reading_date: String,
    temp_avg: Option<f64>,
    precipitation: Option<f64>,
    wind_speed: Option<f64>,
    humidity: Option<f64>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the full entity snapshot for one category.
    pub async fn fetch_snapshot(&self, category: Category) -> Result<Snapshot, FeedError> {
        let entities = match category {
            Category::Energy => self.fetch_energy().await?,
            Category::Traffic => self.fetch_traffic().await?,
            Category::Weather => self.fetch_weather().await?,
        };
        Ok(Snapshot::new(category, entities))
    }

    async fn fetch_energy(&self) -> Result<Vec<Entity>, FeedError> {
        let buildings = self.get_rows("/api/energy/buildings", "buildings").await?;
        // Readings are optional context; a failure here degrades popups, not
        // the map.
        let readings = match self.get_rows("/api/energy/readings", "readings").await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("energy readings unavailable: {err}");
                Vec::new()
            }
        };
        Ok(building_entities(buildings, readings))
    }

    async fn fetch_traffic(&self) -> Result<Vec<Entity>, FeedError> {
        let intersections = self
            .get_rows("/api/traffic/intersections", "intersections")
            .await?;
        let data = match self.get_rows("/api/traffic/data", "data").await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("traffic readings unavailable: {err}");
                Vec::new()
            }
        };
        Ok(intersection_entities(intersections, data))
    }

    async fn fetch_weather(&self) -> Result<Vec<Entity>, FeedError> {
        let stations = self.get_rows("/api/weather/stations", "stations").await?;
        let data = match self.get_rows("/api/weather/data", "data").await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("weather readings unavailable: {err}");
                Vec::new()
            }
        };
        Ok(station_entities(stations, data))
    }

    /// GET an envelope and pull out the named collection.
    async fn get_rows(&self, path: &str, key: &str) -> Result<Vec<Value>, FeedError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::Http(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;

        envelope_rows(&body, key)
    }
}

/// Validate the `{success, ...}` envelope and extract the row array.
fn envelope_rows(body: &Value, key: &str) -> Result<Vec<Value>, FeedError> {
    if !body.get("success").and_then(Value::as_bool).unwrap_or(false) {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(FeedError::Backend(message.to_string()));
    }
    match body.get(key) {
        Some(Value::Array(rows)) => Ok(rows.clone()),
        _ => Err(FeedError::Decode(format!("missing '{key}' collection"))),
    }
}

/// Decode each row individually so one bad record skips, not aborts.
fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<Value>, what: &str) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!("skipping malformed {what} record: {err}");
                None
            }
        })
        .collect()
}

fn coordinates(lat: Option<f64>, lon: Option<f64>) -> Option<Coordinates> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
        _ => None,
    }
}

/// Latest row per entity, picked by an orderable date string (the backend
/// emits ISO-8601, which sorts lexicographically).
fn latest_by_key<T, K, D>(rows: Vec<T>, key: K, date: D) -> HashMap<i64, T>
where
    K: Fn(&T) -> i64,
    D: Fn(&T) -> &str,
{
    let mut latest: HashMap<i64, T> = HashMap::new();
    for row in rows {
        let id = key(&row);
        match latest.get(&id) {
            Some(existing) if date(existing) >= date(&row) => {}
            _ => {
                latest.insert(id, row);
            }
        }
    }
    latest
}

/// Reading history per building, oldest first (the backend emits ISO-8601
/// dates, which sort lexicographically).
fn readings_by_building(readings: Vec<EnergyReadingWire>) -> HashMap<i64, Vec<UsageReading>> {
    let mut history: HashMap<i64, Vec<UsageReading>> = HashMap::new();
    for r in readings {
        history.entry(r.building_id).or_default().push(UsageReading {
            date: r.reading_date,
            usage_kwh: r.usage,
            cost: r.cost,
        });
    }
    for readings in history.values_mut() {
        readings.sort_by(|a, b| a.date.cmp(&b.date));
    }
    history
}

fn building_entities(buildings: Vec<Value>, readings: Vec<Value>) -> Vec<Entity> {
    let buildings: Vec<BuildingWire> = decode_rows(buildings, "building");
    let readings: Vec<EnergyReadingWire> = decode_rows(readings, "energy reading");
    let mut history = readings_by_building(readings);

    buildings
        .into_iter()
        .map(|b| Entity {
            id: EntityId::new(EntityKind::Building, b.id),
            coordinates: coordinates(b.latitude, b.longitude),
            details: EntityDetails::Building {
                name: b.name,
                address: b.address,
                square_feet: b.square_feet,
                building_category: b.category,
                year_built: b.year_built,
                usage_history: history.remove(&b.id).unwrap_or_default(),
            },
            updated_at: Utc::now(),
        })
        .collect()
}

fn intersection_entities(intersections: Vec<Value>, data: Vec<Value>) -> Vec<Entity> {
    let intersections: Vec<IntersectionWire> = decode_rows(intersections, "intersection");
    let data: Vec<TrafficDataWire> = decode_rows(data, "traffic reading");
    let mut latest = latest_by_key(
        data,
        |r| r.intersection_id,
        |r| r.reading_timestamp.as_str(),
    );

    intersections
        .into_iter()
        .map(|i| {
            let reading = latest.remove(&i.id);
            let (count, speed) = reading
                .as_ref()
                .map_or((0, 0.0), |r| (r.total_vehicle_count, r.average_speed));
            let congestion = reading
                .as_ref()
                .and_then(|r| r.congestion_level.as_deref().map(parse_congestion))
                .unwrap_or_else(|| CongestionLevel::classify(count, speed));

            Entity {
                id: EntityId::new(EntityKind::Intersection, i.id),
                coordinates: coordinates(i.latitude, i.longitude),
                details: EntityDetails::Intersection {
                    name: i.name,
                    streets: i.streets,
                    total_vehicle_count: count,
                    average_speed: speed,
                    congestion,
                },
                updated_at: Utc::now(),
            }
        })
        .collect()
}

fn station_entities(stations: Vec<Value>, data: Vec<Value>) -> Vec<Entity> {
    let stations: Vec<StationWire> = decode_rows(stations, "station");
    let data: Vec<WeatherDataWire> = decode_rows(data, "weather reading");
    let mut latest = latest_by_key(data, |r| r.station_id, |r| r.reading_date.as_str());

    stations
        .into_iter()
        .map(|s| {
            let reading = latest.remove(&s.id);
            Entity {
                id: EntityId::new(EntityKind::Station, s.id),
                coordinates: coordinates(s.latitude, s.longitude),
                details: EntityDetails::Station {
                    name: s.name,
                    temp_avg_f: reading.as_ref().and_then(|r| r.temp_avg),
                    precipitation_in: reading.as_ref().and_then(|r| r.precipitation),
                    wind_speed_mph: reading.as_ref().and_then(|r| r.wind_speed),
                    humidity: reading.as_ref().and_then(|r| r.humidity),
                },
                updated_at: Utc::now(),
            }
        })
        .collect()
}

fn parse_congestion(level: &str) -> CongestionLevel {
    match level {
        "severe" => CongestionLevel::Severe,
        "high" => CongestionLevel::High,
        "moderate" => CongestionLevel::Moderate,
        _ => CongestionLevel::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_success_false_is_backend_error() {
        let body = json!({"success": false, "error": "db down"});
        let err = envelope_rows(&body, "buildings").unwrap_err();
        assert_eq!(err, FeedError::Backend("db down".to_string()));
    }

    #[test]
    fn test_envelope_missing_collection_is_decode_error() {
        let body = json!({"success": true, "count": 0});
        assert!(matches!(
            envelope_rows(&body, "buildings"),
            Err(FeedError::Decode(_))
        ));
    }

    #[test]
    fn test_building_entities_carry_sorted_reading_history() {
        let buildings = vec![json!({
            "id": 1, "name": "Central Library", "address": "700 Boylston St",
            "latitude": 42.3493, "longitude": -71.0782,
            "square_feet": 930000, "category": "Library", "year_built": 1895
        })];
        // Backend order is not guaranteed; newest arrives first here.
        let readings = vec![
            json!({"building_id": 1, "reading_date": "2025-07-01", "fuel_type": "electricity", "usage": 45200.0, "cost": 6780.0}),
            json!({"building_id": 1, "reading_date": "2025-06-01", "fuel_type": "electricity", "usage": 41000.0, "cost": 6150.0}),
            json!({"building_id": 9, "reading_date": "2025-07-01", "fuel_type": "electricity", "usage": 100.0, "cost": 15.0}),
        ];

        let entities = building_entities(buildings, readings);
        assert_eq!(entities.len(), 1);
        match &entities[0].details {
            EntityDetails::Building { usage_history, .. } => {
                assert_eq!(usage_history.len(), 2);
                assert_eq!(usage_history[0].date, "2025-06-01");
                assert_eq!(usage_history[1].usage_kwh, 45200.0);
            }
            other => panic!("unexpected details: {other:?}"),
        }
        let latest = entities[0].details.latest_usage().unwrap();
        assert_eq!(latest.date, "2025-07-01");
        assert_eq!(latest.cost, 6780.0);
    }

    #[test]
    fn test_missing_latitude_yields_no_coordinates() {
        let buildings = vec![json!({
            "id": 2, "name": "City Hall", "address": "1 City Hall Sq",
            "latitude": null, "longitude": -71.0577,
            "square_feet": 500000, "category": "Administration", "year_built": 1968
        })];

        let entities = building_entities(buildings, vec![]);
        assert_eq!(entities.len(), 1);
        assert!(entities[0].coordinates.is_none());
    }

    #[test]
    fn test_malformed_record_skipped_rest_survives() {
        let buildings = vec![
            json!({"id": "not a number", "name": 3}),
            json!({
                "id": 3, "name": "North End Branch", "address": "25 Parmenter St",
                "latitude": 42.3647, "longitude": -71.0542,
                "square_feet": 12000, "category": "Library", "year_built": 1913
            }),
        ];

        let entities = building_entities(buildings, vec![]);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, EntityId::new(EntityKind::Building, 3));
    }

    #[test]
    fn test_intersection_congestion_from_backend_or_classified() {
        let intersections = vec![
            json!({"id": 1, "name": "Mass Ave & Beacon", "latitude": 42.3505, "longitude": -71.0890, "streets": ["Mass Ave", "Beacon St"]}),
            json!({"id": 2, "name": "Comm Ave & BU Bridge", "latitude": 42.3513, "longitude": -71.1100, "streets": ["Comm Ave"]}),
        ];
        let data = vec![
            json!({"intersection_id": 1, "reading_timestamp": "2025-07-01T08:00:00", "total_vehicle_count": 120, "average_speed": 25.0, "congestion_level": "severe"}),
            json!({"intersection_id": 2, "reading_timestamp": "2025-07-01T08:00:00", "total_vehicle_count": 250, "average_speed": 12.0, "congestion_level": null}),
        ];

        let entities = intersection_entities(intersections, data);
        let congestion_of = |idx: usize| match &entities[idx].details {
            EntityDetails::Intersection { congestion, .. } => *congestion,
            other => panic!("unexpected details: {other:?}"),
        };
        // Backend label wins when present; otherwise classified locally.
        assert_eq!(congestion_of(0), CongestionLevel::Severe);
        assert_eq!(congestion_of(1), CongestionLevel::Severe);
    }

    #[test]
    fn test_station_without_reading_has_empty_payload() {
        let stations = vec![json!({"id": 1, "name": "Logan", "latitude": 42.3656, "longitude": -71.0096})];
        let entities = station_entities(stations, vec![]);
        match &entities[0].details {
            EntityDetails::Station { temp_avg_f, .. } => assert!(temp_avg_f.is_none()),
            other => panic!("unexpected details: {other:?}"),
        }
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = BackendClient::new("http://localhost:5000/");
        assert_eq!(client.base_url, "http://localhost:5000");
    }
}
