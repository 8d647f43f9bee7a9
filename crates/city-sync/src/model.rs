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

//! Data model shared between the fetchers, the reconciler, and the UI.
//!
//! An [`Entity`] is one map-worthy record (a municipal building, a traffic
//! intersection, a weather station, or a user-dropped pinpoint) identified by
//! a stable [`EntityId`]. A [`Snapshot`] is the full set of entities one
//! fetch returned for a category. Coordinates are optional on the wire and
//! validated here; entities without a usable position never become overlays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data category shown on the map and toggled by the side panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Energy,
    Traffic,
    Weather,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Energy, Category::Traffic, Category::Weather];

    /// Label used in panel headers and log lines.
    pub fn label(self) -> &'static str {
        match self {
            Category::Energy => "Energy",
            Category::Traffic => "Traffic",
            Category::Weather => "Weather",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Kind of entity behind an overlay. Each kind belongs to exactly one
/// [`Category`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Building,
    Intersection,
    Station,
    Pinpoint,
}

impl EntityKind {
    pub fn category(self) -> Category {
        match self {
            EntityKind::Building => Category::Energy,
            // Pinpoints are ad-hoc traffic measurement points from the analyzer.
            EntityKind::Intersection | EntityKind::Pinpoint => Category::Traffic,
            EntityKind::Station => Category::Weather,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            EntityKind::Building => "building",
            EntityKind::Intersection => "intersection",
            EntityKind::Station => "station",
            EntityKind::Pinpoint => "pinpoint",
        }
    }
}

/// Stable key for an entity across snapshots. Backend ids are only unique
/// per table, so the kind is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityId {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

/// Geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Finite and inside the valid lat/lon envelope. The backend generator
    /// occasionally emits nulls or zeros-as-strings; those must be skipped,
    /// not rendered at (0, 0) off the African coast.
    pub fn is_valid(self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Traffic congestion buckets, thresholds matching the backend generator
/// (volume > 200 or speed < 15 mph is severe, and so on down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Moderate,
    High,
    Severe,
}

impl CongestionLevel {
    /// Classify a reading the same way the backend does, for rows that
    /// arrive without a precomputed level.
    pub fn classify(vehicle_count: u32, average_speed: f64) -> Self {
        if vehicle_count > 200 || average_speed < 15.0 {
            CongestionLevel::Severe
        } else if vehicle_count > 150 || average_speed < 22.0 {
            CongestionLevel::High
        } else if vehicle_count > 80 || average_speed < 28.0 {
            CongestionLevel::Moderate
        } else {
            CongestionLevel::Low
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CongestionLevel::Low => "Low",
            CongestionLevel::Moderate => "Moderate",
            CongestionLevel::High => "High",
            CongestionLevel::Severe => "Severe",
        }
    }
}

/// One monthly electricity reading for a building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReading {
    /// ISO date of the reading month; sorts chronologically as a string.
    pub date: String,
    pub usage_kwh: f64,
    pub cost: f64,
}

/// Category-specific attributes carried only for popup rendering and
/// derived styling. Nothing in the sync machinery reads these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityDetails {
    Building {
        name: String,
        address: String,
        square_feet: u32,
        building_category: String,
        year_built: u16,
        /// Monthly electricity readings, oldest first. Empty until the
        /// readings feed delivers.
        usage_history: Vec<UsageReading>,
    },
    Intersection {
        name: String,
        streets: Vec<String>,
        total_vehicle_count: u32,
        average_speed: f64,
        congestion: CongestionLevel,
    },
    Station {
        name: String,
        temp_avg_f: Option<f64>,
        precipitation_in: Option<f64>,
        wind_speed_mph: Option<f64>,
        humidity: Option<f64>,
    },
    Pinpoint {
        label: String,
    },
}

impl EntityDetails {
    /// Display name for lists and popup titles.
    pub fn name(&self) -> &str {
        match self {
            EntityDetails::Building { name, .. }
            | EntityDetails::Intersection { name, .. }
            | EntityDetails::Station { name, .. } => name,
            EntityDetails::Pinpoint { label } => label,
        }
    }

    /// Newest monthly reading, for buildings that have any.
    pub fn latest_usage(&self) -> Option<&UsageReading> {
        match self {
            EntityDetails::Building { usage_history, .. } => usage_history.last(),
            _ => None,
        }
    }
}

/// One map-worthy record from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Missing or invalid coordinates make this entity a data-quality skip.
    pub coordinates: Option<Coordinates>,
    pub details: EntityDetails,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Coordinates, but only if they pass validation.
    pub fn valid_coordinates(&self) -> Option<Coordinates> {
        self.coordinates.filter(|c| c.is_valid())
    }
}

/// Everything one fetch returned for a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub category: Category,
    pub entities: Vec<Entity>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(category: Category, entities: Vec<Entity>) -> Self {
        Self {
            category,
            entities,
            taken_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinates::new(42.3601, -71.0589).is_valid());
        assert!(!Coordinates::new(f64::NAN, -71.0).is_valid());
        assert!(!Coordinates::new(91.0, -71.0).is_valid());
        assert!(!Coordinates::new(42.0, -181.0).is_valid());
        assert!(!Coordinates::new(42.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_kind_category_mapping() {
        assert_eq!(EntityKind::Building.category(), Category::Energy);
        assert_eq!(EntityKind::Intersection.category(), Category::Traffic);
        assert_eq!(EntityKind::Pinpoint.category(), Category::Traffic);
        assert_eq!(EntityKind::Station.category(), Category::Weather);
    }

    #[test]
    fn test_congestion_thresholds() {
        assert_eq!(CongestionLevel::classify(250, 20.0), CongestionLevel::Severe);
        assert_eq!(CongestionLevel::classify(100, 14.0), CongestionLevel::Severe);
        assert_eq!(CongestionLevel::classify(160, 25.0), CongestionLevel::High);
        assert_eq!(CongestionLevel::classify(100, 25.0), CongestionLevel::Moderate);
        assert_eq!(CongestionLevel::classify(50, 35.0), CongestionLevel::Low);
    }

    #[test]
    fn test_entity_id_display() {
        let id = EntityId::new(EntityKind::Building, 7);
        assert_eq!(id.to_string(), "building/7");
    }
}
