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

//! Application configuration management.
//!
//! Persistent TOML configuration via confy: backend endpoint, refresh
//! cadence, map defaults, and per-category layer visibility. Every field has
//! a serde default so configs written by older builds keep loading.

use serde::{Deserialize, Serialize};

/// Default backend serving the generated snapshots.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";

/// Boston City Hall, the dashboard's home position.
pub const DEFAULT_CENTER: (f64, f64) = (42.3601, -71.0589);

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// Base URL of the data backend
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Snapshot refresh cadence in seconds
    #[serde(default = "default_refresh_seconds")]
    pub refresh_seconds: u64,

    /// Default map zoom level (10.0 - 16.0)
    #[serde(default = "default_zoom")]
    pub default_zoom: f32,

    /// Override map center latitude (defaults to Boston)
    #[serde(default)]
    pub override_center_lat: Option<f64>,

    /// Override map center longitude (defaults to Boston)
    #[serde(default)]
    pub override_center_lon: Option<f64>,

    /// Show energy building markers
    #[serde(default = "default_true")]
    pub show_energy: bool,

    /// Show traffic intersection markers
    #[serde(default = "default_true")]
    pub show_traffic: bool,

    /// Show weather station markers
    #[serde(default = "default_true")]
    pub show_weather: bool,

    /// Entity list panel expanded state
    #[serde(default = "default_true")]
    pub entity_list_expanded: bool,

    /// Enable the AI suggestions panel
    #[serde(default = "default_true")]
    pub suggestions_enabled: bool,

    /// Suggestion cache lifetime in seconds
    #[serde(default = "default_suggestion_ttl")]
    pub suggestion_ttl_seconds: u64,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_refresh_seconds() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

fn default_zoom() -> f32 {
    13.0
}

fn default_suggestion_ttl() -> u64 {
    600
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            backend_url: default_backend_url(),
            refresh_seconds: default_refresh_seconds(),
            default_zoom: default_zoom(),
            override_center_lat: None,
            override_center_lon: None,
            show_energy: true,
            show_traffic: true,
            show_weather: true,
            entity_list_expanded: true,
            suggestions_enabled: true,
            suggestion_ttl_seconds: default_suggestion_ttl(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, falling back to defaults.
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load("citypulse-desktop", "config")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store("citypulse-desktop", "config", self)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<std::path::PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path("citypulse-desktop", "config")
    }

    /// Map center: override if set, otherwise Boston.
    pub fn map_center(&self) -> (f64, f64) {
        match (self.override_center_lat, self.override_center_lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => DEFAULT_CENTER,
        }
    }
}
