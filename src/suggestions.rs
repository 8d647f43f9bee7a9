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

//! AI suggestion panel backend.
//!
//! The suggestion endpoint forwards aggregated dashboard data to an LLM
//! provider; this module only consumes its output shape. Any failure along
//! that path (network, HTTP, decode, backend error) degrades to a built-in
//! static suggestion list so the panel never goes blank. Responses are
//! cached with a TTL to spare the paid API.

use log::warn;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One suggestion record from the LLM endpoint (or the fallback list).
#[derive(Debug, Clone, Deserialize)]
pub struct Suggestion {
    pub title: String,
    /// Why the model proposes this, in one or two sentences.
    #[serde(alias = "description")]
    pub rationale: String,
    /// "low" | "medium" | "high" as emitted by the backend.
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Estimated annual savings in dollars, when the model offers one.
    #[serde(default, alias = "potential_savings")]
    pub estimated_savings: Option<f64>,
    #[serde(default)]
    pub timeline: Option<String>,
    #[serde(default, alias = "confidence_score")]
    pub confidence: Option<f64>,
}

fn default_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Deserialize)]
struct SuggestionEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    insights: Vec<Suggestion>,
}

/// Where the currently displayed list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionSource {
    /// Live response from the LLM endpoint.
    Live,
    /// Built-in list shown because the endpoint failed.
    Fallback,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    suggestions: Vec<Suggestion>,
    source: SuggestionSource,
    fetched_at: Instant,
}

/// Client for the suggestion endpoint with TTL caching and static fallback.
#[derive(Debug, Clone)]
pub struct SuggestionService {
    base_url: String,
    http: reqwest::Client,
    cache: Arc<Mutex<Option<CacheEntry>>>,
    cache_ttl: Duration,
}

impl SuggestionService {
    pub fn new(base_url: impl Into<String>, cache_ttl: Duration) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
            cache: Arc::new(Mutex::new(None)),
            cache_ttl,
        }
    }

    /// Fetch suggestions, serving from cache while fresh. Never fails: a
    /// broken endpoint yields the fallback list tagged as such.
    pub async fn fetch(
        &self,
        building_id: Option<i64>,
    ) -> (Vec<Suggestion>, SuggestionSource) {
        if let Some(entry) = self.cached() {
            return (entry.suggestions, entry.source);
        }

        let (suggestions, source) = match self.fetch_live(building_id).await {
            Ok(suggestions) if !suggestions.is_empty() => (suggestions, SuggestionSource::Live),
            Ok(_) => {
                warn!("suggestion endpoint returned an empty list, using fallback");
                (fallback_suggestions(), SuggestionSource::Fallback)
            }
            Err(err) => {
                warn!("suggestion endpoint failed, using fallback: {err}");
                (fallback_suggestions(), SuggestionSource::Fallback)
            }
        };

        self.store(suggestions.clone(), source);
        (suggestions, source)
    }

    /// Drop the cache so the next fetch goes to the endpoint again.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    /// POST to the generation route, scoped to one building when a building
    /// marker is pinned. A null building_id asks for city-wide insights.
    fn generate_url(&self) -> String {
        format!("{}/api/insights/generate-insights", self.base_url)
    }

    async fn fetch_live(&self, building_id: Option<i64>) -> Result<Vec<Suggestion>, String> {
        let url = self.generate_url();
        let request_id = Uuid::new_v4();
        let body = json!({
            "request_id": request_id,
            "building_id": building_id,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        let envelope: SuggestionEnvelope = response.json().await.map_err(|e| e.to_string())?;
        if !envelope.success {
            return Err(envelope
                .error
                .unwrap_or_else(|| "backend reported failure".to_string()));
        }
        Ok(envelope.insights)
    }

    fn cached(&self) -> Option<CacheEntry> {
        let cache = self.cache.lock().ok()?;
        cache
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.cache_ttl)
            .cloned()
    }

    fn store(&self, suggestions: Vec<Suggestion>, source: SuggestionSource) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CacheEntry {
                suggestions,
                source,
                fetched_at: Instant::now(),
            });
        }
    }
}

/// Static suggestions shown when the LLM endpoint is unreachable. Content
/// mirrors the demo recommendations the original analyzer shipped with.
pub fn fallback_suggestions() -> Vec<Suggestion> {
    vec![
        Suggestion {
            title: "Extend green time on the highest-volume approach".to_string(),
            rationale: "The busiest street at a congested intersection needs signal priority to prevent queue spillback.".to_string(),
            priority: "high".to_string(),
            category: Some("traffic".to_string()),
            estimated_savings: None,
            timeline: Some("1-2 weeks".to_string()),
            confidence: Some(0.7),
        },
        Suggestion {
            title: "Coordinate signal progression on a 90-second cycle".to_string(),
            rationale: "Coordinated timing keeps platoons from hitting consecutive red lights, cutting travel time roughly 15%.".to_string(),
            priority: "medium".to_string(),
            category: Some("traffic".to_string()),
            estimated_savings: None,
            timeline: Some("1 month".to_string()),
            confidence: Some(0.65),
        },
        Suggestion {
            title: "Schedule HVAC setbacks in low-occupancy buildings".to_string(),
            rationale: "Buildings with high energy intensity per square foot typically run heating and cooling outside occupied hours.".to_string(),
            priority: "high".to_string(),
            category: Some("energy".to_string()),
            estimated_savings: Some(12000.0),
            timeline: Some("2-4 weeks".to_string()),
            confidence: Some(0.75),
        },
        Suggestion {
            title: "Weather-normalize monthly energy reviews".to_string(),
            rationale: "Comparing raw month-over-month usage confuses weather swings with efficiency changes; degree-day normalization separates them.".to_string(),
            priority: "low".to_string(),
            category: Some("energy".to_string()),
            estimated_savings: None,
            timeline: Some("ongoing".to_string()),
            confidence: Some(0.8),
        },
        Suggestion {
            title: "Install adaptive signal timing at severe intersections".to_string(),
            rationale: "Traffic patterns shift through the day; sensors feeding an adaptive controller improve overall efficiency around 20%.".to_string(),
            priority: "medium".to_string(),
            category: Some("traffic".to_string()),
            estimated_savings: None,
            timeline: Some("3-6 months".to_string()),
            confidence: Some(0.6),
        },
    ]
}
