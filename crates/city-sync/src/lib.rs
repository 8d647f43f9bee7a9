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

//! Rendering-agnostic core of the CityPulse map dashboard.
//!
//! The dashboard overlays simulated energy, traffic, and weather data for
//! Boston on an interactive map. This crate owns everything that does not
//! depend on a rendering library, in layers that can be used independently:
//!
//! - **Model layer** ([`model`]): entities, snapshots, categories, and
//!   coordinate validation.
//! - **Sync layer** ([`reconcile`], [`registry`]): the pure snapshot diff and
//!   the overlay registry that applies it through the [`MapSurface`] seam,
//!   including hover/pinned popup lifecycle.
//! - **State layer** ([`selection`]): the shared active-category store with
//!   observer subscriptions.
//! - **Refresh layer** ([`driver`]): cancellable periodic re-fetching with
//!   strict request-sequence ordering under overlapping fetches.
//!
//! # Quick start
//!
//! ```no_run
//! use city_sync::{Category, DriverConfig, FeedError, RefreshDriver, Snapshot};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let driver = RefreshDriver::spawn(DriverConfig::new(Category::Traffic), || async {
//!         // Fetch and decode the backend snapshot here.
//!         Ok::<Snapshot, FeedError>(Snapshot::new(Category::Traffic, Vec::new()))
//!     });
//!
//!     let slot = driver.slot();
//!     // UI loop: poll the slot, reconcile into an OverlayRegistry.
//!     let _latest = slot.lock().unwrap().generation();
//! }
//! ```

pub mod driver;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod selection;

pub use driver::{
    DriverConfig, FeedError, FeedSlot, FeedStatus, RefreshDriver, SharedFeedSlot,
    DEFAULT_REFRESH_INTERVAL,
};
pub use model::{
    Category, CongestionLevel, Coordinates, Entity, EntityDetails, EntityId, EntityKind, Snapshot,
    UsageReading,
};
pub use reconcile::{reconcile, SkipReason, SkippedEntity, SyncPlan};
pub use registry::{
    click_exclusive, hover_exclusive, ApplyStats, MapSurface, Overlay, OverlayRegistry,
};
pub use selection::{SelectionStore, Subscription};
