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

//! Periodic refresh driver.
//!
//! [`RefreshDriver`] re-runs a snapshot fetch on a fixed cadence and on
//! demand, writing accepted results into a [`SharedFeedSlot`] the UI polls
//! each frame. Overlapping in-flight fetches are tolerated: every issued
//! request carries a monotonically increasing sequence number and a response
//! is applied only if its sequence is greater than the last applied one, so
//! a slow stale response can never overwrite a newer snapshot.
//!
//! Failure keeps the last-good snapshot in the slot (stale data beats a
//! blank map) and flips the status to a recoverable error; `refresh_now` is
//! the manual retry. `shutdown` (or dropping the driver) cancels the timer,
//! and any fetch still in flight becomes a no-op when it resolves.

use crate::model::{Category, Snapshot};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default refresh cadence. The dashboard data only regenerates every few
/// minutes, so three minutes keeps the map fresh without hammering the
/// backend.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(180);

/// Why a fetch produced no snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("backend reported failure: {0}")]
    Backend(String),
}

/// Fetch lifecycle state surfaced in the status strip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// No fetch has completed yet.
    Idle,
    /// Last fetch succeeded.
    Ok { at: DateTime<Utc> },
    /// Last fetch failed; the slot keeps the previous snapshot.
    Error { message: String, at: DateTime<Utc> },
}

/// Shared landing zone for one feed. The driver writes, the UI polls.
#[derive(Debug)]
pub struct FeedSlot {
    snapshot: Option<Snapshot>,
    status: FeedStatus,
    /// Sequence number of the applied snapshot; gate for stale responses.
    applied_seq: u64,
    /// Bumped on every accepted snapshot so the UI can cheaply detect news.
    generation: u64,
    in_flight: usize,
}

impl FeedSlot {
    fn new() -> Self {
        Self {
            snapshot: None,
            status: FeedStatus::Idle,
            applied_seq: 0,
            generation: 0,
            in_flight: 0,
        }
    }

    /// Last accepted snapshot, stale-but-present on error.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn status(&self) -> &FeedStatus {
        &self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while at least one fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.in_flight > 0
    }
}

pub type SharedFeedSlot = Arc<Mutex<FeedSlot>>;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub category: Category,
    pub interval: Duration,
}

impl DriverConfig {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Handle to one running refresh loop. Dropping it shuts the loop down.
#[derive(Debug)]
pub struct RefreshDriver {
    category: Category,
    slot: SharedFeedSlot,
    cancel: CancellationToken,
    refresh: Arc<Notify>,
}

impl RefreshDriver {
    /// Spawn the refresh loop on the current tokio runtime. The first fetch
    /// is issued immediately, then one per interval tick and one per
    /// [`refresh_now`](Self::refresh_now) call.
    pub fn spawn<F, Fut>(config: DriverConfig, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Snapshot, FeedError>> + Send + 'static,
    {
        let slot: SharedFeedSlot = Arc::new(Mutex::new(FeedSlot::new()));
        let cancel = CancellationToken::new();
        let refresh = Arc::new(Notify::new());

        let driver = Self {
            category: config.category,
            slot: slot.clone(),
            cancel: cancel.clone(),
            refresh: refresh.clone(),
        };

        let fetch = Arc::new(fetch);
        tokio::spawn(async move {
            run_loop(config, fetch, slot, cancel, refresh).await;
        });

        driver
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Shared slot for polling snapshots and status.
    pub fn slot(&self) -> SharedFeedSlot {
        self.slot.clone()
    }

    /// Ask for an immediate re-fetch (manual retry). A refresh already in
    /// flight is not cancelled; sequence ordering decides which response
    /// lands.
    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    /// Stop the loop. Fetches still in flight are dropped when they resolve.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RefreshDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop<F, Fut>(
    config: DriverConfig,
    fetch: Arc<F>,
    slot: SharedFeedSlot,
    cancel: CancellationToken,
    refresh: Arc<Notify>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Snapshot, FeedError>> + Send + 'static,
{
    info!(
        "starting {} refresh loop (every {:?})",
        config.category, config.interval
    );

    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut next_seq: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
            () = refresh.notified() => {
                debug!("{}: refresh requested", config.category);
            }
        }

        next_seq += 1;
        let seq = next_seq;
        slot.lock()
            .expect("feed slot lock poisoned - unrecoverable state")
            .in_flight += 1;

        let fetch = fetch.clone();
        let slot = slot.clone();
        let cancel = cancel.clone();
        let category = config.category;
        tokio::spawn(async move {
            let result = fetch().await;

            let mut slot = slot
                .lock()
                .expect("feed slot lock poisoned - unrecoverable state");
            slot.in_flight = slot.in_flight.saturating_sub(1);

            // A fetch that resolves after shutdown targets a torn-down view
            // and must not mutate anything.
            if cancel.is_cancelled() {
                return;
            }

            match result {
                Ok(snapshot) => {
                    if seq <= slot.applied_seq {
                        debug!(
                            "{category}: dropping stale response (seq {seq} <= {})",
                            slot.applied_seq
                        );
                        return;
                    }
                    debug!(
                        "{category}: applied snapshot seq {seq} ({} entities)",
                        snapshot.len()
                    );
                    slot.applied_seq = seq;
                    slot.snapshot = Some(snapshot);
                    slot.status = FeedStatus::Ok { at: Utc::now() };
                    slot.generation += 1;
                }
                Err(err) => {
                    // An error from a request older than the applied
                    // snapshot carries no news.
                    if seq <= slot.applied_seq {
                        return;
                    }
                    warn!("{category}: fetch failed, keeping last snapshot: {err}");
                    slot.status = FeedStatus::Error {
                        message: err.to_string(),
                        at: Utc::now(),
                    };
                }
            }
        });
    }

    info!("{} refresh loop stopped", config.category);
}
