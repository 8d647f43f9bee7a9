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

//! Shared selection state.
//!
//! [`SelectionStore`] holds the currently active [`Category`] for the map
//! and the side panels. `select` is a toggle: selecting the active category
//! clears it, selecting another replaces it, and no two categories are ever
//! active at once. Views subscribe with a callback and hold the returned
//! [`Subscription`]; dropping it unsubscribes deterministically, so a torn
//! down view can never be notified again.

use crate::model::Category;
use std::sync::{Arc, Mutex, MutexGuard};

type Observer = Box<dyn FnMut(Option<Category>) + Send>;

#[derive(Default)]
struct SelectionState {
    active: Option<Category>,
    observers: Vec<(u64, Observer)>,
    /// Ids whose [`Subscription`] was dropped while the observer list was
    /// detached for a notification pass; purged when the list re-attaches.
    dead: Vec<u64>,
    next_observer_id: u64,
}

/// Shared toggle store for the active data category.
///
/// Cheaply cloneable; all clones see the same state.
#[derive(Clone, Default)]
pub struct SelectionStore {
    state: Arc<Mutex<SelectionState>>,
}

/// Observer registration handle. Unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    state: Arc<Mutex<SelectionState>>,
}

impl std::fmt::Debug for SelectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionStore")
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SelectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionState")
            .field("active", &self.active)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl SelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently active category, if any.
    pub fn active(&self) -> Option<Category> {
        self.state
            .lock()
            .expect("selection state lock poisoned - unrecoverable state")
            .active
    }

    /// Toggle-select a category: same category clears, different replaces.
    /// Observers fire only when the active category actually changed.
    pub fn select(&self, category: Category) {
        let mut state = self
            .state
            .lock()
            .expect("selection state lock poisoned - unrecoverable state");

        let next = if state.active == Some(category) {
            None
        } else {
            Some(category)
        };
        if state.active == next {
            return;
        }
        state.active = next;
        self.notify(state, next);
    }

    /// Clear any active selection.
    pub fn clear(&self) {
        let mut state = self
            .state
            .lock()
            .expect("selection state lock poisoned - unrecoverable state");
        if state.active.is_none() {
            return;
        }
        state.active = None;
        self.notify(state, None);
    }

    /// Detach the observer list and call it with the lock released, so a
    /// callback may read the store, toggle it again, subscribe, or drop a
    /// subscription without deadlocking.
    fn notify(&self, mut state: MutexGuard<'_, SelectionState>, value: Option<Category>) {
        let mut observers = std::mem::take(&mut state.observers);
        drop(state);

        for (_, observer) in &mut observers {
            observer(value);
        }

        let mut state = self
            .state
            .lock()
            .expect("selection state lock poisoned - unrecoverable state");
        let dead = std::mem::take(&mut state.dead);
        observers.retain(|(id, _)| !dead.contains(id));
        // Observers registered by a callback landed in the fresh list; keep
        // them behind the re-attached originals.
        observers.append(&mut state.observers);
        state.observers = observers;
    }

    /// Register an observer called on every change. Keep the returned
    /// [`Subscription`] alive for as long as notifications are wanted.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: FnMut(Option<Category>) + Send + 'static,
    {
        let mut state = self
            .state
            .lock()
            .expect("selection state lock poisoned - unrecoverable state");
        let id = state.next_observer_id;
        state.next_observer_id += 1;
        state.observers.push((id, Box::new(observer)));
        Subscription {
            id,
            state: self.state.clone(),
        }
    }
}

impl Subscription {
    /// Explicit unsubscribe; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            let len_before = state.observers.len();
            state.observers.retain(|(id, _)| *id != self.id);
            if state.observers.len() == len_before {
                // Observer list is detached for a notification pass right
                // now; mark the id so re-attachment drops it.
                state.dead.push(self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_select_same_category_toggles_off() {
        let store = SelectionStore::new();
        store.select(Category::Traffic);
        assert_eq!(store.active(), Some(Category::Traffic));
        store.select(Category::Traffic);
        assert_eq!(store.active(), None);
    }

    #[test]
    fn test_select_different_category_replaces() {
        let store = SelectionStore::new();
        store.select(Category::Traffic);
        store.select(Category::Weather);
        assert_eq!(store.active(), Some(Category::Weather));
    }

    #[test]
    fn test_observers_fire_on_change_only() {
        let store = SelectionStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _sub = store.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.select(Category::Energy); // change
        store.clear(); // change
        store.clear(); // no change
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_sees_new_value() {
        let store = SelectionStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.subscribe(move |active| {
            seen_clone.lock().unwrap().push(active);
        });

        store.select(Category::Traffic);
        store.select(Category::Weather);
        store.select(Category::Weather);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(Category::Traffic), Some(Category::Weather), None]
        );
    }

    #[test]
    fn test_dropped_subscription_stops_notifications() {
        let store = SelectionStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let sub = store.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.select(Category::Energy);
        drop(sub);
        store.select(Category::Traffic);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_may_read_store_during_notification() {
        let store = SelectionStore::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let reader = store.clone();
        let _sub = store.subscribe(move |_| {
            // Re-entrant read; must not deadlock on the state lock.
            *seen_clone.lock().unwrap() = Some(reader.active());
        });

        store.select(Category::Traffic);
        assert_eq!(*seen.lock().unwrap(), Some(Some(Category::Traffic)));
    }

    #[test]
    fn test_observer_may_subscribe_during_notification() {
        let store = SelectionStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let late_subs: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let store_clone = store.clone();
        let fired_clone = fired.clone();
        let late_clone = late_subs.clone();
        let _sub = store.subscribe(move |_| {
            let fired_inner = fired_clone.clone();
            let sub = store_clone.subscribe(move |_| {
                fired_inner.fetch_add(1, Ordering::SeqCst);
            });
            late_clone.lock().unwrap().push(sub);
        });

        store.select(Category::Energy);
        store.select(Category::Weather);
        // The observer registered during the first pass fires on the second.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_dropping_subscription_during_notification() {
        let store = SelectionStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let victim_slot = victim.clone();
        let _killer = store.subscribe(move |_| {
            victim_slot.lock().unwrap().take();
        });
        *victim.lock().unwrap() = Some(store.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        store.select(Category::Energy);
        store.select(Category::Weather);
        // Unsubscribed during the first pass; must not fire on the second.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_independent_subscribers() {
        let store = SelectionStore::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let a_clone = a.clone();
        let b_clone = b.clone();
        let _sub_a = store.subscribe(move |_| {
            a_clone.fetch_add(1, Ordering::SeqCst);
        });
        let sub_b = store.subscribe(move |_| {
            b_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.select(Category::Energy);
        sub_b.unsubscribe();
        store.select(Category::Weather);

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }
}
