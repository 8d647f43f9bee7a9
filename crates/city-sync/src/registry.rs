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

//! Overlay registry and popup lifecycle.
//!
//! [`OverlayRegistry`] owns the live overlays (at most one per [`EntityId`])
//! and applies [`SyncPlan`]s to a [`MapSurface`], the seam to whatever is
//! actually drawing markers. Popup state lives here too:
//!
//! - a hover popup follows pointer enter/leave and is independent of clicks;
//! - at most one pinned (click) popup exists globally, and opening a new one
//!   closes the previous one first.

use crate::model::{Entity, EntityId, Snapshot};
use crate::reconcile::{reconcile, SyncPlan};
use log::warn;
use std::collections::HashMap;

/// Rendering substrate seam. The registry drives overlay lifetime through
/// this trait; implementations own the visual representation.
pub trait MapSurface {
    /// Visual handle bound 1:1 to an entity id while its overlay lives.
    type Handle;

    /// Instantiate a marker for an entity that just appeared.
    fn place(&mut self, entity: &Entity) -> Self::Handle;

    /// Refresh an existing marker in place: position, derived styling, and
    /// popup content. Must not destroy the handle.
    fn restyle(&mut self, handle: &mut Self::Handle, entity: &Entity);

    /// Tear down a marker whose entity disappeared.
    fn remove(&mut self, handle: Self::Handle);
}

/// A live overlay: the entity as of the last applied snapshot plus its
/// surface handle.
#[derive(Debug)]
pub struct Overlay<H> {
    pub entity: Entity,
    pub handle: H,
}

/// Counts from one applied snapshot, surfaced in the status strip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Registry of live overlays for one view, keyed by entity id.
pub struct OverlayRegistry<S: MapSurface> {
    overlays: HashMap<EntityId, Overlay<S::Handle>>,
    hovered: Option<EntityId>,
    pinned: Option<EntityId>,
}

impl<S: MapSurface> Default for OverlayRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MapSurface> OverlayRegistry<S> {
    pub fn new() -> Self {
        Self {
            overlays: HashMap::new(),
            hovered: None,
            pinned: None,
        }
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.overlays.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Overlay<S::Handle>> {
        self.overlays.get(&id)
    }

    /// Iterate live overlays in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Overlay<S::Handle>> {
        self.overlays.values()
    }

    /// Entity id whose hover popup is open, if any.
    pub fn hovered(&self) -> Option<EntityId> {
        self.hovered
    }

    /// Entity id whose pinned (click) popup is open, if any.
    pub fn pinned(&self) -> Option<EntityId> {
        self.pinned
    }

    /// Reconcile a snapshot and mutate the surface to match it.
    ///
    /// Applying the same snapshot twice never duplicates overlays or leaks
    /// popup state. Skipped entities are logged as data-quality warnings.
    pub fn apply(&mut self, snapshot: &Snapshot, surface: &mut S) -> ApplyStats {
        let rendered = self.overlays.keys().copied().collect();
        let plan = reconcile(&rendered, snapshot);
        self.apply_plan(plan, surface)
    }

    /// Apply a precomputed plan. Exposed separately so callers that already
    /// ran [`reconcile`] (e.g. to inspect the diff) do not diff twice.
    pub fn apply_plan(&mut self, plan: SyncPlan, surface: &mut S) -> ApplyStats {
        let mut stats = ApplyStats {
            skipped: plan.skipped.len(),
            ..ApplyStats::default()
        };

        for skip in &plan.skipped {
            warn!("skipping entity {}: {}", skip.id, skip.reason.describe());
        }

        for id in plan.remove {
            if let Some(overlay) = self.overlays.remove(&id) {
                self.close_popups_for(id);
                surface.remove(overlay.handle);
                stats.removed += 1;
            }
        }

        for entity in plan.update {
            if let Some(overlay) = self.overlays.get_mut(&entity.id) {
                surface.restyle(&mut overlay.handle, &entity);
                overlay.entity = entity;
                stats.updated += 1;
            }
        }

        for entity in plan.create {
            // reconcile() guarantees the id is not rendered, but a stale
            // plan applied out of order must not violate the one-overlay
            // invariant.
            if self.overlays.contains_key(&entity.id) {
                warn!("plan tried to create existing overlay {}", entity.id);
                continue;
            }
            let handle = surface.place(&entity);
            self.overlays.insert(entity.id, Overlay { entity, handle });
            stats.created += 1;
        }

        stats
    }

    /// Pointer entered a marker: open its hover popup. Independent of any
    /// pinned popup.
    pub fn pointer_enter(&mut self, id: EntityId) {
        if self.overlays.contains_key(&id) {
            self.hovered = Some(id);
        }
    }

    /// Pointer left a marker: close the hover popup, even while a pinned
    /// popup for the same or another entity stays open.
    pub fn pointer_leave(&mut self, id: EntityId) {
        if self.hovered == Some(id) {
            self.hovered = None;
        }
    }

    /// Click on a marker: pin its popup, closing any previously pinned one.
    /// Clicking the already-pinned marker unpins it.
    pub fn click(&mut self, id: EntityId) {
        if !self.overlays.contains_key(&id) {
            return;
        }
        if self.pinned == Some(id) {
            self.pinned = None;
        } else {
            self.pinned = Some(id);
        }
    }

    /// Close the pinned popup without a click, if one is open.
    pub fn unpin(&mut self) {
        self.pinned = None;
    }

    /// Dispose every overlay and popup. The view-unmount path.
    pub fn clear(&mut self, surface: &mut S) {
        self.hovered = None;
        self.pinned = None;
        for (_, overlay) in self.overlays.drain() {
            surface.remove(overlay.handle);
        }
    }

    fn close_popups_for(&mut self, id: EntityId) {
        if self.hovered == Some(id) {
            self.hovered = None;
        }
        if self.pinned == Some(id) {
            self.pinned = None;
        }
    }
}

/// Route a click to a group of registries that together form one map.
///
/// The registry owning `id` handles the click, toggle semantics included;
/// every other registry closes its pinned popup. At most one pinned popup
/// exists across the whole group afterwards.
pub fn click_exclusive<'a, S, I>(registries: I, id: EntityId)
where
    S: MapSurface + 'a,
    I: IntoIterator<Item = &'a mut OverlayRegistry<S>>,
{
    for registry in registries {
        if registry.contains(id) {
            registry.click(id);
        } else {
            registry.unpin();
        }
    }
}

/// Route the pointer to a group of registries that together form one map.
///
/// `target` is the single marker under the pointer, or `None`. Only the
/// registry owning the target keeps a hover popup open; every other hover
/// popup closes.
pub fn hover_exclusive<'a, S, I>(registries: I, target: Option<EntityId>)
where
    S: MapSurface + 'a,
    I: IntoIterator<Item = &'a mut OverlayRegistry<S>>,
{
    for registry in registries {
        match target.filter(|id| registry.contains(*id)) {
            Some(id) => {
                if registry.hovered() != Some(id) {
                    if let Some(old) = registry.hovered() {
                        registry.pointer_leave(old);
                    }
                    registry.pointer_enter(id);
                }
            }
            None => {
                if let Some(old) = registry.hovered() {
                    registry.pointer_leave(old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Coordinates, EntityDetails, EntityKind};
    use chrono::Utc;

    /// Surface that records operations and tracks live handle count.
    #[derive(Debug, Default)]
    struct RecordingSurface {
        next_handle: u32,
        live: Vec<u32>,
        placed: usize,
        restyled: usize,
        removed: usize,
    }

    impl MapSurface for RecordingSurface {
        type Handle = u32;

        fn place(&mut self, _entity: &Entity) -> u32 {
            self.next_handle += 1;
            self.live.push(self.next_handle);
            self.placed += 1;
            self.next_handle
        }

        fn restyle(&mut self, _handle: &mut u32, _entity: &Entity) {
            self.restyled += 1;
        }

        fn remove(&mut self, handle: u32) {
            self.live.retain(|h| *h != handle);
            self.removed += 1;
        }
    }

    fn station(id: i64, lat: f64, lon: f64) -> Entity {
        Entity {
            id: EntityId::new(EntityKind::Station, id),
            coordinates: Some(Coordinates::new(lat, lon)),
            details: EntityDetails::Station {
                name: format!("Station {id}"),
                temp_avg_f: Some(55.0),
                precipitation_in: None,
                wind_speed_mph: None,
                humidity: None,
            },
            updated_at: Utc::now(),
        }
    }

    fn sid(id: i64) -> EntityId {
        EntityId::new(EntityKind::Station, id)
    }

    fn pinpoint(id: i64, lat: f64, lon: f64) -> Entity {
        Entity {
            id: EntityId::new(EntityKind::Pinpoint, id),
            coordinates: Some(Coordinates::new(lat, lon)),
            details: EntityDetails::Pinpoint {
                label: format!("point {id}"),
            },
            updated_at: Utc::now(),
        }
    }

    fn pid(id: i64) -> EntityId {
        EntityId::new(EntityKind::Pinpoint, id)
    }

    /// One registry per data category, as the app composes them.
    fn two_layer_map(
        surface: &mut RecordingSurface,
    ) -> (OverlayRegistry<RecordingSurface>, OverlayRegistry<RecordingSurface>) {
        let mut weather = OverlayRegistry::new();
        weather.apply(
            &Snapshot::new(Category::Weather, vec![station(1, 42.36, -71.06)]),
            surface,
        );
        let mut traffic = OverlayRegistry::new();
        traffic.apply(
            &Snapshot::new(Category::Traffic, vec![pinpoint(7, 42.37, -71.05)]),
            surface,
        );
        (weather, traffic)
    }

    #[test]
    fn test_apply_then_apply_matches_second_snapshot_exactly() {
        let mut surface = RecordingSurface::default();
        let mut registry = OverlayRegistry::new();

        let a = Snapshot::new(
            Category::Weather,
            vec![station(1, 42.36, -71.06), station(2, 42.37, -71.05)],
        );
        let stats = registry.apply(&a, &mut surface);
        assert_eq!((stats.created, registry.len()), (2, 2));

        let b = Snapshot::new(
            Category::Weather,
            vec![station(2, 42.37, -71.05), station(3, 42.38, -71.04)],
        );
        let stats = registry.apply(&b, &mut surface);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.removed, 1);

        assert!(!registry.contains(sid(1)));
        assert!(registry.contains(sid(2)));
        assert!(registry.contains(sid(3)));
        assert_eq!(surface.live.len(), 2);
    }

    #[test]
    fn test_idempotent_apply_keeps_handles() {
        let mut surface = RecordingSurface::default();
        let mut registry = OverlayRegistry::new();
        let snap = Snapshot::new(Category::Weather, vec![station(1, 42.36, -71.06)]);

        registry.apply(&snap, &mut surface);
        let handle_before = registry.get(sid(1)).unwrap().handle;

        let stats = registry.apply(&snap, &mut surface);
        assert_eq!(stats.created, 0);
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.updated, 1);
        // Updated in place: same handle, no destroy/recreate.
        assert_eq!(registry.get(sid(1)).unwrap().handle, handle_before);
        assert_eq!(surface.placed, 1);
        assert_eq!(surface.removed, 0);
    }

    #[test]
    fn test_update_refreshes_stored_entity() {
        let mut surface = RecordingSurface::default();
        let mut registry = OverlayRegistry::new();

        registry.apply(
            &Snapshot::new(Category::Weather, vec![station(1, 42.36, -71.06)]),
            &mut surface,
        );
        registry.apply(
            &Snapshot::new(Category::Weather, vec![station(1, 42.40, -71.10)]),
            &mut surface,
        );

        let coords = registry.get(sid(1)).unwrap().entity.coordinates.unwrap();
        assert_eq!(coords, Coordinates::new(42.40, -71.10));
        assert_eq!(surface.restyled, 1);
    }

    #[test]
    fn test_hover_closes_on_leave_while_pinned_open() {
        let mut surface = RecordingSurface::default();
        let mut registry = OverlayRegistry::new();
        registry.apply(
            &Snapshot::new(
                Category::Weather,
                vec![station(1, 42.36, -71.06), station(2, 42.37, -71.05)],
            ),
            &mut surface,
        );

        registry.click(sid(1));
        registry.pointer_enter(sid(2));
        assert_eq!(registry.pinned(), Some(sid(1)));
        assert_eq!(registry.hovered(), Some(sid(2)));

        registry.pointer_leave(sid(2));
        assert_eq!(registry.hovered(), None);
        // Pinned popup unaffected by hover lifecycle.
        assert_eq!(registry.pinned(), Some(sid(1)));
    }

    #[test]
    fn test_single_global_pinned_popup() {
        let mut surface = RecordingSurface::default();
        let mut registry = OverlayRegistry::new();
        registry.apply(
            &Snapshot::new(
                Category::Weather,
                vec![station(1, 42.36, -71.06), station(2, 42.37, -71.05)],
            ),
            &mut surface,
        );

        registry.click(sid(1));
        registry.click(sid(2));
        assert_eq!(registry.pinned(), Some(sid(2)));

        // Clicking the pinned marker again toggles it off.
        registry.click(sid(2));
        assert_eq!(registry.pinned(), None);
    }

    #[test]
    fn test_removal_closes_owned_popups() {
        let mut surface = RecordingSurface::default();
        let mut registry = OverlayRegistry::new();
        registry.apply(
            &Snapshot::new(Category::Weather, vec![station(1, 42.36, -71.06)]),
            &mut surface,
        );

        registry.click(sid(1));
        registry.pointer_enter(sid(1));

        registry.apply(&Snapshot::new(Category::Weather, vec![]), &mut surface);
        assert_eq!(registry.pinned(), None);
        assert_eq!(registry.hovered(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_popups_ignore_unknown_ids() {
        let mut registry: OverlayRegistry<RecordingSurface> = OverlayRegistry::new();
        registry.pointer_enter(sid(9));
        registry.click(sid(9));
        assert_eq!(registry.hovered(), None);
        assert_eq!(registry.pinned(), None);
    }

    #[test]
    fn test_click_exclusive_pins_one_across_registries() {
        let mut surface = RecordingSurface::default();
        let (mut weather, mut traffic) = two_layer_map(&mut surface);

        click_exclusive([&mut weather, &mut traffic], sid(1));
        click_exclusive([&mut weather, &mut traffic], pid(7));

        // Pinning in one registry closed the pin held by the other.
        assert_eq!(weather.pinned(), None);
        assert_eq!(traffic.pinned(), Some(pid(7)));
        let open = [weather.pinned(), traffic.pinned()]
            .iter()
            .filter(|p| p.is_some())
            .count();
        assert_eq!(open, 1);
    }

    #[test]
    fn test_click_exclusive_keeps_toggle_off() {
        let mut surface = RecordingSurface::default();
        let (mut weather, mut traffic) = two_layer_map(&mut surface);

        click_exclusive([&mut weather, &mut traffic], sid(1));
        click_exclusive([&mut weather, &mut traffic], sid(1));

        assert_eq!(weather.pinned(), None);
        assert_eq!(traffic.pinned(), None);
    }

    #[test]
    fn test_hover_exclusive_single_winner_across_registries() {
        let mut surface = RecordingSurface::default();
        let (mut weather, mut traffic) = two_layer_map(&mut surface);

        hover_exclusive([&mut weather, &mut traffic], Some(sid(1)));
        hover_exclusive([&mut weather, &mut traffic], Some(pid(7)));
        assert_eq!(weather.hovered(), None);
        assert_eq!(traffic.hovered(), Some(pid(7)));

        hover_exclusive([&mut weather, &mut traffic], None);
        assert_eq!(traffic.hovered(), None);
    }

    #[test]
    fn test_clear_disposes_everything() {
        let mut surface = RecordingSurface::default();
        let mut registry = OverlayRegistry::new();
        registry.apply(
            &Snapshot::new(
                Category::Weather,
                vec![station(1, 42.36, -71.06), station(2, 42.37, -71.05)],
            ),
            &mut surface,
        );
        registry.click(sid(1));

        registry.clear(&mut surface);
        assert!(registry.is_empty());
        assert_eq!(registry.pinned(), None);
        assert!(surface.live.is_empty());
    }
}
