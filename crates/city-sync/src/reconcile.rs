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

//! Pure snapshot reconciliation.
//!
//! [`reconcile`] diffs a new [`Snapshot`] against the set of entity ids that
//! currently have overlays and produces the minimal [`SyncPlan`] of
//! create/update/remove operations. It knows nothing about any rendering
//! library, which keeps the diff independently testable; the
//! [`registry`](crate::registry) applies plans to an actual surface.

use crate::model::{Entity, EntityId, Snapshot};
use std::collections::HashSet;

/// Why an entity from a snapshot did not make it into the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Coordinates missing from the record.
    MissingCoordinates,
    /// Coordinates present but non-finite or out of range.
    InvalidCoordinates,
    /// A previous entity in the same snapshot already claimed this id.
    DuplicateId,
}

impl SkipReason {
    pub fn describe(self) -> &'static str {
        match self {
            SkipReason::MissingCoordinates => "missing coordinates",
            SkipReason::InvalidCoordinates => "invalid coordinates",
            SkipReason::DuplicateId => "duplicate id in snapshot",
        }
    }
}

/// A data-quality skip. Reported as a warning by the caller, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntity {
    pub id: EntityId,
    pub reason: SkipReason,
}

/// The minimal set of surface mutations that makes the rendered overlay set
/// match a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Entities with no current overlay.
    pub create: Vec<Entity>,
    /// Entities that already have an overlay; updated in place, never
    /// destroyed and recreated.
    pub update: Vec<Entity>,
    /// Rendered ids absent from the snapshot.
    pub remove: Vec<EntityId>,
    /// Entities dropped for data-quality reasons.
    pub skipped: Vec<SkippedEntity>,
}

impl SyncPlan {
    /// True when applying this plan would not touch the surface.
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

/// Diff `snapshot` against the ids currently rendered.
///
/// Properties:
/// - every valid snapshot entity lands in exactly one of `create`/`update`;
/// - `remove` holds exactly the rendered ids the snapshot no longer contains;
/// - entities without valid coordinates are skipped, and a skipped entity
///   whose id is currently rendered is also scheduled for removal (a record
///   that lost its position comes off the map);
/// - reconciling the same snapshot twice yields a plan with an empty
///   `create` and `remove` the second time.
pub fn reconcile(rendered: &HashSet<EntityId>, snapshot: &Snapshot) -> SyncPlan {
    let mut plan = SyncPlan::default();
    // An id is claimed by its first occurrence even when that occurrence is
    // coordinate-skipped; only accepted ids keep their overlay alive.
    let mut claimed: HashSet<EntityId> = HashSet::with_capacity(snapshot.entities.len());
    let mut accepted: HashSet<EntityId> = HashSet::with_capacity(snapshot.entities.len());

    for entity in &snapshot.entities {
        if !claimed.insert(entity.id) {
            plan.skipped.push(SkippedEntity {
                id: entity.id,
                reason: SkipReason::DuplicateId,
            });
            continue;
        }

        if entity.valid_coordinates().is_none() {
            let reason = if entity.coordinates.is_none() {
                SkipReason::MissingCoordinates
            } else {
                SkipReason::InvalidCoordinates
            };
            plan.skipped.push(SkippedEntity {
                id: entity.id,
                reason,
            });
            continue;
        }

        accepted.insert(entity.id);
        if rendered.contains(&entity.id) {
            plan.update.push(entity.clone());
        } else {
            plan.create.push(entity.clone());
        }
    }

    for id in rendered {
        if !accepted.contains(id) {
            plan.remove.push(*id);
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Coordinates, EntityDetails, EntityKind};
    use chrono::Utc;

    fn pin(id: i64, coords: Option<Coordinates>) -> Entity {
        Entity {
            id: EntityId::new(EntityKind::Intersection, id),
            coordinates: coords,
            details: EntityDetails::Pinpoint {
                label: format!("pin {id}"),
            },
            updated_at: Utc::now(),
        }
    }

    fn snapshot(entities: Vec<Entity>) -> Snapshot {
        Snapshot::new(Category::Traffic, entities)
    }

    fn ids(entities: &[Entity]) -> Vec<i64> {
        entities.iter().map(|e| e.id.id).collect()
    }

    #[test]
    fn test_first_snapshot_creates_everything() {
        let rendered = HashSet::new();
        let snap = snapshot(vec![
            pin(1, Some(Coordinates::new(42.36, -71.06))),
            pin(2, Some(Coordinates::new(42.37, -71.05))),
        ]);

        let plan = reconcile(&rendered, &snap);
        assert_eq!(ids(&plan.create), vec![1, 2]);
        assert!(plan.update.is_empty());
        assert!(plan.remove.is_empty());
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_overlap_updates_in_place() {
        // The scenario from the dashboard's original marker sync: snapshot A
        // renders {1, 2}; snapshot B = {2, 3} must destroy 1, update 2 in
        // place, and create 3.
        let rendered: HashSet<_> = [
            EntityId::new(EntityKind::Intersection, 1),
            EntityId::new(EntityKind::Intersection, 2),
        ]
        .into_iter()
        .collect();

        let snap = snapshot(vec![
            pin(2, Some(Coordinates::new(42.37, -71.05))),
            pin(3, Some(Coordinates::new(42.38, -71.04))),
        ]);

        let plan = reconcile(&rendered, &snap);
        assert_eq!(ids(&plan.create), vec![3]);
        assert_eq!(ids(&plan.update), vec![2]);
        assert_eq!(plan.remove, vec![EntityId::new(EntityKind::Intersection, 1)]);
    }

    #[test]
    fn test_same_snapshot_twice_is_noop() {
        let snap = snapshot(vec![
            pin(1, Some(Coordinates::new(42.36, -71.06))),
            pin(2, Some(Coordinates::new(42.37, -71.05))),
        ]);

        let rendered: HashSet<_> = reconcile(&HashSet::new(), &snap)
            .create
            .iter()
            .map(|e| e.id)
            .collect();

        let second = reconcile(&rendered, &snap);
        assert!(second.create.is_empty());
        assert!(second.remove.is_empty());
        assert_eq!(second.update.len(), 2);
    }

    #[test]
    fn test_missing_coordinates_skipped_not_fatal() {
        let snap = snapshot(vec![
            pin(1, None),
            pin(2, Some(Coordinates::new(42.37, -71.05))),
        ]);

        let plan = reconcile(&HashSet::new(), &snap);
        assert_eq!(ids(&plan.create), vec![2]);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].reason, SkipReason::MissingCoordinates);
    }

    #[test]
    fn test_invalid_coordinates_distinct_from_missing() {
        let snap = snapshot(vec![pin(1, Some(Coordinates::new(f64::NAN, -71.0)))]);
        let plan = reconcile(&HashSet::new(), &snap);
        assert!(plan.create.is_empty());
        assert_eq!(plan.skipped[0].reason, SkipReason::InvalidCoordinates);
    }

    #[test]
    fn test_rendered_entity_losing_coordinates_is_removed() {
        let rendered: HashSet<_> = [EntityId::new(EntityKind::Intersection, 1)]
            .into_iter()
            .collect();
        let snap = snapshot(vec![pin(1, None)]);

        let plan = reconcile(&rendered, &snap);
        assert_eq!(plan.remove, vec![EntityId::new(EntityKind::Intersection, 1)]);
        assert_eq!(plan.skipped.len(), 1);
    }

    #[test]
    fn test_duplicate_id_first_occurrence_wins() {
        let snap = snapshot(vec![
            pin(1, Some(Coordinates::new(42.36, -71.06))),
            pin(1, Some(Coordinates::new(42.40, -71.10))),
        ]);

        let plan = reconcile(&HashSet::new(), &snap);
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].coordinates, Some(Coordinates::new(42.36, -71.06)));
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].reason, SkipReason::DuplicateId);
    }

    #[test]
    fn test_duplicate_of_coordinate_skipped_id_stays_skipped() {
        // The first occurrence claims the id even when it is itself skipped
        // for coordinates, so a later duplicate never becomes primary.
        let snap = snapshot(vec![
            pin(1, None),
            pin(1, Some(Coordinates::new(42.36, -71.06))),
        ]);

        let plan = reconcile(&HashSet::new(), &snap);
        assert!(plan.create.is_empty());
        assert_eq!(plan.skipped.len(), 2);
        assert_eq!(plan.skipped[0].reason, SkipReason::MissingCoordinates);
        assert_eq!(plan.skipped[1].reason, SkipReason::DuplicateId);
    }

    #[test]
    fn test_empty_snapshot_removes_all() {
        let rendered: HashSet<_> = [
            EntityId::new(EntityKind::Intersection, 1),
            EntityId::new(EntityKind::Intersection, 2),
        ]
        .into_iter()
        .collect();

        let plan = reconcile(&rendered, &snapshot(vec![]));
        assert_eq!(plan.remove.len(), 2);
        assert!(plan.is_noop() == false);
    }
}
