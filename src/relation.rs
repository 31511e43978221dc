// Copyright 2024 Saptak Santra
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

//! Relation registry: (relation, object) → virtual component id.
//!
//! A relationship — "entity S has relation R to object O" — is encoded in
//! the archetype graph as two extra ids on S's comp vec: the bare relation id
//! `R` (so `Has(R)` matches any object) and a *virtual* id unique to the pair
//! `(R, O)` (so archetype buckets distinguish `ChildOf(P1)` from
//! `ChildOf(P2)`). This module only tracks the mapping; it does not itself
//! touch the archetype graph — callers (the world) are responsible for
//! replaying `relationAdded`/`relationRemoved` on the object's current node.

use rustc_hash::FxHashMap;

use crate::component::VIRTUAL_ID_BASE;
use crate::entity::EntityId;

/// One edge: subject `S` has relation `rel_id` pointing at the owning object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    pub entity: EntityId,
    pub rel_id: u32,
}

#[derive(Clone, Default)]
pub struct RelationRegistry {
    next_virtual: u32,
    rel_to_virtual: FxHashMap<(u32, EntityId), u32>,
    virtual_to_rel: FxHashMap<u32, (u32, EntityId)>,
    object_to_subjects: FxHashMap<EntityId, Vec<Subject>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::with_base(VIRTUAL_ID_BASE)
    }

    /// Like [`Self::new`], but starting the virtual id counter at `base`
    /// instead of the compiled-in default (configurable via
    /// [`crate::world::WorldConfig::virtual_id_base`]).
    pub fn with_base(base: u32) -> Self {
        Self {
            next_virtual: base,
            ..Default::default()
        }
    }

    /// Look up (or mint) the virtual component id representing `(rel_id, object)`.
    pub fn get_or_create_virtual_id(&mut self, rel_id: u32, object: EntityId) -> u32 {
        if let Some(&vid) = self.rel_to_virtual.get(&(rel_id, object)) {
            return vid;
        }
        let vid = self.next_virtual;
        self.next_virtual += 1;
        self.rel_to_virtual.insert((rel_id, object), vid);
        self.virtual_to_rel.insert(vid, (rel_id, object));
        vid
    }

    pub fn lookup_virtual_id(&self, rel_id: u32, object: EntityId) -> Option<u32> {
        self.rel_to_virtual.get(&(rel_id, object)).copied()
    }

    pub fn resolve_virtual_id(&self, vid: u32) -> Option<(u32, EntityId)> {
        self.virtual_to_rel.get(&vid).copied()
    }

    /// Record that `subject` now has `rel_id` pointing at `object`.
    ///
    /// Returns `true` if this is a new edge (the caller should fan out
    /// `relationAdded` to `object`'s current archetype node).
    pub fn register_incoming(&mut self, subject: EntityId, rel_id: u32, object: EntityId) -> bool {
        let subjects = self.object_to_subjects.entry(object).or_default();
        if subjects.iter().any(|s| s.entity == subject && s.rel_id == rel_id) {
            return false;
        }
        subjects.push(Subject { entity: subject, rel_id });
        true
    }

    /// Reverse of [`Self::register_incoming`]. Returns `true` if an edge was removed.
    pub fn unregister_incoming(&mut self, subject: EntityId, rel_id: u32, object: EntityId) -> bool {
        let Some(subjects) = self.object_to_subjects.get_mut(&object) else {
            return false;
        };
        let before = subjects.len();
        subjects.retain(|s| !(s.entity == subject && s.rel_id == rel_id));
        let removed = subjects.len() != before;
        if subjects.is_empty() {
            self.object_to_subjects.remove(&object);
        }
        removed
    }

    /// All `(subject, rel_id)` pairs incoming to `object`.
    pub fn subjects_of(&self, object: EntityId) -> &[Subject] {
        self.object_to_subjects
            .get(&object)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Re-key every edge mentioning `old` (as subject or object) to `new`
    /// (causal-key promotion: a predicted entity is confirmed under a
    /// different authoritative id).
    pub fn rename(&mut self, old: EntityId, new: EntityId) {
        if let Some(subjects) = self.object_to_subjects.remove(&old) {
            self.object_to_subjects.insert(new, subjects);
        }
        for subjects in self.object_to_subjects.values_mut() {
            for s in subjects.iter_mut() {
                if s.entity == old {
                    s.entity = new;
                }
            }
        }
        let stale: Vec<(u32, EntityId)> = self
            .rel_to_virtual
            .keys()
            .filter(|(_, obj)| *obj == old)
            .copied()
            .collect();
        for key @ (rel_id, _) in stale {
            if let Some(vid) = self.rel_to_virtual.remove(&key) {
                self.rel_to_virtual.insert((rel_id, new), vid);
                self.virtual_to_rel.insert(vid, (rel_id, new));
            }
        }
    }

    /// Drop every edge where `entity` is the object (used on despawn, before
    /// the entity id can be recycled).
    pub fn clear_object(&mut self, entity: EntityId) -> Vec<Subject> {
        self.object_to_subjects.remove(&entity).unwrap_or_default()
    }

    /// Every `(subject, rel_id, object)` triple currently registered. Used by
    /// history restore to re-emit `relationAdded` against the freshly
    /// rebuilt archetype graph.
    pub fn all_edges(&self) -> impl Iterator<Item = (EntityId, u32, EntityId)> + '_ {
        self.object_to_subjects
            .iter()
            .flat_map(|(&object, subjects)| subjects.iter().map(move |s| (s.entity, s.rel_id, object)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(local: u32) -> EntityId {
        EntityId::pack(0, local)
    }

    #[test]
    fn virtual_id_stable_per_pair() {
        let mut reg = RelationRegistry::new();
        let v1 = reg.get_or_create_virtual_id(1, e(10));
        let v2 = reg.get_or_create_virtual_id(1, e(10));
        let v3 = reg.get_or_create_virtual_id(1, e(11));
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
        assert!(v1 >= VIRTUAL_ID_BASE);
    }

    #[test]
    fn resolve_roundtrips() {
        let mut reg = RelationRegistry::new();
        let vid = reg.get_or_create_virtual_id(7, e(3));
        assert_eq!(reg.resolve_virtual_id(vid), Some((7, e(3))));
    }

    #[test]
    fn incoming_registration_tracks_object_to_subjects() {
        let mut reg = RelationRegistry::new();
        let object = e(100);
        assert!(reg.register_incoming(e(1), 5, object));
        assert!(!reg.register_incoming(e(1), 5, object)); // duplicate
        assert!(reg.register_incoming(e(2), 5, object));
        assert_eq!(reg.subjects_of(object).len(), 2);

        assert!(reg.unregister_incoming(e(1), 5, object));
        assert_eq!(reg.subjects_of(object).len(), 1);
    }

    #[test]
    fn clear_object_removes_all_incoming_edges() {
        let mut reg = RelationRegistry::new();
        let object = e(100);
        reg.register_incoming(e(1), 5, object);
        reg.register_incoming(e(2), 6, object);
        let cleared = reg.clear_object(object);
        assert_eq!(cleared.len(), 2);
        assert!(reg.subjects_of(object).is_empty());
    }
}
