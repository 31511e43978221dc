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

//! Replication transactions: the per-commit batch of ops a world emits for
//! its replicated entities, reduced down to the minimal set that reproduces
//! the same end state.
//!
//! Mutations are applied to local storage immediately (`World::spawn` et al.
//! never defer the actual archetype move or component write); what gets
//! buffered here is only the *record* of what happened, so that at `commit`
//! boundaries a peer can be told the net effect of a tick's mutations without
//! shipping every intermediate write.

use rustc_hash::FxHashMap;

use crate::component::ComponentId;
use crate::entity::EntityId;

/// A relation edge carried alongside a component write: this component slot
/// is a relation instance of `rel_id` pointing at `object`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelPair {
    pub rel_id: u32,
    pub object: EntityId,
}

/// One component value inside a coalesced [`ReplicationOp::Spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnComponent {
    pub component: ComponentId,
    pub rel: Option<RelPair>,
    pub version: u32,
    /// Encoded payload (empty for tags).
    pub payload: Vec<u8>,
}

/// One replicated effect of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOp {
    Spawn {
        entity: EntityId,
        causal_key: u32,
        components: Vec<SpawnComponent>,
    },
    Despawn {
        entity: EntityId,
    },
    Set {
        entity: EntityId,
        component: ComponentId,
        version: u32,
        rel: Option<RelPair>,
        payload: Vec<u8>,
    },
    Remove {
        entity: EntityId,
        component: ComponentId,
    },
}

impl ReplicationOp {
    pub fn entity(&self) -> EntityId {
        match self {
            ReplicationOp::Spawn { entity, .. } => *entity,
            ReplicationOp::Despawn { entity } => *entity,
            ReplicationOp::Set { entity, .. } => *entity,
            ReplicationOp::Remove { entity, .. } => *entity,
        }
    }
}

/// A committed batch of [`ReplicationOp`]s, stamped with the domain and tick
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub domain_id: u16,
    pub seq: u32,
    pub tick: u32,
    pub ops: Vec<ReplicationOp>,
}

/// Reduce a tick's worth of buffered ops down to their net effect.
///
/// Rules, applied per entity:
/// - `Spawn` then `Despawn` in the same commit cancel out entirely.
/// - Any `Despawn` dominates: every other op for that entity is dropped.
/// - `Spawn` absorbs every `Set`/`Remove` that follows it for the same
///   entity, coalescing them into the spawn's component list (a later `Set`
///   overwrites an earlier one; a `Remove` drops the component from the
///   list; nothing in the spec lets you remove a component the entity was
///   never spawned with, so a stray `Remove` with no matching component is
///   simply a no-op here).
/// - Otherwise, per component: last `Set`/`Remove` wins; a `Set` followed by
///   a `Remove` collapses to `Remove`; a `Remove` followed by a `Set`
///   collapses to `Set`.
///
/// `Despawn` ops are ordered before non-`Despawn` ops in the output, and
/// entities otherwise keep the order they first appeared in.
pub fn reduce(pending: Vec<ReplicationOp>) -> Vec<ReplicationOp> {
    let mut order: Vec<EntityId> = Vec::new();
    let mut groups: FxHashMap<EntityId, Vec<ReplicationOp>> = FxHashMap::default();
    for op in pending {
        let entity = op.entity();
        groups.entry(entity).or_insert_with(|| {
            order.push(entity);
            Vec::new()
        });
        groups.get_mut(&entity).unwrap().push(op);
    }

    let mut despawns = Vec::new();
    let mut rest = Vec::new();
    for entity in order {
        let ops = groups.remove(&entity).unwrap();
        for op in reduce_entity(entity, ops) {
            match op {
                ReplicationOp::Despawn { .. } => despawns.push(op),
                other => rest.push(other),
            }
        }
    }
    despawns.extend(rest);
    despawns
}

fn reduce_entity(entity: EntityId, ops: Vec<ReplicationOp>) -> Vec<ReplicationOp> {
    let has_spawn = ops.iter().any(|op| matches!(op, ReplicationOp::Spawn { .. }));
    let has_despawn = ops.iter().any(|op| matches!(op, ReplicationOp::Despawn { .. }));

    if has_spawn && has_despawn {
        return Vec::new();
    }
    if has_despawn {
        return vec![ReplicationOp::Despawn { entity }];
    }
    if has_spawn {
        let (causal_key, mut components) = ops
            .iter()
            .find_map(|op| match op {
                ReplicationOp::Spawn { causal_key, components, .. } => {
                    Some((*causal_key, components.clone()))
                }
                _ => None,
            })
            .expect("has_spawn implies a Spawn op is present");
        for op in &ops {
            match op {
                ReplicationOp::Set { component, version, rel, payload, .. } => {
                    if let Some(existing) = components.iter_mut().find(|c| c.component == *component) {
                        existing.version = *version;
                        existing.rel = *rel;
                        existing.payload = payload.clone();
                    } else {
                        components.push(SpawnComponent {
                            component: *component,
                            rel: *rel,
                            version: *version,
                            payload: payload.clone(),
                        });
                    }
                }
                ReplicationOp::Remove { component, .. } => {
                    components.retain(|c| c.component != *component);
                }
                _ => {}
            }
        }
        return vec![ReplicationOp::Spawn { entity, causal_key, components }];
    }

    let mut touched: Vec<ComponentId> = Vec::new();
    let mut resolved: FxHashMap<ComponentId, ReplicationOp> = FxHashMap::default();
    for op in ops {
        let component = match &op {
            ReplicationOp::Set { component, .. } | ReplicationOp::Remove { component, .. } => *component,
            _ => continue,
        };
        if !resolved.contains_key(&component) {
            touched.push(component);
        }
        resolved.insert(component, op);
    }
    touched
        .into_iter()
        .map(|component| resolved.remove(&component).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(local: u32) -> EntityId {
        EntityId::pack(0, local)
    }
    fn cid(n: u32) -> ComponentId {
        ComponentId(n)
    }

    #[test]
    fn spawn_then_despawn_cancels() {
        let ops = vec![
            ReplicationOp::Spawn { entity: e(1), causal_key: 0, components: vec![] },
            ReplicationOp::Despawn { entity: e(1) },
        ];
        assert!(reduce(ops).is_empty());
    }

    #[test]
    fn despawn_dominates_other_ops() {
        let ops = vec![
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 5, rel: None, payload: vec![1] },
            ReplicationOp::Despawn { entity: e(1) },
        ];
        let reduced = reduce(ops);
        assert_eq!(reduced, vec![ReplicationOp::Despawn { entity: e(1) }]);
    }

    #[test]
    fn spawn_absorbs_subsequent_sets_and_removes() {
        let ops = vec![
            ReplicationOp::Spawn {
                entity: e(1),
                causal_key: 7,
                components: vec![SpawnComponent { component: cid(1), rel: None, version: 1, payload: vec![0] }],
            },
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 2, rel: None, payload: vec![9] },
            ReplicationOp::Set { entity: e(1), component: cid(2), version: 1, rel: None, payload: vec![2] },
            ReplicationOp::Remove { entity: e(1), component: cid(2) },
        ];
        let reduced = reduce(ops);
        assert_eq!(reduced.len(), 1);
        match &reduced[0] {
            ReplicationOp::Spawn { causal_key, components, .. } => {
                assert_eq!(*causal_key, 7);
                assert_eq!(components.len(), 1);
                assert_eq!(components[0].payload, vec![9]);
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[test]
    fn last_set_wins_per_component() {
        let ops = vec![
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 1, rel: None, payload: vec![1] },
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 2, rel: None, payload: vec![2] },
        ];
        let reduced = reduce(ops);
        assert_eq!(reduced.len(), 1);
        assert_eq!(
            reduced[0],
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 2, rel: None, payload: vec![2] }
        );
    }

    #[test]
    fn set_then_remove_collapses_to_remove() {
        let ops = vec![
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 1, rel: None, payload: vec![1] },
            ReplicationOp::Remove { entity: e(1), component: cid(1) },
        ];
        let reduced = reduce(ops);
        assert_eq!(reduced, vec![ReplicationOp::Remove { entity: e(1), component: cid(1) }]);
    }

    #[test]
    fn remove_then_set_collapses_to_set() {
        let ops = vec![
            ReplicationOp::Remove { entity: e(1), component: cid(1) },
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 3, rel: None, payload: vec![9] },
        ];
        let reduced = reduce(ops);
        assert_eq!(
            reduced,
            vec![ReplicationOp::Set { entity: e(1), component: cid(1), version: 3, rel: None, payload: vec![9] }]
        );
    }

    #[test]
    fn despawns_sort_before_other_entities_ops() {
        let ops = vec![
            ReplicationOp::Set { entity: e(1), component: cid(1), version: 1, rel: None, payload: vec![] },
            ReplicationOp::Despawn { entity: e(2) },
        ];
        let reduced = reduce(ops);
        assert_eq!(reduced[0], ReplicationOp::Despawn { entity: e(2) });
    }
}
