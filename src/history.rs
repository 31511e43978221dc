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

//! Checkpoint ring and undo log, used to roll a world back to an earlier
//! tick and resimulate forward.
//!
//! A [`Checkpoint`] is a full copy of everything [`World::restore_snapshot`]
//! can apply: component columns, the entity index, the entity registry, the
//! relation registry, and a flat `entity -> comp vec` map. It deliberately
//! does not capture the archetype graph's internal node/edge structure —
//! nodes carry `Rc<RefCell<dyn NodeListener>>` subscriptions that can't be
//! cloned, and the graph can always be rebuilt from the flat map through the
//! normal `find_or_create_node`/`set_entity_node` path.
//!
//! The undo log complements the checkpoint ring for rollback to a tick
//! between two checkpoints: every tick's [`UndoOp`]s (recorded by [`World`]
//! only while [`crate::world::WorldConfig::history_enabled`] is set) are kept
//! until the next checkpoint renders them unnecessary.

use std::collections::VecDeque;

#[cfg(feature = "profiling")]
use tracing::info_span;
use rustc_hash::FxHashMap;

use crate::entity::{EntityId, EntityRegistry};
use crate::error::{EcsError, Result};
use crate::relation::RelationRegistry;
use crate::store::{AnyColumn, EntityIndex};
use crate::vecset::CompVec;
use crate::world::{UndoOp, World};

/// A full copy of world state at one tick boundary.
pub struct Checkpoint {
    tick: u32,
    columns: FxHashMap<u32, Box<dyn AnyColumn>>,
    index: EntityIndex,
    entities: EntityRegistry,
    relations: RelationRegistry,
    entity_vecs: FxHashMap<EntityId, CompVec>,
}

impl Checkpoint {
    fn capture(world: &World) -> Self {
        #[cfg(feature = "profiling")]
        let _span = info_span!("history.checkpoint_capture", tick = world.tick()).entered();

        let entity_vecs = world
            .graph()
            .all_entities()
            .filter_map(|e| world.graph().vec_of(e).map(|v| (e, v.clone())))
            .collect();
        Self {
            tick: world.tick(),
            columns: world.store().snapshot(),
            index: world.entity_index().clone(),
            entities: world.entity_registry().clone(),
            relations: world.relations().clone(),
            entity_vecs,
        }
    }

    /// Deep-clone, so a checkpoint can be applied without being removed from
    /// the ring (rolling back does not forbid rolling back again to the same
    /// point later, until a newer checkpoint supersedes it).
    fn duplicate(&self) -> Self {
        Self {
            tick: self.tick,
            columns: self.columns.iter().map(|(id, col)| (*id, col.clone_column())).collect(),
            index: self.index.clone(),
            entities: self.entities.clone(),
            relations: self.relations.clone(),
            entity_vecs: self.entity_vecs.clone(),
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }
}

/// Checkpoint ring plus per-tick undo log, owned by the caller (typically
/// inserted as a [`World::insert_resource`] value or held alongside the
/// world) and driven once per tick via [`Self::record_tick`].
pub struct HistoryBuffer {
    checkpoints: VecDeque<Checkpoint>,
    undo_log: VecDeque<(u32, Vec<UndoOp>)>,
    max_checkpoints: usize,
    checkpoint_interval: u32,
}

impl HistoryBuffer {
    pub fn new(max_checkpoints: usize, checkpoint_interval: u32) -> Self {
        Self {
            checkpoints: VecDeque::new(),
            undo_log: VecDeque::new(),
            max_checkpoints: max_checkpoints.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// Drains this tick's undo ops from `world` and files them, capturing a
    /// fresh checkpoint if this tick lands on a checkpoint boundary. Call
    /// after a tick's mutations have settled (after `flush_deletions` and
    /// `commit`).
    pub fn record_tick(&mut self, world: &mut World) {
        #[cfg(feature = "profiling")]
        let _span = info_span!("history.record_tick", tick = world.tick()).entered();

        let tick = world.tick();
        let ops = world.take_undo_ops();
        self.undo_log.push_back((tick, ops));

        if tick % self.checkpoint_interval == 0 {
            self.checkpoints.push_back(Checkpoint::capture(world));
            while self.checkpoints.len() > self.max_checkpoints {
                self.checkpoints.pop_front();
            }
        }
    }

    /// Reverse every undo entry from `log` (newest first) whose tick is
    /// `>= target_tick`, applying each op's inverse to `world`.
    fn apply_undo_log(world: &mut World, log: &[(u32, Vec<UndoOp>)], target_tick: u32) {
        for (tick, ops) in log.iter().rev() {
            if *tick < target_tick {
                break;
            }
            for op in ops.iter().rev() {
                match op.clone() {
                    UndoOp::Spawn { entity } => {
                        world.despawn(entity);
                    }
                    UndoOp::Despawn { entity, components, .. } => {
                        // Relation edges the entity held are not restored here
                        // (the registered-component path only); a rollback
                        // spanning a despawned-with-relations entity should
                        // land on a checkpoint tick, which does restore them.
                        world.respawn_raw(entity);
                        for (component, payload) in components {
                            world.set_raw_component(entity, component, payload);
                        }
                    }
                    UndoOp::AddComponent { entity, component } => {
                        world.remove_component_raw(entity, component);
                    }
                    UndoOp::RemoveComponent { entity, component, payload } => {
                        world.set_raw_component(entity, component, payload);
                    }
                }
            }
        }
    }

    /// Roll back to the newest checkpoint at or before `tick`, then replay
    /// the undo log down to (but not past) that checkpoint's own tick.
    /// Forward resimulation past `tick` is the caller's responsibility
    /// (re-running ticks through the normal schedule).
    ///
    /// Errs with [`EcsError::RollbackUnreachable`] if no checkpoint at or
    /// before `tick` exists; the caller then has to request a fresh snapshot
    /// from the authority rather than roll back locally.
    pub fn rollback(&mut self, world: &mut World, tick: u32) -> Result<()> {
        #[cfg(feature = "profiling")]
        let _span = info_span!("history.rollback", target_tick = tick).entered();

        let idx = self
            .checkpoints
            .iter()
            .rposition(|c| c.tick() <= tick)
            .ok_or(EcsError::RollbackUnreachable(tick))?;
        let checkpoint = self.checkpoints[idx].duplicate();

        world.restore_snapshot(
            checkpoint.tick,
            checkpoint.columns,
            checkpoint.index,
            checkpoint.entities,
            checkpoint.relations,
            &checkpoint.entity_vecs,
        );

        let replay: Vec<(u32, Vec<UndoOp>)> = self
            .undo_log
            .iter()
            .filter(|(t, _)| *t > checkpoint.tick && *t <= tick)
            .cloned()
            .collect();
        // Already at the checkpoint's own state; nothing in `replay` needs
        // reversing when rolling back exactly onto a checkpoint tick.
        if tick > checkpoint.tick {
            Self::apply_undo_log(world, &replay, checkpoint.tick + 1);
        }

        self.checkpoints.truncate(idx + 1);
        self.undo_log.retain(|(t, _)| *t <= checkpoint.tick);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldConfig;

    #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    fn history_world() -> World {
        World::new(WorldConfig {
            history_enabled: true,
            checkpoint_interval: 1,
            ..WorldConfig::default()
        })
    }

    #[test]
    fn checkpoint_every_tick_rolls_back_a_spawn() {
        let mut w = history_world();
        let mut history = HistoryBuffer::new(8, 1);

        let e = w.spawn(Position { x: 0.0, y: 0.0 });
        w.flush_deletions();
        w.commit();
        history.record_tick(&mut w); // tick 0: checkpoint captures the spawn
        w.advance_tick();

        w.add_component(e, Position { x: 10.0, y: 0.0 });
        w.flush_deletions();
        w.commit();
        history.record_tick(&mut w); // tick 1
        w.advance_tick();

        assert_eq!(w.tick(), 2);
        assert_eq!(w.get_component::<Position>(e), Some(&Position { x: 10.0, y: 0.0 }));

        history.rollback(&mut w, 0).unwrap();
        assert_eq!(w.tick(), 0);
        assert_eq!(w.get_component::<Position>(e), Some(&Position { x: 0.0, y: 0.0 }));
    }

    #[test]
    fn rollback_before_every_retained_checkpoint_errs() {
        let mut w = history_world();
        let mut history = HistoryBuffer::new(2, 1); // only the 2 newest checkpoints survive
        for _ in 0..5 {
            history.record_tick(&mut w);
            w.advance_tick();
        }
        // Early checkpoints have been evicted; tick 0 is no longer reachable.
        assert!(history.rollback(&mut w, 0).is_err());
        assert!(history.rollback(&mut w, w.tick() - 1).is_ok());
    }
}
