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

//! The world: entity lifecycle, component mutation, and relation edges,
//! wired together from the registries and storage in the rest of the crate.
//!
//! Mutations apply to storage and the archetype graph immediately. What is
//! buffered is only the *record* of what happened — `pendingOps` for
//! replication, `pendingDeletions` for entity teardown, `pendingRemovals`
//! for deferred component-value clearing — finalized by [`World::commit`]
//! and [`World::flush_deletions`].

use rustc_hash::{FxHashMap, FxHashSet};
#[cfg(feature = "profiling")]
use tracing::{debug, info_span};

use crate::archetype::{ArchetypeGraph, PruneStrategy};
use crate::component::{Component, ComponentId, ComponentRegistry};
use crate::entity::{EntityId, EntityRegistry, TRANSIENT_DOMAIN};
use crate::error::Result;
use crate::relation::RelationRegistry;
use crate::store::{AnyColumn, ComponentStore, EntityIndex, TypedColumn};
use crate::transaction::{self, RelPair, ReplicationOp, Transaction};
use crate::vecset::CompVec;

/// One reversible effect of a mutation, recorded only while
/// [`WorldConfig::history_enabled`] is set. A [`crate::history::HistoryBuffer`]
/// collects these per tick via [`World::take_undo_ops`] to support rollback
/// between checkpoints.
#[derive(Debug, Clone)]
pub enum UndoOp {
    /// Reverse by despawning `entity`.
    Spawn { entity: EntityId },
    /// Reverse by reallocating `entity` and restoring its components.
    Despawn {
        entity: EntityId,
        vec: CompVec,
        components: Vec<(ComponentId, Vec<u8>)>,
    },
    /// Reverse by removing `component` from `entity`.
    AddComponent { entity: EntityId, component: ComponentId },
    /// Reverse by re-setting `component` on `entity` from `payload`.
    RemoveComponent { entity: EntityId, component: ComponentId, payload: Vec<u8> },
}

/// Marker tag: entities carrying this component are included in replication
/// transactions (and, eventually, snapshots).
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct Replicated;

/// World-wide tunables, threaded through instead of hardcoded so a peer can
/// run with a non-default domain or a taller/shorter checkpoint ring.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// This world's own domain id, used as the default spawn domain and to
    /// decide whether a spawned entity is "ours" for replication purposes.
    pub domain_id: u16,
    /// `true` for the server / source-of-truth peer. Non-authoritative peers
    /// spawning a replicated entity speculatively land it in
    /// `transient_domain_id` until the authoritative copy arrives.
    pub authoritative: bool,
    /// Whether a [`crate::history::HistoryBuffer`] is attached (gates the
    /// transient-domain speculative-spawn path; see spec §4.6 step 3).
    pub history_enabled: bool,
    pub checkpoint_interval: u32,
    pub max_checkpoints: usize,
    /// First id handed out for relation virtual components.
    pub virtual_id_base: u32,
    /// Domain reserved for client-predicted entities awaiting confirmation.
    pub transient_domain_id: u16,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            domain_id: 0,
            authoritative: true,
            history_enabled: false,
            checkpoint_interval: 30,
            max_checkpoints: 64,
            virtual_id_base: crate::component::VIRTUAL_ID_BASE,
            transient_domain_id: TRANSIENT_DOMAIN,
        }
    }
}

/// `causalKey = intentTick * 2^15 + indexWithinTick`.
#[inline]
fn causal_key(tick: u32, index_within_tick: u32) -> u32 {
    tick.wrapping_mul(1 << 15).wrapping_add(index_within_tick)
}

/// A group of components written to one entity in a single [`World::spawn`]
/// call.
///
/// Implemented for any `Component + Clone + Serialize + DeserializeOwned`
/// type (zero-sized types register as tags automatically; anything else
/// registers as a value component on first use) and for tuples of such types
/// up to eight elements, matching the teacher's bundle-tuple convention.
pub trait Bundle: Send + Sync + 'static {
    /// `true` if this bundle (or any element of it) is the [`Replicated`] tag.
    fn is_replicated() -> bool;
    /// Write every component into storage at `entity`, returning the updated
    /// accumulated comp vec.
    fn write(self, world: &mut World, entity: EntityId, version: u32, vec: CompVec) -> CompVec;
}

impl Bundle for () {
    fn is_replicated() -> bool {
        false
    }
    fn write(self, _world: &mut World, _entity: EntityId, _version: u32, vec: CompVec) -> CompVec {
        vec
    }
}

impl<T> Bundle for T
where
    T: Component + Clone + serde::Serialize + serde::de::DeserializeOwned,
{
    fn is_replicated() -> bool {
        std::any::TypeId::of::<T>() == std::any::TypeId::of::<Replicated>()
    }

    fn write(self, world: &mut World, entity: EntityId, version: u32, vec: CompVec) -> CompVec {
        let id = world.ensure_registered::<T>();
        if std::mem::size_of::<T>() != 0 {
            let row = world.index.get_or_create_index(entity);
            world
                .store
                .get_or_create_column::<T, _>(id, TypedColumn::new)
                .set(row, self, version, false);
        }
        vec.with(id.0)
    }
}

macro_rules! impl_bundle_tuple {
    ($($T:ident),+) => {
        impl<$($T),+> Bundle for ($($T,)+)
        where
            $($T: Bundle,)+
        {
            fn is_replicated() -> bool {
                false $(|| $T::is_replicated())+
            }

            #[allow(non_snake_case)]
            fn write(self, world: &mut World, entity: EntityId, version: u32, vec: CompVec) -> CompVec {
                let ($($T,)+) = self;
                let mut vec = vec;
                $(vec = $T.write(world, entity, version, vec);)+
                vec
            }
        }
    };
}

impl_bundle_tuple!(A);
impl_bundle_tuple!(A, B);
impl_bundle_tuple!(A, B, C);
impl_bundle_tuple!(A, B, C, D);
impl_bundle_tuple!(A, B, C, D, E);
impl_bundle_tuple!(A, B, C, D, E, F);
impl_bundle_tuple!(A, B, C, D, E, F, G);
impl_bundle_tuple!(A, B, C, D, E, F, G, H);

pub struct World {
    config: WorldConfig,
    tick: u32,
    tick_spawn_count: u32,
    next_op_seq: FxHashMap<u16, u32>,
    entities: EntityRegistry,
    components: ComponentRegistry,
    store: ComponentStore,
    index: EntityIndex,
    graph: ArchetypeGraph,
    relations: RelationRegistry,
    /// `causalKey -> transient entity`, consulted by [`World::spawn`] (reuse
    /// on a repeated local spawn with the same key) and by
    /// [`World::promote_entity`] (a remote authoritative spawn confirming a
    /// local prediction).
    transients: FxHashMap<u32, EntityId>,
    replicated_tag: ComponentId,
    resource_tags: FxHashSet<ComponentId>,
    pending_ops: Vec<ReplicationOp>,
    pending_deletions: Vec<EntityId>,
    pending_removals: FxHashMap<EntityId, Vec<ComponentId>>,
    pending_undo: Vec<UndoOp>,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        let mut components = ComponentRegistry::new();
        let replicated_tag = components
            .register_tag::<Replicated>()
            .expect("Replicated registers once, at world construction");
        Self {
            relations: RelationRegistry::with_base(config.virtual_id_base),
            config,
            tick: 0,
            tick_spawn_count: 0,
            next_op_seq: FxHashMap::default(),
            entities: EntityRegistry::new(),
            components,
            store: ComponentStore::new(),
            index: EntityIndex::new(),
            graph: ArchetypeGraph::new(),
            transients: FxHashMap::default(),
            replicated_tag,
            resource_tags: FxHashSet::default(),
            pending_ops: Vec::new(),
            pending_deletions: Vec::new(),
            pending_removals: FxHashMap::default(),
            pending_undo: Vec::new(),
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Advance to the next tick, resetting the per-tick spawn counter used
    /// for causal keys.
    pub fn advance_tick(&mut self) {
        #[cfg(feature = "profiling")]
        let _span = info_span!("world.advance_tick", tick = self.tick).entered();

        self.tick = self
            .tick
            .checked_add(1)
            .unwrap_or_else(|| panic!("world tick overflow at {}", self.tick));
        self.tick_spawn_count = 0;
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.graph.node_of(entity).is_some()
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn components_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.components
    }

    pub fn graph(&self) -> &ArchetypeGraph {
        &self.graph
    }

    /// Mutable access to the archetype graph, for callers (queries, history
    /// restore) that need to create anchor nodes or subscribe listeners.
    pub fn graph_mut(&mut self) -> &mut ArchetypeGraph {
        &mut self.graph
    }

    pub fn store(&self) -> &ComponentStore {
        &self.store
    }

    pub fn entity_index(&self) -> &EntityIndex {
        &self.index
    }

    pub fn entity_registry(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn relations(&self) -> &RelationRegistry {
        &self.relations
    }

    /// Drain this tick's recorded undo ops (empty unless
    /// [`WorldConfig::history_enabled`] is set). A history buffer calls this
    /// once per tick and files the result under that tick's undo entry.
    pub fn take_undo_ops(&mut self) -> Vec<UndoOp> {
        std::mem::take(&mut self.pending_undo)
    }

    /// Wholesale state replacement for a history rollback: replaces the tick
    /// counter, component columns, entity index, entity registry and
    /// relation registry, then rebuilds archetype membership from
    /// `entity_vecs` and re-emits relation edges so node relation maps stay
    /// consistent (no archetype node carries listeners across a restore —
    /// live [`crate::query::QueryState`]/[`crate::query::MonitorState`]
    /// instances must be reconstructed afterward).
    ///
    /// Row 0 (the resource entity) is copied back from the live world after
    /// the restore, since resources are not part of rollback-relevant
    /// simulation state.
    pub fn restore_snapshot(
        &mut self,
        tick: u32,
        columns: FxHashMap<u32, Box<dyn AnyColumn>>,
        index: EntityIndex,
        entities: EntityRegistry,
        relations: RelationRegistry,
        entity_vecs: &FxHashMap<EntityId, CompVec>,
    ) {
        let resource_backup = self.store.snapshot();

        self.tick = tick;
        self.tick_spawn_count = 0;
        self.store.restore(columns);
        self.store.preserve_row(0, &resource_backup);
        self.index = index;
        self.entities = entities;
        self.relations = relations;
        self.graph.reset();
        self.pending_ops.clear();
        self.pending_deletions.clear();
        self.pending_removals.clear();
        self.pending_undo.clear();

        for (&entity, vec) in entity_vecs {
            let row = self.index.get_or_create_index(entity);
            let node = self.graph.find_or_create_node(vec.clone(), PruneStrategy::WhenEmpty);
            self.graph.set_entity_node(entity, node, row);
        }
        for (subject, rel_id, object) in self.relations.all_edges() {
            self.graph.record_relation(subject, rel_id, object);
        }
    }

    pub fn register_tag<T: Component>(&mut self) -> Result<ComponentId> {
        self.components.register_tag::<T>()
    }

    pub fn register_relation<R: Component>(&mut self) -> Result<ComponentId> {
        self.components.register_tag::<R>()
    }

    pub fn register_value<T>(&mut self) -> Result<ComponentId>
    where
        T: Component + Clone + serde::Serialize + serde::de::DeserializeOwned,
    {
        self.components.register_value::<T>()
    }

    pub fn register_fixed<T>(&mut self) -> Result<ComponentId>
    where
        T: Component + Copy + speedy::Writable<speedy::LittleEndian> + for<'a> speedy::Readable<'a, speedy::LittleEndian>,
    {
        self.components.register_fixed::<T>()
    }

    fn ensure_registered<T>(&mut self) -> ComponentId
    where
        T: Component + Clone + serde::Serialize + serde::de::DeserializeOwned,
    {
        if let Some(id) = self.components.id_of::<T>() {
            return id;
        }
        if std::mem::size_of::<T>() == 0 {
            self.components
                .register_tag::<T>()
                .expect("tag registration cannot fail")
        } else {
            self.components
                .register_value::<T>()
                .expect("value registration cannot fail")
        }
    }

    pub fn get_component<T>(&self, entity: EntityId) -> Option<&T>
    where
        T: Component + Clone,
    {
        let id = self.components.id_of::<T>()?;
        let row = self.index.index_of(entity)?;
        self.store.typed::<T>(id)?.get(row as usize)
    }

    pub fn get_component_mut<T>(&mut self, entity: EntityId) -> Option<&mut T>
    where
        T: Component + Clone,
    {
        let id = self.components.id_of::<T>()?;
        let row = self.index.index_of(entity)?;
        self.store.typed_mut::<T>(id)?.get_mut(row as usize)
    }

    pub fn has_component<T: Component>(&self, entity: EntityId) -> bool {
        let Some(id) = self.components.id_of::<T>() else {
            return false;
        };
        self.graph
            .vec_of(entity)
            .map(|v| v.contains(id.0))
            .unwrap_or(false)
    }

    // -- Resources ---------------------------------------------------------

    pub fn insert_resource<T>(&mut self, value: T)
    where
        T: Component + Clone + serde::Serialize + serde::de::DeserializeOwned,
    {
        let id = self.ensure_registered::<T>();
        if std::mem::size_of::<T>() == 0 {
            self.resource_tags.insert(id);
        } else {
            let row = self.index.get_or_create_index(EntityId::RESOURCE);
            self.store
                .get_or_create_column::<T, _>(id, TypedColumn::new)
                .set(row, value, self.tick, false);
        }
    }

    pub fn resource<T>(&self) -> Option<&T>
    where
        T: Component + Clone,
    {
        self.get_component::<T>(EntityId::RESOURCE)
    }

    pub fn resource_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Component + Clone,
    {
        self.get_component_mut::<T>(EntityId::RESOURCE)
    }

    pub fn has_resource<T: Component>(&self) -> bool {
        if let Some(id) = self.components.id_of::<T>() {
            if self.resource_tags.contains(&id) {
                return true;
            }
        }
        self.has_component::<T>(EntityId::RESOURCE)
    }

    // -- Spawn / despawn -----------------------------------------------------

    /// Spawn an entity in this world's own domain.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> EntityId {
        self.spawn_in(self.config.domain_id, bundle)
    }

    /// Spawn an entity with an explicit requested domain (overridden by the
    /// transient-domain redirect described in spec §4.6 step 3 when this
    /// peer is non-authoritative and history is enabled).
    pub fn spawn_in<B: Bundle>(&mut self, requested_domain: u16, bundle: B) -> EntityId {
        #[cfg(feature = "profiling")]
        let _span = info_span!("world.spawn", tick = self.tick).entered();

        let intent_tick = self.tick;
        let is_replicated = B::is_replicated();
        let index_within_tick = if is_replicated {
            let i = self.tick_spawn_count;
            self.tick_spawn_count += 1;
            i
        } else {
            0x7fff
        };
        let key = causal_key(intent_tick, index_within_tick);

        let entity = if let Some(&existing) = self.transients.get(&key) {
            existing
        } else {
            let domain = if !self.config.authoritative && self.config.history_enabled && is_replicated {
                self.config.transient_domain_id
            } else {
                requested_domain
            };
            let entity = self.entities.alloc(domain);
            if is_replicated {
                self.transients.insert(key, entity);
            }
            entity
        };

        let version = self.tick;
        let vec = bundle.write(self, entity, version, CompVec::empty());

        let row = self.index.get_or_create_index(entity);
        let node = self.graph.find_or_create_node(vec.clone(), PruneStrategy::WhenEmpty);
        self.graph.set_entity_node(entity, node, row);

        if self.config.history_enabled {
            self.pending_undo.push(UndoOp::Spawn { entity });
        }

        if entity.domain() == self.config.domain_id && is_replicated {
            let components = self.encode_components(entity, &vec);
            self.pending_ops.push(ReplicationOp::Spawn { entity, causal_key: key, components });
        }

        entity
    }

    /// Despawn `entity`: unwinds its relation edges (both as subject and as
    /// object), marks it for teardown, and moves it off the graph
    /// immediately. The component values themselves are only blanked at
    /// [`Self::flush_deletions`], so in-tick readers (e.g. an Out monitor)
    /// still see the last value.
    pub fn despawn(&mut self, entity: EntityId) {
        if !self.is_alive(entity) {
            return;
        }
        let is_replicated = self
            .graph
            .vec_of(entity)
            .map(|v| v.contains(self.replicated_tag.0))
            .unwrap_or(false);
        if is_replicated {
            self.pending_ops.push(ReplicationOp::Despawn { entity });
        }

        if self.config.history_enabled {
            let vec = self.graph.vec_of(entity).cloned().unwrap_or_else(CompVec::empty);
            let components = self.encode_components(entity, &vec);
            let components = components.into_iter().map(|c| (c.component, c.payload)).collect();
            self.pending_undo.push(UndoOp::Despawn { entity, vec, components });
        }

        // entity as object: every subject pointing at it loses that relation.
        let incoming = self.relations.clear_object(entity);
        for subject in incoming {
            self.remove_relation_raw(subject.entity, subject.rel_id, entity);
        }

        // entity as subject: unregister every outgoing edge it still owns.
        let outgoing = self.graph.relations_of_entity(entity);
        for (rel_id, object) in outgoing {
            self.relations.unregister_incoming(entity, rel_id, object);
        }

        self.pending_deletions.push(entity);
        self.graph.remove_entity(entity);
        self.index.free(entity);
        self.entities.free(entity);
    }

    /// Re-point a local transient (predicted) entity at the authoritative id
    /// carried by a remote `Spawn` op with a matching causal key.
    pub fn promote_entity(&mut self, causal_key: u32, authoritative: EntityId) {
        let Some(predicted) = self.transients.remove(&causal_key) else {
            return;
        };
        if predicted == authoritative {
            return;
        }
        self.entities.promote(predicted, authoritative);
        self.index.rename(predicted, authoritative);
        self.graph.rename_entity(predicted, authoritative);
        self.relations.rename(predicted, authoritative);
        self.transients.insert(causal_key, authoritative);
    }

    // -- Add / remove component ----------------------------------------------

    pub fn add_component<T>(&mut self, entity: EntityId, value: T)
    where
        T: Component + Clone + serde::Serialize + serde::de::DeserializeOwned,
    {
        if !self.is_alive(entity) {
            return;
        }
        let id = self.ensure_registered::<T>();
        let version = self.tick;
        let row = self.index.get_or_create_index(entity);
        if std::mem::size_of::<T>() != 0 {
            self.store
                .get_or_create_column::<T, _>(id, TypedColumn::new)
                .set(row, value, version, false);
        }

        let current = self.graph.vec_of(entity).cloned().unwrap_or_else(CompVec::empty);
        let new_vec = current.with(id.0);
        let is_new_on_entity = new_vec != current;
        if is_new_on_entity {
            let node = self.graph.find_or_create_node(new_vec, PruneStrategy::WhenEmpty);
            self.graph.set_entity_node(entity, node, row);
        }

        if self.config.history_enabled && is_new_on_entity {
            self.pending_undo.push(UndoOp::AddComponent { entity, component: id });
        }

        if self.is_replicated_entity(entity) {
            let payload = self.encode_one(entity, id);
            self.pending_ops.push(ReplicationOp::Set { entity, component: id, version, rel: None, payload });
        }
    }

    /// Removing a non-tag component is deferred: the value is blanked only
    /// at [`Self::flush_deletions`], so readers in the same tick still see
    /// the pre-remove value (spec §4.4/§4.6).
    pub fn remove_component<T: Component>(&mut self, entity: EntityId) {
        let Some(id) = self.components.id_of::<T>() else {
            return;
        };
        self.remove_component_id(entity, id);
    }

    fn remove_component_id(&mut self, entity: EntityId, id: ComponentId) {
        if !self.is_alive(entity) {
            return;
        }
        let current = match self.graph.vec_of(entity) {
            Some(v) if v.contains(id.0) => v.clone(),
            _ => return,
        };
        if self.config.history_enabled {
            let payload = self.encode_one(entity, id);
            self.pending_undo.push(UndoOp::RemoveComponent { entity, component: id, payload });
        }

        let new_vec = current.without(id.0);
        let row = self.index.get_or_create_index(entity);
        let node = self.graph.find_or_create_node(new_vec, PruneStrategy::WhenEmpty);
        self.graph.set_entity_node(entity, node, row);
        self.pending_removals.entry(entity).or_default().push(id);

        if self.is_replicated_entity(entity) {
            self.pending_ops.push(ReplicationOp::Remove { entity, component: id });
        }
    }

    /// Re-register `entity` under its exact previous id after a despawn,
    /// with no components yet. Used only by undo-log replay
    /// ([`crate::history::HistoryBuffer`]) to reverse a [`Self::despawn`];
    /// ordinary code should use [`Self::spawn`].
    pub fn respawn_raw(&mut self, entity: EntityId) {
        self.entities.claim(entity);
        let row = self.index.get_or_create_index(entity);
        let node = self.graph.find_or_create_node(CompVec::empty(), PruneStrategy::WhenEmpty);
        self.graph.set_entity_node(entity, node, row);
    }

    /// Type-erased component write keyed by [`ComponentId`] rather than a
    /// concrete Rust type, decoding `payload` through the id's registered
    /// serde. A no-op if `id` has no resolvable serde (a relation's virtual
    /// id, or a component this peer never registered) — matching the wire
    /// handling of an unknown component (spec §7).
    ///
    /// Bypasses last-writer-wins: the caller (undo replay) is restoring a
    /// value this world itself previously held, so it always wins.
    pub fn set_raw_component(&mut self, entity: EntityId, component: ComponentId, payload: Vec<u8>) {
        let version = self.tick;
        self.set_raw_component_impl(entity, component, payload, version, true);
    }

    /// Type-erased component write obeying last-writer-wins against `version`
    /// instead of forcing — the path an incoming wire `Set`/`Spawn` op uses,
    /// since a remote write can legitimately lose to a newer local one
    /// (spec §7, "stale write").
    pub(crate) fn apply_remote_set(&mut self, entity: EntityId, component: ComponentId, payload: Vec<u8>, version: u32) {
        self.set_raw_component_impl(entity, component, payload, version, false);
    }

    fn set_raw_component_impl(&mut self, entity: EntityId, component: ComponentId, payload: Vec<u8>, version: u32, force: bool) {
        if !self.is_alive(entity) {
            #[cfg(feature = "profiling")]
            debug!(entity = ?entity, component = component.0, "remote set for a dead entity, dropping");
            return;
        }
        let Some(desc) = self.components.resolve(component).cloned() else {
            #[cfg(feature = "profiling")]
            debug!(component = component.0, "remote set for an unregistered component, dropping");
            return;
        };
        let row = self.index.get_or_create_index(entity);
        if !desc.is_tag {
            let Some(serde) = desc.serde.clone() else {
                return;
            };
            let Ok(value) = serde.decode(&payload) else {
                #[cfg(feature = "profiling")]
                debug!(component = component.0, "remote set payload failed to decode, dropping");
                return;
            };
            let col = self.store.ensure_column_raw(component, || serde.new_column());
            let _ = col.set_any(row, value, version, force);
        }

        let current = self.graph.vec_of(entity).cloned().unwrap_or_else(CompVec::empty);
        let new_vec = current.with(component.0);
        if new_vec != current {
            let node = self.graph.find_or_create_node(new_vec, PruneStrategy::WhenEmpty);
            self.graph.set_entity_node(entity, node, row);
        }
    }

    /// Type-erased component removal keyed by [`ComponentId`]. Unlike
    /// [`Self::remove_component`], clears the archetype membership
    /// immediately rather than deferring to [`Self::flush_deletions`] — undo
    /// replay runs between ticks, not mid-tick, so there is no in-tick reader
    /// to preserve a stale value for.
    pub fn remove_component_raw(&mut self, entity: EntityId, component: ComponentId) {
        if !self.is_alive(entity) {
            return;
        }
        let current = match self.graph.vec_of(entity) {
            Some(v) if v.contains(component.0) => v.clone(),
            _ => return,
        };
        let new_vec = current.without(component.0);
        let row = self.index.get_or_create_index(entity);
        let node = self.graph.find_or_create_node(new_vec, PruneStrategy::WhenEmpty);
        self.graph.set_entity_node(entity, node, row);
        self.store.clear_row(component, row as usize);
    }

    // -- Relations -------------------------------------------------------------

    /// Add relation `R` from `entity` (subject) to `object`. `entity`'s comp
    /// vec gains both the bare relation id (`Has(R)` matches any object) and
    /// a virtual id unique to `(R, object)`.
    pub fn add_relation<R: Component>(&mut self, entity: EntityId, object: EntityId) {
        if !self.is_alive(entity) {
            return;
        }
        let rel_id = self.ensure_relation::<R>();
        let vid = self.relations.get_or_create_virtual_id(rel_id.0, object);
        let is_new = self.relations.register_incoming(entity, rel_id.0, object);

        let current = self.graph.vec_of(entity).cloned().unwrap_or_else(CompVec::empty);
        let new_vec = current.with(rel_id.0).with(vid);
        if new_vec != current {
            let row = self.index.get_or_create_index(entity);
            let node = self.graph.find_or_create_node(new_vec, PruneStrategy::WhenEmpty);
            self.graph.set_entity_node(entity, node, row);
        }
        if is_new {
            self.graph.record_relation(entity, rel_id.0, object);
        }

        if self.is_replicated_entity(entity) {
            let version = self.tick;
            self.pending_ops.push(ReplicationOp::Set {
                entity,
                component: ComponentId(vid),
                version,
                rel: Some(RelPair { rel_id: rel_id.0, object }),
                payload: Vec::new(),
            });
        }
    }

    /// Remove relation `R` from `entity` to `object`. Also drops the bare
    /// relation id if no other instance of `R` remains on `entity`.
    pub fn remove_relation<R: Component>(&mut self, entity: EntityId, object: EntityId) {
        let Some(rel_id) = self.components.id_of::<R>() else {
            return;
        };
        self.remove_relation_raw(entity, rel_id.0, object);
    }

    /// Type-erased [`Self::add_relation`], keyed by an already-resolved
    /// `rel_id` rather than a Rust relation type. Used when applying an
    /// incoming wire op, which only ever names components and relations by
    /// numeric id. Manufactures a placeholder descriptor for `rel_id` if this
    /// peer never registered it locally (spec §7, "unknown component on wire").
    pub(crate) fn add_relation_raw(&mut self, entity: EntityId, rel_id: u32, object: EntityId) {
        if !self.is_alive(entity) {
            return;
        }
        if self.components.resolve(ComponentId(rel_id)).is_none() {
            self.components.ensure_placeholder(rel_id);
        }
        let vid = self.relations.get_or_create_virtual_id(rel_id, object);
        let is_new = self.relations.register_incoming(entity, rel_id, object);

        let current = self.graph.vec_of(entity).cloned().unwrap_or_else(CompVec::empty);
        let new_vec = current.with(rel_id).with(vid);
        if new_vec != current {
            let row = self.index.get_or_create_index(entity);
            let node = self.graph.find_or_create_node(new_vec, PruneStrategy::WhenEmpty);
            self.graph.set_entity_node(entity, node, row);
        }
        if is_new {
            self.graph.record_relation(entity, rel_id, object);
        }
    }

    pub(crate) fn remove_relation_raw(&mut self, entity: EntityId, rel_id: u32, object: EntityId) {
        if !self.is_alive(entity) {
            return;
        }
        self.relations.unregister_incoming(entity, rel_id, object);
        self.graph.forget_relation(entity, rel_id, object);

        let Some(vid) = self.relations.lookup_virtual_id(rel_id, object) else {
            return;
        };
        let current = match self.graph.vec_of(entity) {
            Some(v) => v.clone(),
            None => return,
        };
        let remaining_same_rel = self.graph.relations_of_entity(entity).iter().any(|&(r, _)| r == rel_id);
        let mut new_vec = current.without(vid);
        if !remaining_same_rel {
            new_vec = new_vec.without(rel_id);
        }
        if new_vec != current {
            let row = self.index.get_or_create_index(entity);
            let node = self.graph.find_or_create_node(new_vec, PruneStrategy::WhenEmpty);
            self.graph.set_entity_node(entity, node, row);
        }

        if self.is_replicated_entity(entity) {
            self.pending_ops.push(ReplicationOp::Remove { entity, component: ComponentId(vid) });
        }
    }

    fn ensure_relation<R: Component>(&mut self) -> ComponentId {
        if let Some(id) = self.components.id_of::<R>() {
            return id;
        }
        self.components.register_tag::<R>().expect("relation id registration cannot fail")
    }

    fn is_replicated_entity(&self, entity: EntityId) -> bool {
        self.graph
            .vec_of(entity)
            .map(|v| v.contains(self.replicated_tag.0))
            .unwrap_or(false)
    }

    // -- Flush / commit --------------------------------------------------------

    /// Blank the value of every component queued by [`Self::remove_component`]
    /// and release every entity queued by [`Self::despawn`]. Readers that
    /// looked up a removed/deleted value earlier in the tick already got
    /// their answer; after this call the slot reads as absent.
    pub fn flush_deletions(&mut self) {
        #[cfg(feature = "profiling")]
        let _span = info_span!("world.flush_deletions", tick = self.tick).entered();

        for (entity, ids) in self.pending_removals.drain() {
            if let Some(row) = self.index.index_of(entity) {
                for id in ids {
                    self.store.clear_row(id, row as usize);
                }
            }
        }
        self.pending_deletions.clear();
    }

    /// Reduce buffered replication ops into a [`Transaction`] for this tick
    /// and clear the buffer. Returns `None` if nothing replicated this tick.
    pub fn commit(&mut self) -> Option<Transaction> {
        #[cfg(feature = "profiling")]
        let _span = info_span!("world.commit", tick = self.tick).entered();

        if self.pending_ops.is_empty() {
            return None;
        }
        let ops = transaction::reduce(std::mem::take(&mut self.pending_ops));
        if ops.is_empty() {
            return None;
        }
        let seq_slot = self.next_op_seq.entry(self.config.domain_id).or_insert(0);
        let seq = *seq_slot;
        *seq_slot += 1;
        Some(Transaction { domain_id: self.config.domain_id, seq, tick: self.tick, ops })
    }

    fn encode_one(&self, entity: EntityId, id: ComponentId) -> Vec<u8> {
        let Some(desc) = self.components.resolve(id) else {
            return Vec::new();
        };
        if desc.is_tag {
            return Vec::new();
        }
        let Some(row) = self.index.index_of(entity) else {
            return Vec::new();
        };
        let Some(col) = self.store.column(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let descriptor_serde = match &desc.serde {
            Some(s) => s.as_ref(),
            None => return Vec::new(),
        };
        let _ = col.encode_row(row as usize, descriptor_serde, &mut out);
        out
    }

    fn encode_components(&self, entity: EntityId, vec: &CompVec) -> Vec<crate::transaction::SpawnComponent> {
        let version = self.tick;
        vec.ids()
            .iter()
            .map(|&raw| {
                let id = ComponentId(raw);
                let rel = if id.is_virtual() {
                    self.relations.resolve_virtual_id(raw).map(|(rel_id, object)| RelPair { rel_id, object })
                } else {
                    None
                };
                crate::transaction::SpawnComponent { component: id, rel, version, payload: self.encode_one(entity, id) }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct Attacking;
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct ChildOf;

    fn new_world() -> World {
        World::new(WorldConfig::default())
    }

    #[test]
    fn spawn_despawn_roundtrip() {
        let mut w = new_world();
        let e = w.spawn(Position { x: 1.0, y: 2.0 });
        assert!(w.is_alive(e));
        assert_eq!(w.get_component::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));
        w.despawn(e);
        assert!(!w.is_alive(e));
    }

    #[test]
    fn bundle_tuple_registers_tag_and_value_together() {
        let mut w = new_world();
        w.register_tag::<Attacking>().unwrap();
        let id = w.components().id_of::<Attacking>().unwrap();
        let e = w.spawn((Position { x: 0.0, y: 0.0 }, Attacking));
        assert!(w.graph().vec_of(e).unwrap().contains(id.0));
    }

    #[test]
    fn add_and_remove_component_moves_archetype() {
        let mut w = new_world();
        let e = w.spawn(());
        let root = w.graph().node_of(e).unwrap();
        w.add_component(e, Position { x: 1.0, y: 1.0 });
        assert_ne!(w.graph().node_of(e).unwrap(), root);
        assert!(w.has_component::<Position>(e));

        w.remove_component::<Position>(e);
        // value still visible until flush
        assert_eq!(w.get_component::<Position>(e), Some(&Position { x: 1.0, y: 1.0 }));
        w.flush_deletions();
        assert_eq!(w.get_component::<Position>(e), None);
    }

    #[test]
    fn relation_add_remove_updates_graph() {
        let mut w = new_world();
        w.register_relation::<ChildOf>().unwrap();
        let parent = w.spawn(());
        let child = w.spawn(());
        w.add_relation::<ChildOf>(child, parent);

        let rel_id = w.components().id_of::<ChildOf>().unwrap();
        assert!(w.graph().vec_of(child).unwrap().contains(rel_id.0));
        let node_id = w.graph().node_of(child).unwrap();
        let objects = w.graph().node(node_id).objects_of(child, rel_id.0);
        assert_eq!(objects, &[parent]);

        w.remove_relation::<ChildOf>(child, parent);
        assert!(!w.graph().vec_of(child).unwrap().contains(rel_id.0));
    }

    #[test]
    fn despawning_object_clears_subject_relation() {
        let mut w = new_world();
        w.register_relation::<ChildOf>().unwrap();
        let parent = w.spawn(());
        let child = w.spawn(());
        w.add_relation::<ChildOf>(child, parent);

        w.despawn(parent);
        let rel_id = w.components().id_of::<ChildOf>().unwrap();
        assert!(!w.graph().vec_of(child).unwrap().contains(rel_id.0));
    }

    #[test]
    fn replicated_spawn_produces_transaction() {
        let mut w = new_world();
        let e = w.spawn((Position { x: 1.0, y: 0.0 }, Replicated));
        assert!(w.is_alive(e));
        let tx = w.commit().expect("replicated spawn commits a transaction");
        assert_eq!(tx.ops.len(), 1);
        match &tx.ops[0] {
            ReplicationOp::Spawn { entity, components, .. } => {
                assert_eq!(*entity, e);
                assert!(components.iter().any(|c| !c.payload.is_empty()));
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[test]
    fn non_replicated_spawn_produces_no_transaction() {
        let mut w = new_world();
        w.spawn(Position { x: 0.0, y: 0.0 });
        assert!(w.commit().is_none());
    }

    #[test]
    fn causal_key_promotion_rewrites_entity_id() {
        let mut client = World::new(WorldConfig {
            domain_id: 1,
            authoritative: false,
            history_enabled: true,
            ..WorldConfig::default()
        });
        let predicted = client.spawn((Position { x: 5.0, y: 5.0 }, Replicated));
        assert_eq!(predicted.domain(), TRANSIENT_DOMAIN);

        let authoritative_entity = EntityId::pack(0, 42);
        client.promote_entity(causal_key(client.tick(), 0), authoritative_entity);

        assert!(!client.is_alive(predicted));
        assert!(client.is_alive(authoritative_entity));
        assert_eq!(client.get_component::<Position>(authoritative_entity), Some(&Position { x: 5.0, y: 5.0 }));
    }
}
