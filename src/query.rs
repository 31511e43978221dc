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

//! Query planner and the All/Related runtime.
//!
//! A query is a tuple of term markers ([`Entity`], [`Read`], [`Has`], [`Not`],
//! [`Related`]) describing what a matching entity must carry. Compiling a
//! query finds (or creates) the **anchor** archetype node for its positive
//! terms via [`ArchetypeGraph::find_or_create_node`] and subscribes a
//! listener there; because graph edges always point from a node to its
//! proper supersets, every node that could ever satisfy the query is a
//! descendant of the anchor, so `node_created`/`node_destroyed` events
//! fanning out to the anchor's listener are exactly the maintenance a query
//! needs to keep its matched-node set current without rescanning the whole
//! graph each tick.
//!
//! `Not` terms are not part of the anchor (a forbidden component can't be
//! expressed as a positive vec membership test) and are instead checked per
//! row at fetch time.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::archetype::{ArchetypeGraph, ArchetypeId, NodeListener, PruneStrategy};
use crate::component::{Component, ComponentId, ComponentRegistry};
use crate::entity::EntityId;
use crate::vecset::CompVec;
use crate::world::World;

/// Yields the entity id itself.
pub struct Entity;
/// Fetches `&T`; contributes `T`'s id to the anchor.
pub struct Read<T>(PhantomData<fn() -> T>);
/// Declares intent to mutate `T` without fetching a reference here — callers
/// pair this with [`World::get_component_mut`] on the ids yielded by
/// [`QueryState::entities`], since handing out `&mut T` through a query
/// iterator would require aliasing the world the iterator already borrows.
pub struct Write<T>(PhantomData<fn() -> T>);
/// Presence-only test; contributes `T`'s id to the anchor but fetches `()`.
pub struct Has<T>(PhantomData<fn() -> T>);
/// Absence test; excludes entities that carry `T`. Checked per row, not part
/// of the anchor.
pub struct Not<T>(PhantomData<fn() -> T>);
/// One relation hop: the current entity must have relation `R`, and at least
/// one of its objects must itself satisfy `Q`. Fetches every satisfying
/// object's `Q::Item` (inner-join: no satisfying object means no match).
pub struct Related<R, Q>(PhantomData<fn() -> (R, Q)>);

/// Compile-time metadata: which component ids a term requires present
/// (anchor-contributing) or forbids (row-filtered).
pub trait QueryTerm {
    fn required_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>);
    fn excluded_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>);

    /// Every `(relId, anchor)` nested join level reachable from this term,
    /// for a [`MonitorState`] to subscribe a join-level listener at. A
    /// transition at `anchor` means some object gained or lost the inner
    /// query; the monitor looks up that object's subjects for `relId` and
    /// re-evaluates the compound query at the root for each of them.
    fn join_levels(_world: &mut World, _out: &mut Vec<(u32, ArchetypeId)>) {}
}

impl QueryTerm for Entity {
    fn required_ids(_reg: &ComponentRegistry, _out: &mut SmallVec<[u32; 8]>) {}
    fn excluded_ids(_reg: &ComponentRegistry, _out: &mut SmallVec<[u32; 8]>) {}
}

fn expect_registered<T: Component>(reg: &ComponentRegistry) -> ComponentId {
    reg.id_of::<T>().unwrap_or_else(|| {
        panic!(
            "query term names {} which has not been registered on this world",
            std::any::type_name::<T>()
        )
    })
}

impl<T: Component> QueryTerm for Read<T> {
    fn required_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>) {
        out.push(expect_registered::<T>(reg).0);
    }
    fn excluded_ids(_reg: &ComponentRegistry, _out: &mut SmallVec<[u32; 8]>) {}
}

impl<T: Component> QueryTerm for Write<T> {
    fn required_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>) {
        out.push(expect_registered::<T>(reg).0);
    }
    fn excluded_ids(_reg: &ComponentRegistry, _out: &mut SmallVec<[u32; 8]>) {}
}

impl<T: Component> QueryTerm for Has<T> {
    fn required_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>) {
        out.push(expect_registered::<T>(reg).0);
    }
    fn excluded_ids(_reg: &ComponentRegistry, _out: &mut SmallVec<[u32; 8]>) {}
}

impl<T: Component> QueryTerm for Not<T> {
    fn required_ids(_reg: &ComponentRegistry, _out: &mut SmallVec<[u32; 8]>) {}
    fn excluded_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>) {
        out.push(expect_registered::<T>(reg).0);
    }
}

impl<R: Component, Q: QueryTerm> QueryTerm for Related<R, Q> {
    fn required_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>) {
        out.push(expect_registered::<R>(reg).0);
    }
    fn excluded_ids(_reg: &ComponentRegistry, _out: &mut SmallVec<[u32; 8]>) {}

    fn join_levels(world: &mut World, out: &mut Vec<(u32, ArchetypeId)>) {
        if let Some(rel_id) = world.components().id_of::<R>() {
            let (inner_anchor, _excluded) = anchor_for::<Q>(world);
            out.push((rel_id.0, inner_anchor));
        }
        Q::join_levels(world, out);
    }
}

macro_rules! impl_query_term_tuple {
    ($($T:ident),+) => {
        impl<$($T),+> QueryTerm for ($($T,)+)
        where $($T: QueryTerm,)+
        {
            fn required_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>) {
                $($T::required_ids(reg, out);)+
            }
            fn excluded_ids(reg: &ComponentRegistry, out: &mut SmallVec<[u32; 8]>) {
                $($T::excluded_ids(reg, out);)+
            }
            fn join_levels(world: &mut World, out: &mut Vec<(u32, ArchetypeId)>) {
                $($T::join_levels(world, out);)+
            }
        }
    };
}

impl_query_term_tuple!(A);
impl_query_term_tuple!(A, B);
impl_query_term_tuple!(A, B, C);
impl_query_term_tuple!(A, B, C, D);
impl_query_term_tuple!(A, B, C, D, E);
impl_query_term_tuple!(A, B, C, D, E, F);
impl_query_term_tuple!(A, B, C, D, E, F, G);
impl_query_term_tuple!(A, B, C, D, E, F, G, H);

/// Runtime fetch of a term's value for a matched entity, borrowing `'w` from
/// the world the query was iterated against.
pub trait Fetch<'w>: QueryTerm {
    type Item;
    fn fetch(world: &'w World, entity: EntityId) -> Option<Self::Item>;
}

impl<'w> Fetch<'w> for Entity {
    type Item = EntityId;
    fn fetch(_world: &'w World, entity: EntityId) -> Option<EntityId> {
        Some(entity)
    }
}

impl<'w, T: Component + Clone> Fetch<'w> for Read<T> {
    type Item = &'w T;
    fn fetch(world: &'w World, entity: EntityId) -> Option<&'w T> {
        world.get_component::<T>(entity)
    }
}

impl<'w, T: Component> Fetch<'w> for Write<T> {
    type Item = EntityId;
    fn fetch(_world: &'w World, entity: EntityId) -> Option<EntityId> {
        Some(entity)
    }
}

impl<'w, T: Component> Fetch<'w> for Has<T> {
    type Item = ();
    fn fetch(world: &'w World, entity: EntityId) -> Option<()> {
        world.has_component::<T>(entity).then_some(())
    }
}

impl<'w, T: Component> Fetch<'w> for Not<T> {
    type Item = ();
    fn fetch(world: &'w World, entity: EntityId) -> Option<()> {
        (!world.has_component::<T>(entity)).then_some(())
    }
}

/// `Fetch`'s `Related` impl is deliberately tolerant of a join with no
/// satisfying object (`Some(SmallVec::new())`, not `None`): it backs
/// [`MonitorState`], where an entity surfaced by upstream join propagation
/// (see [`QueryTerm::join_levels`]) must still be reportable even though the
/// object side of its join just stopped matching. An empty joined list is
/// the "undefined" the Out monitor reports, not an excuse to drop the whole
/// row. [`ManyFetch`]'s `Related` impl is the inner-join-miss-means-no-row
/// version used by [`QueryState`].
impl<'w, R: Component, Q: Fetch<'w>> Fetch<'w> for Related<R, Q> {
    type Item = SmallVec<[Q::Item; 2]>;
    fn fetch(world: &'w World, entity: EntityId) -> Option<Self::Item> {
        let mut out = SmallVec::new();
        let Some(rel_id) = world.components().id_of::<R>() else {
            return Some(out);
        };
        let Some(node_id) = world.graph().node_of(entity) else {
            return Some(out);
        };
        let objects = world.graph().node(node_id).objects_of(entity, rel_id.0);
        for &object in objects {
            if let Some(item) = Q::fetch(world, object) {
                out.push(item);
            }
        }
        Some(out)
    }
}

macro_rules! impl_fetch_tuple {
    ($($T:ident),+) => {
        impl<'w, $($T),+> Fetch<'w> for ($($T,)+)
        where $($T: Fetch<'w>,)+
        {
            type Item = ($($T::Item,)+);
            #[allow(non_snake_case)]
            fn fetch(world: &'w World, entity: EntityId) -> Option<Self::Item> {
                $(let $T = $T::fetch(world, entity)?;)+
                Some(($($T,)+))
            }
        }
    };
}

impl_fetch_tuple!(A);
impl_fetch_tuple!(A, B);
impl_fetch_tuple!(A, B, C);
impl_fetch_tuple!(A, B, C, D);
impl_fetch_tuple!(A, B, C, D, E);
impl_fetch_tuple!(A, B, C, D, E, F);
impl_fetch_tuple!(A, B, C, D, E, F, G);
impl_fetch_tuple!(A, B, C, D, E, F, G, H);

/// Runtime fetch for [`QueryState`]'s full iteration: like [`Fetch`], but a
/// [`Related`] term fans out to one yielded row per matching object instead
/// of folding every object into one list. Two objects means two rows for
/// the same subject, each carrying a different object's item, and zero
/// objects means the subject itself yields no row (true inner-join miss).
pub trait ManyFetch<'w>: QueryTerm {
    type Item;
    fn fetch_all(world: &'w World, entity: EntityId) -> Box<dyn Iterator<Item = Self::Item> + 'w>;
}

// Plain terms already yield at most one item per entity; `fetch_all` just
// wraps that single-or-none result as an iterator. `Related` is the one term
// that can fan out, and gets its own impl below instead of one of these.
macro_rules! impl_many_fetch_plain {
    ($ty:ty, $($bound:tt)*) => {
        impl<'w, $($bound)*> ManyFetch<'w> for $ty {
            type Item = <$ty as Fetch<'w>>::Item;
            fn fetch_all(world: &'w World, entity: EntityId) -> Box<dyn Iterator<Item = Self::Item> + 'w> {
                Box::new(<$ty as Fetch<'w>>::fetch(world, entity).into_iter())
            }
        }
    };
}

impl_many_fetch_plain!(Entity,);
impl_many_fetch_plain!(Read<T>, T: Component + Clone);
impl_many_fetch_plain!(Write<T>, T: Component);
impl_many_fetch_plain!(Has<T>, T: Component);
impl_many_fetch_plain!(Not<T>, T: Component);

impl<'w, R: Component, Q: ManyFetch<'w>> ManyFetch<'w> for Related<R, Q>
where
    Q::Item: 'w,
{
    type Item = Q::Item;
    fn fetch_all(world: &'w World, entity: EntityId) -> Box<dyn Iterator<Item = Self::Item> + 'w> {
        let Some(rel_id) = world.components().id_of::<R>() else {
            return Box::new(std::iter::empty());
        };
        let Some(node_id) = world.graph().node_of(entity) else {
            return Box::new(std::iter::empty());
        };
        let objects: SmallVec<[EntityId; 2]> = world.graph().node(node_id).objects_of(entity, rel_id.0).into();
        Box::new(objects.into_iter().flat_map(move |object| Q::fetch_all(world, object)))
    }
}

impl<'w, A: ManyFetch<'w>> ManyFetch<'w> for (A,) {
    type Item = (A::Item,);
    fn fetch_all(world: &'w World, entity: EntityId) -> Box<dyn Iterator<Item = Self::Item> + 'w> {
        Box::new(A::fetch_all(world, entity).map(|a| (a,)))
    }
}

impl<'w, A: ManyFetch<'w>, B: ManyFetch<'w>> ManyFetch<'w> for (A, B)
where
    A::Item: Clone + 'w,
{
    type Item = (A::Item, B::Item);
    fn fetch_all(world: &'w World, entity: EntityId) -> Box<dyn Iterator<Item = Self::Item> + 'w> {
        let a_items: Vec<A::Item> = A::fetch_all(world, entity).collect();
        Box::new(
            a_items
                .into_iter()
                .flat_map(move |a| B::fetch_all(world, entity).map(move |b| (a.clone(), b))),
        )
    }
}

impl<'w, A: ManyFetch<'w>, B: ManyFetch<'w>, C: ManyFetch<'w>> ManyFetch<'w> for (A, B, C)
where
    A::Item: Clone + 'w,
    B::Item: Clone + 'w,
{
    type Item = (A::Item, B::Item, C::Item);
    fn fetch_all(world: &'w World, entity: EntityId) -> Box<dyn Iterator<Item = Self::Item> + 'w> {
        let ab_items: Vec<(A::Item, B::Item)> = <(A, B) as ManyFetch<'w>>::fetch_all(world, entity).collect();
        Box::new(
            ab_items
                .into_iter()
                .flat_map(move |(a, b)| C::fetch_all(world, entity).map(move |c| (a.clone(), b.clone(), c))),
        )
    }
}

impl<'w, A: ManyFetch<'w>, B: ManyFetch<'w>, C: ManyFetch<'w>, D: ManyFetch<'w>> ManyFetch<'w> for (A, B, C, D)
where
    A::Item: Clone + 'w,
    B::Item: Clone + 'w,
    C::Item: Clone + 'w,
{
    type Item = (A::Item, B::Item, C::Item, D::Item);
    fn fetch_all(world: &'w World, entity: EntityId) -> Box<dyn Iterator<Item = Self::Item> + 'w> {
        let abc_items: Vec<(A::Item, B::Item, C::Item)> =
            <(A, B, C) as ManyFetch<'w>>::fetch_all(world, entity).collect();
        Box::new(abc_items.into_iter().flat_map(move |(a, b, c)| {
            D::fetch_all(world, entity).map(move |d| (a.clone(), b.clone(), c.clone(), d))
        }))
    }
}

/// Tracks which archetype nodes currently satisfy a query's anchor.
struct MatchListener {
    matched: FxHashSet<ArchetypeId>,
}

impl NodeListener for MatchListener {
    fn node_created(&mut self, node: ArchetypeId, _vec: &CompVec) {
        self.matched.insert(node);
    }
    fn node_destroyed(&mut self, node: ArchetypeId) {
        self.matched.remove(&node);
    }
}

fn anchor_for<Q: QueryTerm>(world: &mut World) -> (ArchetypeId, SmallVec<[u32; 8]>) {
    let mut required = SmallVec::new();
    Q::required_ids(world.components(), &mut required);
    let mut excluded = SmallVec::new();
    Q::excluded_ids(world.components(), &mut excluded);
    let vec = CompVec::new(required.iter().copied());
    let anchor = world.graph_mut().find_or_create_node(vec, PruneStrategy::Keep);
    (anchor, excluded)
}

/// A compiled, incrementally-maintained query over `Q`.
///
/// Construction is cheap to repeat per-frame only if the anchor already
/// exists (`find_or_create_node` is O(1) on hash hit); callers that run a
/// query every tick should build it once (e.g. as a system-local or world
/// resource) and reuse it instead of recompiling.
pub struct QueryState<Q> {
    anchor: ArchetypeId,
    listener: Rc<RefCell<MatchListener>>,
    _marker: PhantomData<fn() -> Q>,
}

impl<Q: QueryTerm> QueryState<Q> {
    pub fn new(world: &mut World) -> Self {
        let (anchor, _excluded) = anchor_for::<Q>(world);
        let mut matched = FxHashSet::default();
        for node in world.graph().descendants_inclusive(anchor) {
            matched.insert(node);
        }
        let listener = Rc::new(RefCell::new(MatchListener { matched }));
        world.graph_mut().subscribe(anchor, listener.clone(), false);
        Self { anchor, listener, _marker: PhantomData }
    }

    pub fn anchor(&self) -> ArchetypeId {
        self.anchor
    }

    /// Entity ids currently matching the query's positive terms (cheap; does
    /// not evaluate `Not` terms or fetch values). Pair with
    /// [`World::get_component_mut`] to mutate `Write<T>` terms.
    pub fn entities<'w>(&self, world: &'w World) -> impl Iterator<Item = EntityId> + 'w {
        let nodes: SmallVec<[ArchetypeId; 8]> = self.listener.borrow().matched.iter().copied().collect();
        nodes
            .into_iter()
            .flat_map(move |node_id| world.graph().node(node_id).entities().collect::<SmallVec<[EntityId; 16]>>())
    }

    /// Full iteration: matching entities, with `Not` terms filtered and every
    /// positive term fetched in descriptor order. A `Related` term fans out
    /// to one row per matching object (zero objects yields zero rows for
    /// that entity).
    pub fn iter<'w>(&self, world: &'w World) -> impl Iterator<Item = Q::Item> + 'w
    where
        Q: ManyFetch<'w>,
    {
        self.entities(world).flat_map(move |entity| Q::fetch_all(world, entity))
    }

    pub fn count(&self, world: &World) -> usize {
        self.entities(world).count()
    }
}

/// Extends a query with `added`/`removed` sets diffed against the previous
/// tick's matched entities, per spec's In/Out monitor.
struct MonitorListener {
    added: FxHashSet<EntityId>,
    removed: FxHashSet<EntityId>,
}

impl NodeListener for MonitorListener {
    fn entities_in(&mut self, entities: &[EntityId], _node: ArchetypeId) {
        for &e in entities {
            // Removed then re-added within the same epoch: cancels out, not a
            // net add.
            if !self.removed.remove(&e) {
                self.added.insert(e);
            }
        }
    }
    fn entities_out(&mut self, entities: &[EntityId], _node: ArchetypeId) {
        for &e in entities {
            // Added then removed within the same epoch: cancels out, appears
            // in neither set.
            if !self.added.remove(&e) {
                self.removed.insert(e);
            }
        }
    }
}

/// Records raw add/remove transitions of objects entering or leaving a
/// nested join level's inner query, same cancel-within-epoch rule as
/// [`MonitorListener`]. Carries no world access: the object-to-subject
/// lookup that turns these into root-level `added`/`removed` entries happens
/// later, in [`MonitorState::resolve_joins`], which does have one.
#[derive(Default)]
struct JoinListener {
    entered: FxHashSet<EntityId>,
    left: FxHashSet<EntityId>,
}

impl NodeListener for JoinListener {
    fn entities_in(&mut self, entities: &[EntityId], _node: ArchetypeId) {
        for &e in entities {
            if !self.left.remove(&e) {
                self.entered.insert(e);
            }
        }
    }
    fn entities_out(&mut self, entities: &[EntityId], _node: ArchetypeId) {
        for &e in entities {
            if !self.entered.remove(&e) {
                self.left.insert(e);
            }
        }
    }
}

/// One nested join level a [`MonitorState`] subscribes to: `rel_id` is the
/// relation carrying the edge back to a root subject, `listener` buffers the
/// inner query's own add/remove transitions at that level's anchor node.
struct JoinLevel {
    rel_id: u32,
    listener: Rc<RefCell<JoinListener>>,
}

pub struct MonitorState<Q> {
    anchor: ArchetypeId,
    listener: Rc<RefCell<MonitorListener>>,
    joins: Vec<JoinLevel>,
    _marker: PhantomData<fn() -> Q>,
}

impl<Q: QueryTerm> MonitorState<Q> {
    pub fn new(world: &mut World) -> Self {
        let (anchor, _excluded) = anchor_for::<Q>(world);
        let listener = Rc::new(RefCell::new(MonitorListener {
            added: FxHashSet::default(),
            removed: FxHashSet::default(),
        }));
        world.graph_mut().subscribe(anchor, listener.clone(), false);

        let mut levels = Vec::new();
        Q::join_levels(world, &mut levels);
        let joins = levels
            .into_iter()
            .map(|(rel_id, join_anchor)| {
                let join_listener = Rc::new(RefCell::new(JoinListener::default()));
                world.graph_mut().subscribe(join_anchor, join_listener.clone(), false);
                JoinLevel { rel_id, listener: join_listener }
            })
            .collect();

        Self { anchor, listener, joins, _marker: PhantomData }
    }

    pub fn anchor(&self) -> ArchetypeId {
        self.anchor
    }

    /// Propagates upstream: for every join level, drains the objects that
    /// just entered or left its inner query, looks each up in
    /// `objectToSubjects` for the level's relation id, and folds every
    /// matching subject into the root `added`/`removed` sets (the same
    /// cancel-within-epoch rule `MonitorListener` applies to its own direct
    /// transitions).
    fn resolve_joins(&self, world: &World) {
        if self.joins.is_empty() {
            return;
        }
        let mut root = self.listener.borrow_mut();
        for level in &self.joins {
            let mut l = level.listener.borrow_mut();
            for object in l.entered.drain() {
                for subject in world.relations().subjects_of(object) {
                    if subject.rel_id == level.rel_id && !root.removed.remove(&subject.entity) {
                        root.added.insert(subject.entity);
                    }
                }
            }
            for object in l.left.drain() {
                for subject in world.relations().subjects_of(object) {
                    if subject.rel_id == level.rel_id && !root.added.remove(&subject.entity) {
                        root.removed.insert(subject.entity);
                    }
                }
            }
        }
    }

    /// Entities that newly satisfied the query since the last [`Self::clear`].
    pub fn added<'w>(&self, world: &'w World) -> impl Iterator<Item = Q::Item> + 'w
    where
        Q: Fetch<'w>,
    {
        self.resolve_joins(world);
        let ids: SmallVec<[EntityId; 8]> = self.listener.borrow().added.iter().copied().collect();
        ids.into_iter().filter_map(move |e| Q::fetch(world, e))
    }

    /// Entities that stopped satisfying the query since the last
    /// [`Self::clear`]. Component values read here reflect the last value
    /// written before removal — deferred component/entity teardown means
    /// these reads are still valid until [`World::flush_deletions`] runs.
    pub fn removed<'w>(&self, world: &'w World) -> impl Iterator<Item = Q::Item> + 'w
    where
        Q: Fetch<'w>,
    {
        self.resolve_joins(world);
        let ids: SmallVec<[EntityId; 8]> = self.listener.borrow().removed.iter().copied().collect();
        ids.into_iter().filter_map(move |e| Q::fetch(world, e))
    }

    /// Empty both sets; call after the system that consumed them has run, so
    /// the next tick starts from a clean diff.
    pub fn clear(&self) {
        let mut l = self.listener.borrow_mut();
        l.added.clear();
        l.removed.clear();
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
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Name(String);
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct Dead;
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct ChildOf;

    fn new_world() -> World {
        World::new(WorldConfig::default())
    }

    #[test]
    fn basic_read_query_matches_spawned_entities() {
        let mut w = new_world();
        w.register_value::<Position>().unwrap();
        let e1 = w.spawn(Position { x: 1.0, y: 1.0 });
        let _e2 = w.spawn(Name("no position".into()));

        let q = QueryState::<(Entity, Read<Position>)>::new(&mut w);
        let results: Vec<_> = q.iter(&w).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, e1);
    }

    #[test]
    fn query_created_before_matching_archetype_exists_still_sees_later_spawns() {
        let mut w = new_world();
        w.register_value::<Position>().unwrap();
        let q = QueryState::<Read<Position>>::new(&mut w);
        assert_eq!(q.count(&w), 0);

        w.spawn(Position { x: 0.0, y: 0.0 });
        assert_eq!(q.count(&w), 1);
    }

    #[test]
    fn not_term_excludes_matching_component() {
        let mut w = new_world();
        w.register_value::<Position>().unwrap();
        w.register_tag::<Dead>().unwrap();
        let alive = w.spawn(Position { x: 0.0, y: 0.0 });
        let dead = w.spawn((Position { x: 0.0, y: 0.0 }, Dead));

        let q = QueryState::<(Entity, Read<Position>, Not<Dead>)>::new(&mut w);
        let results: Vec<_> = q.iter(&w).map(|(e, _, _)| e).collect();
        assert!(results.contains(&alive));
        assert!(!results.contains(&dead));
    }

    #[test]
    fn related_query_joins_through_relation() {
        let mut w = new_world();
        w.register_relation::<ChildOf>().unwrap();
        w.register_value::<Name>().unwrap();
        let parent = w.spawn(Name("parent".into()));
        let child = w.spawn(());
        w.add_relation::<ChildOf>(child, parent);

        let q = QueryState::<(Entity, Related<ChildOf, Read<Name>>)>::new(&mut w);
        let results: Vec<_> = q.iter(&w).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, child);
        assert_eq!((results[0].1).0, "parent");
    }

    #[test]
    fn monitor_tracks_added_and_removed_since_last_clear() {
        let mut w = new_world();
        w.register_value::<Position>().unwrap();
        let m = MonitorState::<(Entity, Read<Position>)>::new(&mut w);

        let e = w.spawn(Position { x: 1.0, y: 2.0 });
        let added: Vec<_> = m.added(&w).map(|(e, _)| e).collect();
        assert_eq!(added, vec![e]);
        m.clear();
        assert_eq!(m.added(&w).count(), 0);

        w.despawn(e);
        let removed: Vec<_> = m.removed(&w).map(|(e, _)| e).collect();
        assert_eq!(removed, vec![e]);
    }

    #[test]
    fn monitor_add_then_remove_in_same_tick_nets_to_neither_set() {
        let mut w = new_world();
        w.register_value::<Position>().unwrap();
        let m = MonitorState::<(Entity, Read<Position>)>::new(&mut w);

        let e = w.spawn(Position { x: 0.0, y: 0.0 });
        w.despawn(e);
        assert_eq!(m.added(&w).count(), 0);
        assert_eq!(m.removed(&w).count(), 0);
    }
}
