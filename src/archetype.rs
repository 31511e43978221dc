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

//! The archetype graph: a DAG of nodes keyed by comp-vec hash, linked by
//! subset/superset edges, with listener fan-out toward ancestors.
//!
//! Edges always point from a smaller vec to a proper superset. A query
//! subscribes its listener at the *minimal* node that satisfies its positive
//! constraints (the "anchor"); every more specific descendant still
//! satisfies those constraints, so fan-out for entity/relation events walks
//! from the node where the event happened up through its ancestors, handing
//! the event to whatever is registered there.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::entity::EntityId;
use crate::vecset::CompVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneStrategy {
    /// Removed once its entity set becomes empty (the default for
    /// dynamically-discovered archetypes).
    WhenEmpty,
    /// Never pruned (the root node).
    Keep,
}

/// Observer of graph structure and membership changes.
///
/// All methods default to no-ops so a listener only implements what it
/// actually watches (a pure entity-membership monitor never overrides the
/// relation hooks, and vice versa).
pub trait NodeListener {
    fn node_created(&mut self, _node: ArchetypeId, _vec: &CompVec) {}
    fn node_destroyed(&mut self, _node: ArchetypeId) {}
    fn entities_in(&mut self, _entities: &[EntityId], _node: ArchetypeId) {}
    fn entities_out(&mut self, _entities: &[EntityId], _node: ArchetypeId) {}
    fn relation_added(&mut self, _subject: EntityId, _rel_id: u32, _object: EntityId, _node: ArchetypeId) {}
    fn relation_removed(&mut self, _subject: EntityId, _rel_id: u32, _object: EntityId, _node: ArchetypeId) {}
}

pub type ListenerHandle = Rc<RefCell<dyn NodeListener>>;

/// One node of the archetype graph: an entity set, a stable row index per
/// entity, subset/superset neighbours, and the per-relation subject→objects
/// map used by query joins.
pub struct ArchetypeNode {
    pub id: ArchetypeId,
    pub vec: CompVec,
    entities: crate::sparse::SparseMap<u32>,
    prev: Vec<ArchetypeId>,
    next: Vec<ArchetypeId>,
    /// `relId -> subject -> objects`, populated for entities that live in
    /// this node and hold outgoing relation edges.
    relation_objects: FxHashMap<u32, FxHashMap<EntityId, SmallVec<[EntityId; 2]>>>,
    listeners: Vec<ListenerHandle>,
    prune_strategy: PruneStrategy,
    alive: bool,
}

impl ArchetypeNode {
    fn new(id: ArchetypeId, vec: CompVec, prune_strategy: PruneStrategy) -> Self {
        Self {
            id,
            vec,
            entities: crate::sparse::SparseMap::new(),
            prev: Vec::new(),
            next: Vec::new(),
            relation_objects: FxHashMap::default(),
            listeners: Vec::new(),
            prune_strategy,
            alive: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.entities.contains_key(entity.raw())
    }

    pub fn row_of(&self, entity: EntityId) -> Option<u32> {
        self.entities.get(entity.raw()).copied()
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().map(|&raw| EntityId::from_raw(raw))
    }

    pub fn entities_and_rows(&self) -> impl Iterator<Item = (EntityId, u32)> + '_ {
        self.entities.iter().map(|(raw, &row)| (EntityId::from_raw(raw), row))
    }

    pub fn objects_of(&self, subject: EntityId, rel_id: u32) -> &[EntityId] {
        self.relation_objects
            .get(&rel_id)
            .and_then(|m| m.get(&subject))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn relations_of_subject(&self, subject: EntityId) -> SmallVec<[(u32, EntityId); 4]> {
        let mut out = SmallVec::new();
        for (&rel_id, subjects) in self.relation_objects.iter() {
            if let Some(objects) = subjects.get(&subject) {
                for &object in objects {
                    out.push((rel_id, object));
                }
            }
        }
        out
    }

    fn remove_all_relations_of(&mut self, subject: EntityId) {
        for subjects in self.relation_objects.values_mut() {
            subjects.remove(&subject);
        }
    }

    pub fn prune_strategy(&self) -> PruneStrategy {
        self.prune_strategy
    }
}

/// Arena-backed DAG of archetype nodes, keyed by comp-vec hash and by the
/// current node of each live entity.
pub struct ArchetypeGraph {
    nodes: Vec<ArchetypeNode>,
    by_hash: FxHashMap<u64, ArchetypeId>,
    by_entity: FxHashMap<EntityId, ArchetypeId>,
    root: ArchetypeId,
}

impl Default for ArchetypeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchetypeGraph {
    pub fn new() -> Self {
        let root_vec = CompVec::empty();
        let root_node = ArchetypeNode::new(ArchetypeId(0), root_vec.clone(), PruneStrategy::Keep);
        let mut by_hash = FxHashMap::default();
        by_hash.insert(root_vec.hash(), ArchetypeId(0));
        Self {
            nodes: vec![root_node],
            by_hash,
            by_entity: FxHashMap::default(),
            root: ArchetypeId(0),
        }
    }

    pub fn root(&self) -> ArchetypeId {
        self.root
    }

    pub fn node(&self, id: ArchetypeId) -> &ArchetypeNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: ArchetypeId) -> &mut ArchetypeNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn node_of(&self, entity: EntityId) -> Option<ArchetypeId> {
        self.by_entity.get(&entity).copied()
    }

    /// Comp vec of the node `entity` currently lives in.
    pub fn vec_of(&self, entity: EntityId) -> Option<&CompVec> {
        self.by_entity.get(&entity).map(|&id| &self.node(id).vec)
    }

    /// Every entity with a live node membership. Used by history capture,
    /// which snapshots `(entity, vec)` pairs rather than graph internals so
    /// restore can rebuild membership through the normal node-creation path
    /// instead of needing the graph itself to be `Clone`.
    pub fn all_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.by_entity.keys().copied()
    }

    /// Drop every node but the root and all entity membership. Used by
    /// history restore, which rebuilds membership from a flat entity→vec map
    /// rather than attempting to clone nodes (their listeners are
    /// `Rc<RefCell<dyn NodeListener>>` and aren't `Clone`-able). Any
    /// [`ListenerHandle`] subscribed on a non-root node before the reset is
    /// dropped from the graph; subscribers must resubscribe afterward.
    pub fn reset(&mut self) {
        let root_vec = CompVec::empty();
        let root_node = ArchetypeNode::new(ArchetypeId(0), root_vec.clone(), PruneStrategy::Keep);
        let mut by_hash = FxHashMap::default();
        by_hash.insert(root_vec.hash(), ArchetypeId(0));
        self.nodes = vec![root_node];
        self.by_hash = by_hash;
        self.by_entity = FxHashMap::default();
    }

    /// Every `(relId, object)` pair where `entity` is the subject, as
    /// recorded in its current node. Used by despawn to unregister the
    /// matching incoming edges on each object before the entity id is freed.
    pub fn relations_of_entity(&self, entity: EntityId) -> SmallVec<[(u32, EntityId); 4]> {
        match self.by_entity.get(&entity) {
            Some(&id) => self.node(id).relations_of_subject(entity),
            None => SmallVec::new(),
        }
    }

    /// Find the node for `vec`, creating (and linking) it if it doesn't
    /// exist yet.
    pub fn find_or_create_node(&mut self, vec: CompVec, prune_strategy: PruneStrategy) -> ArchetypeId {
        if let Some(&id) = self.by_hash.get(&vec.hash()) {
            return id;
        }
        let id = ArchetypeId(self.nodes.len() as u32);
        self.nodes.push(ArchetypeNode::new(id, vec.clone(), prune_strategy));
        self.by_hash.insert(vec.hash(), id);
        self.relink_new_node(id);
        self.emit_node_created(id);
        id
    }

    /// Insert `new_id` into the subset/superset DAG against every other live
    /// node, then rewrite edges so only minimal parent / maximal-specific
    /// child links remain.
    fn relink_new_node(&mut self, new_id: ArchetypeId) {
        let new_vec = self.nodes[new_id.0 as usize].vec.clone();

        let mut parent_candidates = Vec::new();
        let mut child_candidates = Vec::new();
        for (i, n) in self.nodes.iter().enumerate() {
            let id = ArchetypeId(i as u32);
            if id == new_id || !n.alive {
                continue;
            }
            if n.vec == new_vec {
                continue;
            }
            if new_vec.is_superset_of(&n.vec) {
                parent_candidates.push(id);
            } else if n.vec.is_superset_of(&new_vec) {
                child_candidates.push(id);
            }
        }

        let vec_of = |g: &Self, id: ArchetypeId| g.nodes[id.0 as usize].vec.clone();

        // Keep only maximal parents: drop any candidate that is a proper
        // subset of another candidate (a more specific intermediate exists).
        let parents: Vec<ArchetypeId> = parent_candidates
            .iter()
            .copied()
            .filter(|&p| {
                let pv = vec_of(self, p);
                !parent_candidates.iter().any(|&q| {
                    q != p && {
                        let qv = vec_of(self, q);
                        qv.is_superset_of(&pv) && qv != pv
                    }
                })
            })
            .collect();

        // Keep only minimal children: drop any candidate that is a proper
        // superset of another candidate.
        let children: Vec<ArchetypeId> = child_candidates
            .iter()
            .copied()
            .filter(|&c| {
                let cv = vec_of(self, c);
                !child_candidates.iter().any(|&d| {
                    d != c && {
                        let dv = vec_of(self, d);
                        cv.is_superset_of(&dv) && cv != dv
                    }
                })
            })
            .collect();

        for &p in &parents {
            self.link(p, new_id);
        }

        for &c in &children {
            let old_parents: Vec<ArchetypeId> = self.nodes[c.0 as usize].prev.clone();
            for op in old_parents {
                if new_vec.is_superset_of(&vec_of(self, op)) {
                    self.unlink(op, c);
                }
            }
            self.link(new_id, c);
        }
    }

    fn link(&mut self, parent: ArchetypeId, child: ArchetypeId) {
        let p = &mut self.nodes[parent.0 as usize];
        if !p.next.contains(&child) {
            p.next.push(child);
        }
        let c = &mut self.nodes[child.0 as usize];
        if !c.prev.contains(&parent) {
            c.prev.push(parent);
        }
    }

    fn unlink(&mut self, parent: ArchetypeId, child: ArchetypeId) {
        self.nodes[parent.0 as usize].next.retain(|&x| x != child);
        self.nodes[child.0 as usize].prev.retain(|&x| x != parent);
    }

    /// DFS over `prev` edges, `start` included, each node visited once.
    fn ancestors_inclusive(&self, start: ArchetypeId) -> Vec<ArchetypeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if visited[id.0 as usize] {
                continue;
            }
            visited[id.0 as usize] = true;
            out.push(id);
            for &p in &self.nodes[id.0 as usize].prev {
                stack.push(p);
            }
        }
        out
    }

    fn ancestors_exclusive(&self, start: ArchetypeId) -> Vec<ArchetypeId> {
        let mut all = self.ancestors_inclusive(start);
        all.retain(|&id| id != start);
        all
    }

    /// DFS over `next` edges, `start` included.
    pub fn descendants_inclusive(&self, start: ArchetypeId) -> Vec<ArchetypeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if visited[id.0 as usize] {
                continue;
            }
            visited[id.0 as usize] = true;
            out.push(id);
            for &c in &self.nodes[id.0 as usize].next {
                stack.push(c);
            }
        }
        out
    }

    fn emit_node_created(&self, new_id: ArchetypeId) {
        let vec = self.nodes[new_id.0 as usize].vec.clone();
        for anc in self.ancestors_exclusive(new_id) {
            for l in &self.nodes[anc.0 as usize].listeners {
                l.borrow_mut().node_created(new_id, &vec);
            }
        }
    }

    fn emit_node_destroyed(&self, node_id: ArchetypeId) {
        for anc in self.ancestors_exclusive(node_id) {
            for l in &self.nodes[anc.0 as usize].listeners {
                l.borrow_mut().node_destroyed(node_id);
            }
        }
    }

    fn emit_entities_in(&self, node_id: ArchetypeId, entities: &[EntityId]) {
        if entities.is_empty() {
            return;
        }
        for anc in self.ancestors_inclusive(node_id) {
            for l in &self.nodes[anc.0 as usize].listeners {
                l.borrow_mut().entities_in(entities, node_id);
            }
        }
    }

    fn emit_entities_out(&self, node_id: ArchetypeId, entities: &[EntityId]) {
        if entities.is_empty() {
            return;
        }
        for anc in self.ancestors_inclusive(node_id) {
            for l in &self.nodes[anc.0 as usize].listeners {
                l.borrow_mut().entities_out(entities, node_id);
            }
        }
    }

    fn emit_relation_added(&self, node_id: ArchetypeId, subject: EntityId, rel_id: u32, object: EntityId) {
        for anc in self.ancestors_inclusive(node_id) {
            for l in &self.nodes[anc.0 as usize].listeners {
                l.borrow_mut().relation_added(subject, rel_id, object, node_id);
            }
        }
    }

    fn emit_relation_removed(&self, node_id: ArchetypeId, subject: EntityId, rel_id: u32, object: EntityId) {
        for anc in self.ancestors_inclusive(node_id) {
            for l in &self.nodes[anc.0 as usize].listeners {
                l.borrow_mut().relation_removed(subject, rel_id, object, node_id);
            }
        }
    }

    /// Move `entity` (placing it at row `row` in component storage) to
    /// `new_node`, carrying forward its own outgoing relation edges and
    /// firing entities-in/out + relation fan-out along the way.
    pub fn set_entity_node(&mut self, entity: EntityId, new_node: ArchetypeId, row: u32) {
        let old_node = self.by_entity.get(&entity).copied();
        if old_node == Some(new_node) {
            self.node_mut(new_node).entities.insert(entity.raw(), row);
            return;
        }

        let mut carried: SmallVec<[(u32, EntityId); 4]> = SmallVec::new();
        if let Some(old) = old_node {
            let node = self.node_mut(old);
            carried = node.relations_of_subject(entity);
            node.remove_all_relations_of(entity);
            node.entities.remove(entity.raw());
            self.emit_entities_out(old, &[entity]);
            for &(rel_id, object) in &carried {
                self.emit_relation_removed(old, entity, rel_id, object);
            }
        }

        {
            let node = self.node_mut(new_node);
            node.entities.insert(entity.raw(), row);
            for &(rel_id, object) in &carried {
                node.relation_objects
                    .entry(rel_id)
                    .or_default()
                    .entry(entity)
                    .or_default()
                    .push(object);
            }
        }
        self.by_entity.insert(entity, new_node);
        self.emit_entities_in(new_node, &[entity]);
        for &(rel_id, object) in &carried {
            self.emit_relation_added(new_node, entity, rel_id, object);
        }
    }

    /// Remove `entity` entirely (despawn). Does not affect relation edges
    /// where `entity` is the *object*; callers own that via the relation
    /// registry.
    pub fn remove_entity(&mut self, entity: EntityId) {
        if let Some(old) = self.by_entity.remove(&entity) {
            let node = self.node_mut(old);
            node.remove_all_relations_of(entity);
            node.entities.remove(entity.raw());
            self.emit_entities_out(old, &[entity]);
        }
    }

    /// Re-key a live entity to a new id in place (causal-key promotion),
    /// without moving it between nodes or touching its row or relations.
    pub fn rename_entity(&mut self, old: EntityId, new: EntityId) {
        let Some(node_id) = self.by_entity.remove(&old) else {
            return;
        };
        self.by_entity.insert(new, node_id);
        let node = self.node_mut(node_id);
        if let Some(row) = node.entities.remove(old.raw()) {
            node.entities.insert(new.raw(), row);
        }
        for subjects in node.relation_objects.values_mut() {
            if let Some(objects) = subjects.remove(&old) {
                subjects.insert(new, objects);
            }
            for objects in subjects.values_mut() {
                for object in objects.iter_mut() {
                    if *object == old {
                        *object = new;
                    }
                }
            }
        }
    }

    /// Record that `subject` (already living in its current node) gained an
    /// outgoing relation edge to `object`, without changing `subject`'s
    /// comp vec (the caller is responsible for the vec transition that the
    /// relation's virtual/bare ids require; this just updates the node-local
    /// join index for an already-resident subject).
    pub fn record_relation(&mut self, subject: EntityId, rel_id: u32, object: EntityId) {
        let Some(node_id) = self.by_entity.get(&subject).copied() else {
            return;
        };
        self.node_mut(node_id)
            .relation_objects
            .entry(rel_id)
            .or_default()
            .entry(subject)
            .or_default()
            .push(object);
        self.emit_relation_added(node_id, subject, rel_id, object);
    }

    pub fn forget_relation(&mut self, subject: EntityId, rel_id: u32, object: EntityId) {
        let Some(node_id) = self.by_entity.get(&subject).copied() else {
            return;
        };
        let node = self.node_mut(node_id);
        if let Some(subjects) = node.relation_objects.get_mut(&rel_id) {
            if let Some(objects) = subjects.get_mut(&subject) {
                objects.retain(|&o| o != object);
                if objects.is_empty() {
                    subjects.remove(&subject);
                }
            }
        }
        self.emit_relation_removed(node_id, subject, rel_id, object);
    }

    /// Subscribe `listener` to `node` (and, transitively, everything below
    /// it, via fan-out at event time). If `emit_existing`, immediately
    /// deliver the node's current entities as a synthetic `entities_in`.
    pub fn subscribe(&mut self, node: ArchetypeId, listener: ListenerHandle, emit_existing: bool) {
        if emit_existing {
            let existing: Vec<EntityId> = self.nodes[node.0 as usize].entities().collect();
            if !existing.is_empty() {
                listener.borrow_mut().entities_in(&existing, node);
            }
        }
        self.node_mut(node).listeners.push(listener);
    }

    /// Remove a node whose entity set is empty and whose strategy allows it,
    /// re-linking its children to its surviving parents.
    pub fn prune(&mut self, node_id: ArchetypeId) -> bool {
        if node_id == self.root {
            return false;
        }
        let node = &self.nodes[node_id.0 as usize];
        if node.prune_strategy != PruneStrategy::WhenEmpty || !node.entities.is_empty() {
            return false;
        }

        self.emit_node_destroyed(node_id);

        let parents = self.nodes[node_id.0 as usize].prev.clone();
        let children = self.nodes[node_id.0 as usize].next.clone();
        for &p in &parents {
            self.unlink(p, node_id);
        }
        for &c in &children {
            self.unlink(node_id, c);
        }

        // Re-link orphaned children to the pruned node's former parents,
        // where still a proper subset and not already linked.
        for &c in &children {
            let c_vec = self.nodes[c.0 as usize].vec.clone();
            for &p in &parents {
                let p_vec = self.nodes[p.0 as usize].vec.clone();
                if c_vec.is_superset_of(&p_vec) && c_vec != p_vec {
                    self.link(p, c);
                }
            }
        }

        self.by_hash.remove(&self.nodes[node_id.0 as usize].vec.hash());
        let node = &mut self.nodes[node_id.0 as usize];
        node.alive = false;
        node.prev.clear();
        node.next.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(local: u32) -> EntityId {
        EntityId::pack(0, local)
    }

    #[test]
    fn root_exists_and_is_not_prunable() {
        let mut g = ArchetypeGraph::new();
        assert!(!g.prune(g.root()));
        assert_eq!(g.node(g.root()).vec, CompVec::empty());
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let mut g = ArchetypeGraph::new();
        let v = CompVec::new([1, 2]);
        let a = g.find_or_create_node(v.clone(), PruneStrategy::WhenEmpty);
        let b = g.find_or_create_node(v, PruneStrategy::WhenEmpty);
        assert_eq!(a, b);
    }

    #[test]
    fn linking_forms_subset_chain() {
        let mut g = ArchetypeGraph::new();
        let a = g.find_or_create_node(CompVec::new([1]), PruneStrategy::WhenEmpty);
        let ab = g.find_or_create_node(CompVec::new([1, 2]), PruneStrategy::WhenEmpty);
        // root -> {1} -> {1,2}
        assert!(g.node(g.root()).next.contains(&a));
        assert!(g.node(a).next.contains(&ab));
        assert!(!g.node(g.root()).next.contains(&ab));
    }

    #[test]
    fn inserting_intermediate_node_reroutes_existing_edge() {
        let mut g = ArchetypeGraph::new();
        let ab = g.find_or_create_node(CompVec::new([1, 2]), PruneStrategy::WhenEmpty);
        // root -> {1,2} directly at first.
        assert!(g.node(g.root()).next.contains(&ab));
        let a = g.find_or_create_node(CompVec::new([1]), PruneStrategy::WhenEmpty);
        // now root -> {1} -> {1,2}, and root's direct edge to {1,2} is gone.
        assert!(g.node(g.root()).next.contains(&a));
        assert!(g.node(a).next.contains(&ab));
        assert!(!g.node(g.root()).next.contains(&ab));
    }

    #[test]
    fn moving_entity_updates_membership_and_fires_listeners() {
        struct Counter {
            ins: u32,
            outs: u32,
        }
        impl NodeListener for Counter {
            fn entities_in(&mut self, entities: &[EntityId], _node: ArchetypeId) {
                self.ins += entities.len() as u32;
            }
            fn entities_out(&mut self, entities: &[EntityId], _node: ArchetypeId) {
                self.outs += entities.len() as u32;
            }
        }

        let mut g = ArchetypeGraph::new();
        let root = g.root();
        let listener = Rc::new(RefCell::new(Counter { ins: 0, outs: 0 }));
        g.subscribe(root, listener.clone(), false);

        let a = g.find_or_create_node(CompVec::new([1]), PruneStrategy::WhenEmpty);
        g.set_entity_node(e(1), a, 0);
        assert!(g.node(a).contains(e(1)));
        assert_eq!(listener.borrow().ins, 1);

        let ab = g.find_or_create_node(CompVec::new([1, 2]), PruneStrategy::WhenEmpty);
        g.set_entity_node(e(1), ab, 0);
        assert!(!g.node(a).contains(e(1)));
        assert!(g.node(ab).contains(e(1)));
        assert_eq!(listener.borrow().ins, 2);
        assert_eq!(listener.borrow().outs, 1);
    }

    #[test]
    fn relation_edges_carry_across_node_moves() {
        let mut g = ArchetypeGraph::new();
        let a = g.find_or_create_node(CompVec::new([1]), PruneStrategy::WhenEmpty);
        g.set_entity_node(e(1), a, 0);
        g.record_relation(e(1), 99, e(2));
        assert_eq!(g.node(a).objects_of(e(1), 99), &[e(2)]);

        let ab = g.find_or_create_node(CompVec::new([1, 2]), PruneStrategy::WhenEmpty);
        g.set_entity_node(e(1), ab, 0);
        assert!(g.node(a).objects_of(e(1), 99).is_empty());
        assert_eq!(g.node(ab).objects_of(e(1), 99), &[e(2)]);
    }

    #[test]
    fn node_created_fans_out_to_ancestor_listeners() {
        struct Seen(Vec<ArchetypeId>);
        impl NodeListener for Seen {
            fn node_created(&mut self, node: ArchetypeId, _vec: &CompVec) {
                self.0.push(node);
            }
        }
        let mut g = ArchetypeGraph::new();
        let root = g.root();
        let seen = Rc::new(RefCell::new(Seen(Vec::new())));
        g.subscribe(root, seen.clone(), false);

        let a = g.find_or_create_node(CompVec::new([1]), PruneStrategy::WhenEmpty);
        let ab = g.find_or_create_node(CompVec::new([1, 2]), PruneStrategy::WhenEmpty);
        assert_eq!(seen.borrow().0, vec![a, ab]);
    }

    #[test]
    fn prune_removes_empty_node_and_relinks_children() {
        let mut g = ArchetypeGraph::new();
        let a = g.find_or_create_node(CompVec::new([1]), PruneStrategy::WhenEmpty);
        let ab = g.find_or_create_node(CompVec::new([1, 2]), PruneStrategy::WhenEmpty);
        assert!(g.prune(a));
        assert!(g.node(g.root()).next.contains(&ab));
        assert!(!g.node(ab).prev.contains(&a));
    }

    #[test]
    fn prune_refuses_nonempty_node() {
        let mut g = ArchetypeGraph::new();
        let a = g.find_or_create_node(CompVec::new([1]), PruneStrategy::WhenEmpty);
        g.set_entity_node(e(1), a, 0);
        assert!(!g.prune(a));
    }
}
