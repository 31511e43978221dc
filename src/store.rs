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

//! Columnar component storage with per-slot monotonic versions, and the
//! entity→row index that gives every live entity a stable position in every
//! column.

use std::any::Any;

use rustc_hash::FxHashMap;

use crate::component::{ComponentId, ComponentSerde};
use crate::entity::EntityId;
use crate::error::{EcsError, Result};
use crate::sparse::SparseMap;

/// Composite version `tick * 2048 + domainId`: same-tick writes from a
/// higher-id domain beat a lower-id domain, giving peers a deterministic
/// tie-break without a clock.
#[inline]
pub fn composite_version(tick: u32, domain_id: u16) -> u32 {
    tick.wrapping_mul(2048).wrapping_add(domain_id as u32)
}

/// A type-erased component column. Implemented generically by [`TypedColumn`].
pub trait AnyColumn: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Grow the column so row `row` is addressable.
    fn ensure_row(&mut self, row: usize);

    /// Version currently stored at `row` (0 if the row was never written).
    fn version_at(&self, row: usize) -> u32;

    /// Is there a live value at `row`?
    fn has_value(&self, row: usize) -> bool;

    /// Blank the value at `row` (deferred-removal finalization).
    fn clear_row(&mut self, row: usize);

    /// Read-only type-erased view of the value at `row`, if present.
    fn get_any(&self, row: usize) -> Option<&dyn Any>;

    /// Write a type-erased value into `row` honoring last-writer-wins unless
    /// `force` is set (authoritative snapshot application). Returns whether
    /// the write was applied (`false` means a stale write was dropped).
    fn set_any(&mut self, row: usize, value: Box<dyn Any>, version: u32, force: bool) -> Result<bool>;

    /// Encode the value at `row` through `serde`.
    fn encode_row(&self, row: usize, serde: &dyn ComponentSerde, out: &mut Vec<u8>) -> Result<()>;

    /// Deep-clone the whole column (used by history snapshots).
    fn clone_column(&self) -> Box<dyn AnyColumn>;

    /// Copy the value and version at `src_row` of `other` into `row` of
    /// `self`. A no-op if `other` is not the same concrete column type (used
    /// to preserve the resource row across a history restore, where `other`
    /// is always a pre-restore clone of the same registry's columns).
    fn copy_row_from(&mut self, row: usize, other: &dyn AnyColumn, src_row: usize);
}

/// Concrete column for component payload type `T`.
pub struct TypedColumn<T> {
    data: Vec<Option<T>>,
    versions: Vec<u32>,
}

impl<T> Default for TypedColumn<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            versions: Vec::new(),
        }
    }
}

impl<T: 'static + Send + Sync + Clone> TypedColumn<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, row: usize) -> Option<&T> {
        self.data.get(row).and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, row: usize) -> Option<&mut T> {
        self.data.get_mut(row).and_then(|o| o.as_mut())
    }

    /// Write a typed value directly, bypassing the `dyn Any` boxing path —
    /// the hot path used by [`crate::world::World::set_component`].
    pub fn set(&mut self, row: usize, value: T, version: u32, force: bool) -> bool {
        self.ensure_row(row);
        if !force && self.versions[row] > version {
            return false;
        }
        self.data[row] = Some(value);
        self.versions[row] = version;
        true
    }
}

impl<T: 'static + Send + Sync + Clone> AnyColumn for TypedColumn<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn ensure_row(&mut self, row: usize) {
        if self.data.len() <= row {
            let new_cap = (self.data.len() * 2).max(row + 1);
            self.data.resize(new_cap, None);
            self.versions.resize(new_cap, 0);
        }
    }

    fn version_at(&self, row: usize) -> u32 {
        self.versions.get(row).copied().unwrap_or(0)
    }

    fn has_value(&self, row: usize) -> bool {
        self.data.get(row).map(|o| o.is_some()).unwrap_or(false)
    }

    fn clear_row(&mut self, row: usize) {
        if let Some(slot) = self.data.get_mut(row) {
            *slot = None;
        }
    }

    fn get_any(&self, row: usize) -> Option<&dyn Any> {
        self.data.get(row).and_then(|o| o.as_ref()).map(|v| v as &dyn Any)
    }

    fn set_any(&mut self, row: usize, value: Box<dyn Any>, version: u32, force: bool) -> Result<bool> {
        let value = *value
            .downcast::<T>()
            .map_err(|_| EcsError::DecodeError("column type mismatch".into()))?;
        Ok(self.set(row, value, version, force))
    }

    fn encode_row(&self, row: usize, serde: &dyn ComponentSerde, out: &mut Vec<u8>) -> Result<()> {
        let value = self
            .get(row)
            .ok_or(EcsError::ComponentNotFound)?;
        serde.encode(value as &dyn Any, out)
    }

    fn clone_column(&self) -> Box<dyn AnyColumn> {
        Box::new(TypedColumn {
            data: self.data.clone(),
            versions: self.versions.clone(),
        })
    }

    fn copy_row_from(&mut self, row: usize, other: &dyn AnyColumn, src_row: usize) {
        let Some(src) = other.as_any().downcast_ref::<TypedColumn<T>>() else {
            return;
        };
        self.ensure_row(row);
        self.data[row] = src.data.get(src_row).cloned().flatten();
        self.versions[row] = src.versions.get(src_row).copied().unwrap_or(0);
    }
}

/// Columnar storage for every registered non-tag component, keyed by id.
#[derive(Default)]
pub struct ComponentStore {
    columns: FxHashMap<u32, Box<dyn AnyColumn>>,
}

impl ComponentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a column exists for `id`, creating it from `make` if absent.
    pub fn get_or_create_column<T, F>(&mut self, id: ComponentId, make: F) -> &mut TypedColumn<T>
    where
        T: 'static + Send + Sync + Clone,
        F: FnOnce() -> TypedColumn<T>,
    {
        let col = self
            .columns
            .entry(id.0)
            .or_insert_with(|| Box::new(make()));
        col.as_any_mut()
            .downcast_mut::<TypedColumn<T>>()
            .expect("component id reused with a different payload type")
    }

    /// Ensure a column exists for `id`, creating it type-erased from `make`
    /// if absent. Used where the caller only has a [`ComponentId`], not the
    /// concrete Rust type (undo log replay, incoming wire transactions).
    pub fn ensure_column_raw(
        &mut self,
        id: ComponentId,
        make: impl FnOnce() -> Box<dyn AnyColumn>,
    ) -> &mut Box<dyn AnyColumn> {
        self.columns.entry(id.0).or_insert_with(make)
    }

    pub fn column(&self, id: ComponentId) -> Option<&dyn AnyColumn> {
        self.columns.get(&id.0).map(|b| b.as_ref())
    }

    pub fn column_mut(&mut self, id: ComponentId) -> Option<&mut Box<dyn AnyColumn>> {
        self.columns.get_mut(&id.0)
    }

    pub fn typed<T: 'static + Send + Sync + Clone>(&self, id: ComponentId) -> Option<&TypedColumn<T>> {
        self.columns.get(&id.0).and_then(|c| c.as_any().downcast_ref())
    }

    pub fn typed_mut<T: 'static + Send + Sync + Clone>(&mut self, id: ComponentId) -> Option<&mut TypedColumn<T>> {
        self.columns
            .get_mut(&id.0)
            .and_then(|c| c.as_any_mut().downcast_mut())
    }

    /// Deferred-removal finalization: blank the value, keeping the row slot
    /// (and its version) intact so a later spawn at the same row can't see
    /// stale garbage leak as a "previous version".
    pub fn clear_row(&mut self, id: ComponentId, row: usize) {
        if let Some(col) = self.columns.get_mut(&id.0) {
            col.clear_row(row);
        }
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.columns.keys().copied().map(ComponentId)
    }

    pub fn snapshot(&self) -> FxHashMap<u32, Box<dyn AnyColumn>> {
        self.columns
            .iter()
            .map(|(id, col)| (*id, col.clone_column()))
            .collect()
    }

    pub fn restore(&mut self, snapshot: FxHashMap<u32, Box<dyn AnyColumn>>) {
        self.columns = snapshot;
    }

    /// Copy `row` back from `backup` into the current columns, reinstating
    /// the whole column if `restore` dropped it. Used to keep the resource
    /// row (row 0) untouched by a history rollback.
    pub fn preserve_row(&mut self, row: usize, backup: &FxHashMap<u32, Box<dyn AnyColumn>>) {
        for (id, col) in backup.iter() {
            match self.columns.get_mut(id) {
                Some(dst) => dst.copy_row_from(row, col.as_ref(), row),
                None => {
                    self.columns.insert(*id, col.clone_column());
                }
            }
        }
    }
}

/// Maps a live [`EntityId`] to a stable, compact row index shared by every
/// component column. Index 0 is reserved for [`EntityId::RESOURCE`].
#[derive(Clone, Default)]
pub struct EntityIndex {
    entity_to_index: SparseMap<u32>,
    index_to_entity: Vec<Option<EntityId>>,
    free: Vec<u32>,
    next: u32,
}

impl EntityIndex {
    pub fn new() -> Self {
        let mut idx = Self {
            entity_to_index: SparseMap::new(),
            index_to_entity: vec![None],
            free: Vec::new(),
            next: 1,
        };
        idx.entity_to_index.insert(EntityId::RESOURCE.raw(), 0);
        idx.index_to_entity[0] = Some(EntityId::RESOURCE);
        idx
    }

    /// Row index for `entity`, allocating one (reusing a freed row LIFO) if
    /// this is the entity's first appearance.
    pub fn get_or_create_index(&mut self, entity: EntityId) -> u32 {
        if entity.is_resource() {
            return 0;
        }
        if let Some(&row) = self.entity_to_index.get(entity.raw()) {
            return row;
        }
        let row = self.free.pop().unwrap_or_else(|| {
            let r = self.next;
            self.next += 1;
            r
        });
        self.entity_to_index.insert(entity.raw(), row);
        if self.index_to_entity.len() <= row as usize {
            self.index_to_entity.resize(row as usize + 1, None);
        }
        self.index_to_entity[row as usize] = Some(entity);
        row
    }

    pub fn index_of(&self, entity: EntityId) -> Option<u32> {
        if entity.is_resource() {
            return Some(0);
        }
        self.entity_to_index.get(entity.raw()).copied()
    }

    pub fn entity_at(&self, row: u32) -> Option<EntityId> {
        self.index_to_entity.get(row as usize).copied().flatten()
    }

    /// Re-key `old`'s row under `new` (causal-key promotion: a predicted
    /// transient entity is confirmed authoritative under a different id, but
    /// keeps its row and every column value already written at that row).
    pub fn rename(&mut self, old: EntityId, new: EntityId) {
        if let Some(row) = self.entity_to_index.remove(old.raw()) {
            self.entity_to_index.insert(new.raw(), row);
            if let Some(slot) = self.index_to_entity.get_mut(row as usize) {
                *slot = Some(new);
            }
        }
    }

    /// Release `entity`'s row back to the free list (LIFO). Never frees row 0.
    pub fn free(&mut self, entity: EntityId) {
        if entity.is_resource() {
            return;
        }
        if let Some(row) = self.entity_to_index.remove(entity.raw()) {
            self.index_to_entity[row as usize] = None;
            self.free.push(row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_version_tie_breaks_on_domain() {
        let a = composite_version(5, 1);
        let b = composite_version(5, 2);
        assert!(b > a);
    }

    #[test]
    fn stale_write_is_dropped() {
        let mut col: TypedColumn<i32> = TypedColumn::new();
        assert!(col.set(0, 10, 5, false));
        assert!(!col.set(0, 20, 3, false)); // older version: dropped
        assert_eq!(col.get(0), Some(&10));
        assert!(col.set(0, 30, 5, false)); // equal version: accepted
        assert_eq!(col.get(0), Some(&30));
    }

    #[test]
    fn forced_write_ignores_version() {
        let mut col: TypedColumn<i32> = TypedColumn::new();
        col.set(0, 10, 9, false);
        assert!(col.set(0, 1, 0, true));
        assert_eq!(col.get(0), Some(&1));
    }

    #[test]
    fn clear_row_blanks_value_but_keeps_version() {
        let mut col: TypedColumn<i32> = TypedColumn::new();
        col.set(0, 10, 5, false);
        col.clear_row(0);
        assert_eq!(col.get(0), None);
        assert_eq!(col.version_at(0), 5);
    }

    #[test]
    fn entity_index_reuses_rows_lifo() {
        let mut idx = EntityIndex::new();
        let e1 = EntityId::pack(0, 1);
        let e2 = EntityId::pack(0, 2);
        let r1 = idx.get_or_create_index(e1);
        let r2 = idx.get_or_create_index(e2);
        assert_ne!(r1, r2);
        idx.free(e2);
        let e3 = EntityId::pack(0, 3);
        let r3 = idx.get_or_create_index(e3);
        assert_eq!(r3, r2);
    }

    #[test]
    fn resource_entity_is_row_zero() {
        let mut idx = EntityIndex::new();
        assert_eq!(idx.index_of(EntityId::RESOURCE), Some(0));
        assert_eq!(idx.get_or_create_index(EntityId::RESOURCE), 0);
    }
}
