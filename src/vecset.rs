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

//! Immutable, sorted, deduplicated component-id vectors ("comp vecs") with
//! cached hashing and memoized set algebra.
//!
//! A comp vec is the key an archetype node is stored under: two entities with
//! the same comp vec, in any insertion order, are the same archetype. Set ops
//! between comp vecs are the hot path of every spawn/add/remove, so `sum`,
//! `difference`, and `intersection` memoize their result against the specific
//! other operand (by pointer identity) since the same pair of operands recurs
//! constantly as entities cycle through the same handful of transitions.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

/// FNV-style fold of a sorted id slice into a 64-bit hash.
fn fnv_fold(ids: &[u32]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &id in ids {
        h ^= id as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

struct Inner {
    ids: Box<[u32]>,
    hash: u64,
    membership: FxHashSet<u32>,
    sum_cache: RefCell<FxHashMap<usize, CompVec>>,
    diff_cache: RefCell<FxHashMap<usize, CompVec>>,
    inter_cache: RefCell<FxHashMap<usize, CompVec>>,
}

/// Sorted, deduplicated, reference-counted vector of component ids.
#[derive(Clone)]
pub struct CompVec(Rc<Inner>);

impl CompVec {
    /// Build a comp vec from an arbitrary slice of ids, sorting and
    /// deduplicating it.
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut v: Vec<u32> = ids.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        Self::from_sorted(v)
    }

    fn from_sorted(ids: Vec<u32>) -> Self {
        let hash = fnv_fold(&ids);
        let membership = ids.iter().copied().collect();
        Self(Rc::new(Inner {
            ids: ids.into_boxed_slice(),
            hash,
            membership,
            sum_cache: RefCell::new(FxHashMap::default()),
            diff_cache: RefCell::new(FxHashMap::default()),
            inter_cache: RefCell::new(FxHashMap::default()),
        }))
    }

    pub fn empty() -> Self {
        Self::from_sorted(Vec::new())
    }

    #[inline]
    pub fn ids(&self) -> &[u32] {
        &self.0.ids
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.0.hash
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.ids.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.0.membership.contains(&id)
    }

    #[inline]
    fn ptr_key(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// `self ∪ {extra}` plus every id already in `self`, merged against the
    /// sorted single-id slice — a cheap special case of [`Self::sum`] used
    /// when adding one component at a time.
    pub fn with(&self, extra: u32) -> CompVec {
        self.sum(&CompVec::new([extra]))
    }

    /// `self \ {removed}`.
    pub fn without(&self, removed: u32) -> CompVec {
        self.difference(&CompVec::new([removed]))
    }

    /// Set union, memoized against `other` by reference.
    pub fn sum(&self, other: &CompVec) -> CompVec {
        if Rc::ptr_eq(&self.0, &other.0) {
            return self.clone();
        }
        let key = other.ptr_key();
        if let Some(cached) = self.0.sum_cache.borrow().get(&key) {
            return cached.clone();
        }
        let merged = merge_union(&self.0.ids, &other.0.ids);
        let result = CompVec::from_sorted(merged);
        self.0.sum_cache.borrow_mut().insert(key, result.clone());
        result
    }

    /// Set difference, memoized against `other` by reference.
    pub fn difference(&self, other: &CompVec) -> CompVec {
        if Rc::ptr_eq(&self.0, &other.0) {
            return CompVec::empty();
        }
        let key = other.ptr_key();
        if let Some(cached) = self.0.diff_cache.borrow().get(&key) {
            return cached.clone();
        }
        let merged = merge_difference(&self.0.ids, &other.0.ids);
        let result = CompVec::from_sorted(merged);
        self.0.diff_cache.borrow_mut().insert(key, result.clone());
        result
    }

    /// Set intersection, memoized against `other` by reference.
    pub fn intersection(&self, other: &CompVec) -> CompVec {
        if Rc::ptr_eq(&self.0, &other.0) {
            return self.clone();
        }
        let key = other.ptr_key();
        if let Some(cached) = self.0.inter_cache.borrow().get(&key) {
            return cached.clone();
        }
        let merged = merge_intersection(&self.0.ids, &other.0.ids);
        let result = CompVec::from_sorted(merged);
        self.0.inter_cache.borrow_mut().insert(key, result.clone());
        result
    }

    /// `true` iff every id in `other` is also in `self`.
    pub fn is_superset_of(&self, other: &CompVec) -> bool {
        if other.len() > self.len() {
            return false;
        }
        let (a, b) = (&self.0.ids, &other.0.ids);
        let (mut i, mut j) = (0, 0);
        while j < b.len() {
            if i >= a.len() || a[i] > b[j] {
                return false;
            }
            if a[i] == b[j] {
                j += 1;
            }
            i += 1;
        }
        true
    }

    /// Hash of `self ∪ other` computed directly over the merged stream,
    /// without materializing or caching the union — a cheap probe used to
    /// test whether a target archetype node already exists before paying for
    /// a full `sum`.
    pub fn union_hash_with(&self, other: &CompVec) -> u64 {
        const OFFSET: u64 = 0xcbf29ce484222325;
        const PRIME: u64 = 0x100000001b3;
        let (a, b) = (&self.0.ids, &other.0.ids);
        let (mut i, mut j) = (0, 0);
        let mut h = OFFSET;
        while i < a.len() || j < b.len() {
            let next = if j >= b.len() || (i < a.len() && a[i] <= b[j]) {
                let v = a[i];
                i += 1;
                if j < b.len() && b[j] == v {
                    j += 1;
                }
                v
            } else {
                let v = b[j];
                j += 1;
                v
            };
            h ^= next as u64;
            h = h.wrapping_mul(PRIME);
        }
        h
    }
}

impl PartialEq for CompVec {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0.ids == other.0.ids
    }
}
impl Eq for CompVec {}

impl std::fmt::Debug for CompVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CompVec").field(&self.0.ids).finish()
    }
}

fn merge_union(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn merge_difference(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out
}

fn merge_intersection(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}
