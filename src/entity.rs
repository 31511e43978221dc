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

//! Entity identifiers, the per-domain registry, and the entity→row index.
//!
//! An entity id is a plain 31-bit integer, not a generational handle: the
//! upper 11 bits are the owning domain, the lower 20 bits are a local id
//! recycled by a free list within that domain. Replication correlates
//! entities across peers by domain, so there is no per-entity generation
//! counter to desynchronize.

use rustc_hash::FxHashMap;

/// Bits of the local id field.
const LOCAL_BITS: u32 = 20;
const LOCAL_MASK: u32 = (1 << LOCAL_BITS) - 1;
/// Bits of the domain field.
const DOMAIN_BITS: u32 = 11;
const DOMAIN_MASK: u32 = (1 << DOMAIN_BITS) - 1;

/// Highest representable domain id; reserved for predicted (unconfirmed) entities.
pub const TRANSIENT_DOMAIN: u16 = DOMAIN_MASK as u16;

/// Opaque entity identifier: `(domainId << 20) | localId`, at most 31 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    /// Sentinel entity that owns process-wide resources (all-ones bit pattern).
    pub const RESOURCE: EntityId = EntityId((DOMAIN_MASK << LOCAL_BITS) | LOCAL_MASK);

    #[inline]
    pub fn pack(domain: u16, local: u32) -> Self {
        debug_assert!(domain as u32 <= DOMAIN_MASK, "domain id out of range");
        debug_assert!(local <= LOCAL_MASK, "local id out of range");
        EntityId(((domain as u32) << LOCAL_BITS) | (local & LOCAL_MASK))
    }

    #[inline]
    pub fn domain(self) -> u16 {
        ((self.0 >> LOCAL_BITS) & DOMAIN_MASK) as u16
    }

    #[inline]
    pub fn local(self) -> u32 {
        self.0 & LOCAL_MASK
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        EntityId(raw & ((DOMAIN_MASK << LOCAL_BITS) | LOCAL_MASK))
    }

    #[inline]
    pub fn is_resource(self) -> bool {
        self == Self::RESOURCE
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_resource() {
            write!(f, "Entity(RESOURCE)")
        } else {
            write!(f, "Entity({}:{})", self.domain(), self.local())
        }
    }
}

/// Per-domain free-list allocator for local ids.
#[derive(Debug, Clone, Default)]
struct DomainAllocator {
    next_local: u32,
    free: Vec<u32>,
}

/// Allocates and recycles [`EntityId`]s, partitioned by owning domain.
///
/// This is distinct from the [`crate::store::EntityIndex`]: the registry hands
/// out stable *identities*; the index maps a live identity to a compact row
/// used by component columns.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    domains: FxHashMap<u16, DomainAllocator>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh entity id within `domain`, reusing a freed local id
    /// (LIFO) when one is available.
    pub fn alloc(&mut self, domain: u16) -> EntityId {
        let alloc = self.domains.entry(domain).or_default();
        let local = alloc.free.pop().unwrap_or_else(|| {
            let id = alloc.next_local;
            alloc.next_local += 1;
            id
        });
        EntityId::pack(domain, local)
    }

    /// Return `entity`'s local id to its domain's free list.
    pub fn free(&mut self, entity: EntityId) {
        if entity.is_resource() {
            return;
        }
        self.domains
            .entry(entity.domain())
            .or_default()
            .free
            .push(entity.local());
    }

    /// Reserve `entity`'s exact local id, removing it from its domain's free
    /// list if present and advancing the domain's next-local counter past
    /// it. Used to undo a despawn: the entity must come back under the same
    /// id other surviving state (relation edges, undo entries) refers to it
    /// by, rather than whatever id the free list would hand out next.
    pub fn claim(&mut self, entity: EntityId) {
        if entity.is_resource() {
            return;
        }
        let alloc = self.domains.entry(entity.domain()).or_default();
        alloc.free.retain(|&local| local != entity.local());
        if entity.local() >= alloc.next_local {
            alloc.next_local = entity.local() + 1;
        }
    }

    /// Re-point the registry so `promoted` is recognized as replacing
    /// `predicted` — used when an authoritative spawn confirms a transient
    /// (client-predicted) entity. The predicted local id is released back to
    /// the transient domain's free list.
    pub fn promote(&mut self, predicted: EntityId, promoted: EntityId) {
        debug_assert_eq!(predicted.domain(), TRANSIENT_DOMAIN);
        self.free(predicted);
        // Ensure the target domain's next-local counter does not collide
        // with the explicitly-assigned promoted id.
        let alloc = self.domains.entry(promoted.domain()).or_default();
        if promoted.local() >= alloc.next_local {
            alloc.next_local = promoted.local() + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let e = EntityId::pack(5, 12345);
        assert_eq!(e.domain(), 5);
        assert_eq!(e.local(), 12345);
    }

    #[test]
    fn resource_sentinel_is_all_ones() {
        assert_eq!(EntityId::RESOURCE.domain() as u32, DOMAIN_MASK);
        assert_eq!(EntityId::RESOURCE.local(), LOCAL_MASK);
        assert!(EntityId::RESOURCE.is_resource());
    }

    #[test]
    fn registry_recycles_local_ids_lifo() {
        let mut reg = EntityRegistry::new();
        let a = reg.alloc(0);
        let b = reg.alloc(0);
        reg.free(b);
        let c = reg.alloc(0);
        assert_eq!(b, c);
        assert_ne!(a, b);
    }

    #[test]
    fn registry_domains_are_independent() {
        let mut reg = EntityRegistry::new();
        let a = reg.alloc(1);
        let b = reg.alloc(2);
        assert_eq!(a.local(), 0);
        assert_eq!(b.local(), 0);
        assert_ne!(a.domain(), b.domain());
    }

    #[test]
    fn promote_releases_predicted_slot() {
        let mut reg = EntityRegistry::new();
        let predicted = reg.alloc(TRANSIENT_DOMAIN);
        let authoritative = EntityId::pack(0, 7);
        reg.promote(predicted, authoritative);
        // the transient local id should be free again
        let reused = reg.alloc(TRANSIENT_DOMAIN);
        assert_eq!(reused, predicted);
    }
}
