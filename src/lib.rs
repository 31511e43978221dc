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

//! orbit_ecs - deterministic archetype ECS
//!
//! Entities live in an archetype graph keyed by component-id set; queries
//! anchor on the minimal archetype that satisfies their constraints and ride
//! that node's listener fan-out for incremental maintenance instead of
//! re-scanning every tick. Mutations apply immediately; what's buffered is
//! only the record of what happened, for replication (a [`Transaction`] per
//! tick) and for rollback (a [`history::HistoryBuffer`] of checkpoints plus
//! an undo log).

pub mod archetype;
pub mod component;
pub mod entity;
pub mod error;
pub mod history;
pub mod query;
pub mod relation;
pub mod sparse;
pub mod store;
pub mod transaction;
pub mod vecset;
pub mod wire;
pub mod world;

pub mod prelude;

pub use archetype::{ArchetypeGraph, ArchetypeId, ArchetypeNode, ListenerHandle, NodeListener, PruneStrategy};
pub use component::{Component, ComponentDescriptor, ComponentId, ComponentRegistry, ComponentSerde};
pub use entity::{EntityId, EntityRegistry};
pub use error::{EcsError, Result};
pub use history::{Checkpoint, HistoryBuffer};
pub use query::{Entity, Fetch, Has, ManyFetch, MonitorState, Not, QueryState, QueryTerm, Read, Related, Write};
pub use relation::RelationRegistry;
pub use store::{AnyColumn, ComponentStore, EntityIndex, TypedColumn};
pub use transaction::{ReplicationOp, SpawnComponent, Transaction};
pub use vecset::CompVec;
pub use wire::{ClockSync, MessageType, apply_snapshot, apply_transaction, decode_transaction, encode_snapshot, encode_transaction};
pub use world::{Bundle, Replicated, UndoOp, World, WorldConfig};
