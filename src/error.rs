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

//! Error types
//!
//! Per the core's error taxonomy: invariant violations are the only cases that
//! reach this type as a hard `Err`. Convergence rules (stale writes), inner-join
//! misses, and unknown-component placeholders are not errors and never appear here.

use std::fmt;

/// ECS error type
#[derive(Debug, Clone)]
pub enum EcsError {
    /// Entity id is out of the valid (domain, local) range or already despawned.
    InvalidEntity,

    /// A component id was requested that no descriptor has ever been registered for.
    ComponentNotFound,

    /// No archetype exists for the requested id (stale `ArchetypeId`).
    ArchetypeNotFound,

    /// Two distinct component descriptors resolved to the same numeric id.
    ComponentIdCollision(u32),

    /// A relation term referenced a relation id with no registered descriptor.
    UnknownRelation(u32),

    /// `rollback` was asked for a tick with no checkpoint at or before it.
    RollbackUnreachable(u32),

    /// Wire payload could not be decoded by the component's serde.
    DecodeError(String),

    /// A value failed to encode into the wire/checkpoint format.
    EncodeError(String),

    /// IO error (file operations for snapshot persistence, etc.)
    IoError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidEntity => write!(f, "invalid entity id"),
            EcsError::ComponentNotFound => write!(f, "component not found"),
            EcsError::ArchetypeNotFound => write!(f, "archetype not found"),
            EcsError::ComponentIdCollision(id) => {
                write!(f, "component id collision at {id}")
            }
            EcsError::UnknownRelation(id) => write!(f, "unknown relation id {id}"),
            EcsError::RollbackUnreachable(tick) => {
                write!(f, "no checkpoint at or before tick {tick}")
            }
            EcsError::DecodeError(msg) => write!(f, "decode error: {msg}"),
            EcsError::EncodeError(msg) => write!(f, "encode error: {msg}"),
            EcsError::IoError(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

impl From<std::io::Error> for EcsError {
    fn from(err: std::io::Error) -> Self {
        EcsError::IoError(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
