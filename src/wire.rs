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

//! Wire codec: little-endian messages, one byte of type tag plus a varint
//! tick, then a type-specific payload. This module only shapes bytes; a
//! transport (not part of this crate) is responsible for framing messages on
//! the stream and handing decoded values to [`apply_transaction`] /
//! [`apply_snapshot`].

#[cfg(feature = "profiling")]
use tracing::warn;

use crate::component::ComponentId;
use crate::entity::EntityId;
use crate::error::{EcsError, Result};
use crate::transaction::{RelPair, ReplicationOp, SpawnComponent, Transaction};
use crate::world::World;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    ClockSync = 2,
    Transaction = 3,
    Snapshot = 4,
    Command = 5,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Handshake),
            2 => Some(Self::ClockSync),
            3 => Some(Self::Transaction),
            4 => Some(Self::Snapshot),
            5 => Some(Self::Command),
            _ => None,
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let &byte = bytes
            .get(*pos)
            .ok_or_else(|| EcsError::DecodeError("varint truncated".into()))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(EcsError::DecodeError("varint too long".into()));
        }
    }
    Ok(result)
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let slice = bytes
        .get(*pos..*pos + 4)
        .ok_or_else(|| EcsError::DecodeError("u32 truncated".into()))?;
    *pos += 4;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn read_bytes(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = read_varint(bytes, pos)? as usize;
    let slice = bytes
        .get(*pos..*pos + len)
        .ok_or_else(|| EcsError::DecodeError("byte payload truncated".into()))?;
    *pos += len;
    Ok(slice.to_vec())
}

fn write_rel(out: &mut Vec<u8>, rel: Option<RelPair>) {
    match rel {
        Some(RelPair { rel_id, object }) => {
            out.push(1);
            write_varint(out, rel_id as u64);
            write_u32(out, object.raw());
        }
        None => out.push(0),
    }
}

fn read_rel(bytes: &[u8], pos: &mut usize) -> Result<Option<RelPair>> {
    let &tag = bytes
        .get(*pos)
        .ok_or_else(|| EcsError::DecodeError("rel tag truncated".into()))?;
    *pos += 1;
    if tag == 0 {
        return Ok(None);
    }
    let rel_id = read_varint(bytes, pos)? as u32;
    let object = EntityId::from_raw(read_u32(bytes, pos)?);
    Ok(Some(RelPair { rel_id, object }))
}

const OP_SPAWN: u8 = 0;
const OP_DESPAWN: u8 = 1;
const OP_SET: u8 = 2;
const OP_REMOVE: u8 = 3;

fn write_op(out: &mut Vec<u8>, op: &ReplicationOp) {
    match op {
        ReplicationOp::Spawn { entity, causal_key, components } => {
            out.push(OP_SPAWN);
            write_u32(out, entity.raw());
            write_u32(out, *causal_key);
            write_varint(out, components.len() as u64);
            for c in components {
                write_varint(out, c.component.0 as u64);
                write_rel(out, c.rel);
                write_bytes(out, &c.payload);
            }
        }
        ReplicationOp::Despawn { entity } => {
            out.push(OP_DESPAWN);
            write_u32(out, entity.raw());
        }
        ReplicationOp::Set { entity, component, version, rel, payload } => {
            out.push(OP_SET);
            write_u32(out, entity.raw());
            write_varint(out, component.0 as u64);
            write_varint(out, *version as u64);
            write_rel(out, *rel);
            write_bytes(out, payload);
        }
        ReplicationOp::Remove { entity, component } => {
            out.push(OP_REMOVE);
            write_u32(out, entity.raw());
            write_varint(out, component.0 as u64);
        }
    }
}

fn read_op(bytes: &[u8], pos: &mut usize) -> Result<ReplicationOp> {
    let &tag = bytes
        .get(*pos)
        .ok_or_else(|| EcsError::DecodeError("op tag truncated".into()))?;
    *pos += 1;
    match tag {
        OP_SPAWN => {
            let entity = EntityId::from_raw(read_u32(bytes, pos)?);
            let causal_key = read_u32(bytes, pos)?;
            let count = read_varint(bytes, pos)? as usize;
            let mut components = Vec::with_capacity(count);
            for _ in 0..count {
                let component = ComponentId(read_varint(bytes, pos)? as u32);
                let rel = read_rel(bytes, pos)?;
                let payload = read_bytes(bytes, pos)?;
                components.push(SpawnComponent { component, rel, version: 0, payload });
            }
            Ok(ReplicationOp::Spawn { entity, causal_key, components })
        }
        OP_DESPAWN => {
            let entity = EntityId::from_raw(read_u32(bytes, pos)?);
            Ok(ReplicationOp::Despawn { entity })
        }
        OP_SET => {
            let entity = EntityId::from_raw(read_u32(bytes, pos)?);
            let component = ComponentId(read_varint(bytes, pos)? as u32);
            let version = read_varint(bytes, pos)? as u32;
            let rel = read_rel(bytes, pos)?;
            let payload = read_bytes(bytes, pos)?;
            Ok(ReplicationOp::Set { entity, component, version, rel, payload })
        }
        OP_REMOVE => {
            let entity = EntityId::from_raw(read_u32(bytes, pos)?);
            let component = ComponentId(read_varint(bytes, pos)? as u32);
            Ok(ReplicationOp::Remove { entity, component })
        }
        other => Err(EcsError::DecodeError(format!("unknown op tag {other}"))),
    }
}

/// Encode `tx` as a `Transaction(3)` message: tag byte, varint tick, then the
/// `domainId, seq, opCount` header and each op (spec §6).
pub fn encode_transaction(tx: &Transaction) -> Vec<u8> {
    let mut out = vec![MessageType::Transaction as u8];
    write_varint(&mut out, tx.tick as u64);
    write_varint(&mut out, tx.domain_id as u64);
    write_varint(&mut out, tx.seq as u64);
    write_varint(&mut out, tx.ops.len() as u64);
    for op in &tx.ops {
        write_op(&mut out, op);
    }
    out
}

/// Decode a `Transaction(3)` message produced by [`encode_transaction`].
pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction> {
    let mut pos = 0usize;
    let tag = *bytes
        .first()
        .ok_or_else(|| EcsError::DecodeError("empty message".into()))?;
    if MessageType::from_byte(tag) != Some(MessageType::Transaction) {
        return Err(EcsError::DecodeError(format!("expected Transaction tag, got {tag}")));
    }
    pos += 1;
    let tick = read_varint(bytes, &mut pos)? as u32;
    let domain_id = read_varint(bytes, &mut pos)? as u16;
    let seq = read_varint(bytes, &mut pos)? as u32;
    let op_count = read_varint(bytes, &mut pos)? as usize;
    let mut ops = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        ops.push(read_op(bytes, &mut pos)?);
    }
    Ok(Transaction { domain_id, seq, tick, ops })
}

/// Timestamps for clock-offset estimation (spec §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSync {
    pub t0: f64,
    pub t1: f64,
    pub t2: f64,
}

pub fn encode_clock_sync(tick: u32, sync: ClockSync) -> Vec<u8> {
    let mut out = vec![MessageType::ClockSync as u8];
    write_varint(&mut out, tick as u64);
    out.extend_from_slice(&sync.t0.to_le_bytes());
    out.extend_from_slice(&sync.t1.to_le_bytes());
    out.extend_from_slice(&sync.t2.to_le_bytes());
    out
}

pub fn decode_clock_sync(bytes: &[u8]) -> Result<(u32, ClockSync)> {
    let mut pos = 0usize;
    let tag = *bytes
        .first()
        .ok_or_else(|| EcsError::DecodeError("empty message".into()))?;
    if MessageType::from_byte(tag) != Some(MessageType::ClockSync) {
        return Err(EcsError::DecodeError(format!("expected ClockSync tag, got {tag}")));
    }
    pos += 1;
    let tick = read_varint(bytes, &mut pos)? as u32;
    let read_f64 = |bytes: &[u8], pos: &mut usize| -> Result<f64> {
        let slice = bytes
            .get(*pos..*pos + 8)
            .ok_or_else(|| EcsError::DecodeError("f64 truncated".into()))?;
        *pos += 8;
        Ok(f64::from_le_bytes(slice.try_into().unwrap()))
    };
    let t0 = read_f64(bytes, &mut pos)?;
    let t1 = read_f64(bytes, &mut pos)?;
    let t2 = read_f64(bytes, &mut pos)?;
    Ok((tick, ClockSync { t0, t1, t2 }))
}

/// One `componentId, count, entities[count], data[count]` block of a
/// Snapshot message.
struct SnapshotBlock {
    component: ComponentId,
    entities: Vec<EntityId>,
    data: Vec<u8>,
}

/// Build a Snapshot(4) message from every fixed-width, non-tag component
/// currently present in `world`. Variable-width (JSON-backed) components and
/// tags have no place in the column-major fixed-stride layout the spec
/// defines for Snapshot and are carried by Transaction ops instead.
pub fn encode_snapshot(world: &World) -> Vec<u8> {
    let mut blocks = Vec::new();
    for id in world.store().iter_ids() {
        let Some(desc) = world.components().resolve(id) else {
            continue;
        };
        let Some(stride) = desc.bytes_per_element() else {
            continue;
        };
        let Some(col) = world.store().column(id) else {
            continue;
        };
        let Some(serde) = &desc.serde else {
            continue;
        };
        let mut entities = Vec::new();
        let mut data = Vec::new();
        for entity in world.graph().all_entities() {
            let Some(row) = world.entity_index().index_of(entity) else {
                continue;
            };
            if !col.has_value(row as usize) {
                continue;
            }
            let before = data.len();
            if col.encode_row(row as usize, serde.as_ref(), &mut data).is_err() {
                data.truncate(before);
                continue;
            }
            debug_assert_eq!(data.len() - before, stride);
            entities.push(entity);
        }
        if !entities.is_empty() {
            blocks.push(SnapshotBlock { component: id, entities, data });
        }
    }

    let mut out = vec![MessageType::Snapshot as u8];
    write_varint(&mut out, world.tick() as u64);
    write_varint(&mut out, blocks.len() as u64);
    for block in blocks {
        write_varint(&mut out, block.component.0 as u64);
        write_varint(&mut out, block.entities.len() as u64);
        for e in &block.entities {
            write_u32(&mut out, e.raw());
        }
        out.extend_from_slice(&block.data);
    }
    out
}

/// Apply an incoming Snapshot(4) message to `world`, writing every block's
/// values through [`World::apply_remote_set`] (last-writer-wins against each
/// entity's current stored version).
///
/// A block for a component with no locally known fixed width can't be
/// skipped over — the format carries no explicit byte length per block, only
/// a count of fixed-stride elements — so an unresolvable component id fails
/// the whole message rather than silently misreading the rest of the stream.
pub fn apply_snapshot(world: &mut World, bytes: &[u8]) -> Result<()> {
    let mut pos = 0usize;
    let tag = *bytes
        .first()
        .ok_or_else(|| EcsError::DecodeError("empty message".into()))?;
    if MessageType::from_byte(tag) != Some(MessageType::Snapshot) {
        return Err(EcsError::DecodeError(format!("expected Snapshot tag, got {tag}")));
    }
    pos += 1;
    let tick = read_varint(bytes, &mut pos)? as u32;
    let block_count = read_varint(bytes, &mut pos)? as usize;
    for _ in 0..block_count {
        let component = ComponentId(read_varint(bytes, &mut pos)? as u32);
        let count = read_varint(bytes, &mut pos)? as usize;
        let mut entities = Vec::with_capacity(count);
        for _ in 0..count {
            entities.push(EntityId::from_raw(read_u32(bytes, &mut pos)?));
        }
        let stride = world
            .components()
            .resolve(component)
            .and_then(|d| d.bytes_per_element());
        let Some(stride) = stride else {
            #[cfg(feature = "profiling")]
            warn!(component = component.0, "snapshot block for unresolvable component, aborting decode");
            return Err(EcsError::DecodeError(format!(
                "component {} has no known fixed width, cannot locate the next block",
                component.0
            )));
        };
        for (i, &entity) in entities.iter().enumerate() {
            let start = pos + i * stride;
            let slice = bytes
                .get(start..start + stride)
                .ok_or_else(|| EcsError::DecodeError("snapshot block truncated".into()))?;
            if world.is_alive(entity) {
                world.apply_remote_set(entity, component, slice.to_vec(), tick);
            }
        }
        pos += count * stride;
    }
    Ok(())
}

/// Apply every op in `tx` to `world`. Spawn re-points a matching local
/// transient (via [`World::promote_entity`]) or, if none is predicted,
/// materializes the entity fresh at its authoritative id; relation-carrying
/// components route through [`World::add_relation_raw`] /
/// [`World::remove_relation_raw`], everything else through
/// [`World::apply_remote_set`].
pub fn apply_transaction(world: &mut World, tx: &Transaction) {
    for op in &tx.ops {
        match op {
            ReplicationOp::Spawn { entity, causal_key, components } => {
                world.promote_entity(*causal_key, *entity);
                if !world.is_alive(*entity) {
                    world.respawn_raw(*entity);
                }
                for c in components {
                    match c.rel {
                        Some(RelPair { rel_id, object }) => {
                            world.add_relation_raw(*entity, rel_id, object);
                        }
                        None => {
                            world.apply_remote_set(*entity, c.component, c.payload.clone(), tx.tick);
                        }
                    }
                }
            }
            ReplicationOp::Despawn { entity } => {
                world.despawn(*entity);
            }
            ReplicationOp::Set { entity, component, version, rel, payload } => {
                match rel {
                    Some(RelPair { rel_id, object }) => world.add_relation_raw(*entity, *rel_id, *object),
                    None => world.apply_remote_set(*entity, *component, payload.clone(), *version),
                }
            }
            ReplicationOp::Remove { entity, component } => {
                if component.is_virtual() {
                    if let Some((rel_id, object)) = world.relations().resolve_virtual_id(component.0) {
                        world.remove_relation_raw(*entity, rel_id, object);
                    }
                } else {
                    world.remove_component_raw(*entity, *component);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldConfig;

    #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize, speedy::Writable, speedy::Readable)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[test]
    fn transaction_roundtrips_through_wire_bytes() {
        let mut w = World::new(WorldConfig::default());
        let e = w.spawn((Position { x: 1.0, y: 2.0 }, crate::world::Replicated));
        let tx = w.commit().unwrap();

        let bytes = encode_transaction(&tx);
        let decoded = decode_transaction(&bytes).unwrap();
        assert_eq!(decoded.domain_id, tx.domain_id);
        assert_eq!(decoded.tick, tx.tick);
        assert_eq!(decoded.ops.len(), 1);
        match &decoded.ops[0] {
            ReplicationOp::Spawn { entity, components, .. } => {
                assert_eq!(*entity, e);
                assert!(!components.is_empty());
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[test]
    fn applying_a_spawn_transaction_materializes_the_entity_on_the_receiver() {
        let mut sender = World::new(WorldConfig::default());
        let e = sender.spawn((Position { x: 3.0, y: 4.0 }, crate::world::Replicated));
        let tx = sender.commit().unwrap();

        let mut receiver = World::new(WorldConfig {
            domain_id: 1,
            authoritative: false,
            ..WorldConfig::default()
        });
        receiver.register_fixed::<Position>().unwrap();
        apply_transaction(&mut receiver, &tx);

        assert!(receiver.is_alive(e));
        assert_eq!(receiver.get_component::<Position>(e), Some(&Position { x: 3.0, y: 4.0 }));
    }

    #[test]
    fn clock_sync_roundtrips() {
        let bytes = encode_clock_sync(7, ClockSync { t0: 1.0, t1: 2.5, t2: 3.25 });
        let (tick, sync) = decode_clock_sync(&bytes).unwrap();
        assert_eq!(tick, 7);
        assert_eq!(sync, ClockSync { t0: 1.0, t1: 2.5, t2: 3.25 });
    }

    #[test]
    fn snapshot_roundtrips_fixed_width_component() {
        let mut w = World::new(WorldConfig::default());
        w.register_fixed::<Position>().unwrap();
        let e = w.spawn(Position { x: 9.0, y: 9.0 });
        let bytes = encode_snapshot(&w);

        let mut receiver = World::new(WorldConfig::default());
        receiver.register_fixed::<Position>().unwrap();
        // Same domain and spawn order as `w`, so this lands on the same id.
        let e2 = receiver.spawn(());
        assert_eq!(e2, e);

        apply_snapshot(&mut receiver, &bytes).unwrap();
        assert_eq!(receiver.get_component::<Position>(e2), Some(&Position { x: 9.0, y: 9.0 }));
    }
}
