//! End-to-end scenarios spanning relations, monitors, rollback and wire
//! replication, exercised the way a consumer of the crate would: through
//! `World`, `QueryState`/`MonitorState`, `HistoryBuffer` and the `wire`
//! module only, no internal access.

use orbit_ecs::entity::EntityId;
use orbit_ecs::query::{Entity, Has, MonitorState, QueryState, Read, Related};
use orbit_ecs::transaction::{ReplicationOp, SpawnComponent, Transaction};
use orbit_ecs::wire;
use orbit_ecs::world::{Replicated, World, WorldConfig};
use orbit_ecs::history::HistoryBuffer;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Name(String);

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct ChildOf;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct Attacking;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct EmitsFrom;

fn new_world() -> World {
    World::new(WorldConfig::default())
}

/// Parent-child relation join: an inner join against `Related<ChildOf, Read<Position>>`
/// stops matching a child the moment its parent's `Position` is removed, since a
/// relation query with no satisfying object is a miss, not a match with an empty item.
#[test]
fn parent_child_relation_join_misses_once_parent_loses_position() {
    let mut w = new_world();
    w.register_relation::<ChildOf>().unwrap();
    w.register_value::<Position>().unwrap();

    let parent = w.spawn(Position { x: 1.0, y: 2.0 });
    let child = w.spawn(());
    w.add_relation::<ChildOf>(child, parent);

    let q = QueryState::<(Entity, Related<ChildOf, Read<Position>>)>::new(&mut w);
    let results: Vec<_> = q.iter(&w).collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, child);
    assert_eq!(results[0].1.x, 1.0);

    w.remove_component::<Position>(parent);
    w.flush_deletions();

    let results: Vec<_> = q.iter(&w).collect();
    assert!(results.is_empty(), "child should no longer join once its parent has no Position");
}

/// A subject related to several objects yields one tuple per related object, not one
/// tuple folding every object into a list: `{child, a}` and `{child, b}` as two rows.
#[test]
fn multi_object_relation_yields_every_related_object() {
    let mut w = new_world();
    w.register_relation::<ChildOf>().unwrap();
    w.register_value::<Name>().unwrap();

    let parent_a = w.spawn(Name("a".into()));
    let parent_b = w.spawn(Name("b".into()));
    let child = w.spawn(());
    w.add_relation::<ChildOf>(child, parent_a);
    w.add_relation::<ChildOf>(child, parent_b);

    let q = QueryState::<(Entity, Related<ChildOf, Read<Name>>)>::new(&mut w);
    let results: Vec<_> = q.iter(&w).collect();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(e, _)| *e == child));
    let mut names: Vec<_> = results.iter().map(|(_, n)| n.0.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}

/// Rolling back to an earlier tick via `HistoryBuffer` restores component values,
/// relation edges, and the tick counter to their state at that boundary.
#[test]
fn rollback_to_prior_tick_restores_relation_and_component_state() {
    let mut w = World::new(WorldConfig {
        history_enabled: true,
        checkpoint_interval: 1,
        ..WorldConfig::default()
    });
    w.register_relation::<ChildOf>().unwrap();
    let mut history = HistoryBuffer::new(8, 1);
    history.record_tick(&mut w); // tick 0

    let parent = w.spawn(Position { x: 0.0, y: 0.0 });
    let child = w.spawn(());
    w.add_relation::<ChildOf>(child, parent);
    w.flush_deletions();
    w.commit();
    history.record_tick(&mut w); // tick 0 checkpoint overwritten with the spawns

    w.advance_tick();
    w.remove_relation::<ChildOf>(child, parent);
    w.add_component(parent, Position { x: 9.0, y: 9.0 });
    w.flush_deletions();
    w.commit();
    history.record_tick(&mut w); // tick 1

    let rel_id = w.components().id_of::<ChildOf>().unwrap();
    assert!(!w.graph().vec_of(child).unwrap().contains(rel_id.0));
    assert_eq!(w.get_component::<Position>(parent), Some(&Position { x: 9.0, y: 9.0 }));

    history.rollback(&mut w, 0).unwrap();

    assert_eq!(w.tick(), 0);
    assert_eq!(w.get_component::<Position>(parent), Some(&Position { x: 0.0, y: 0.0 }));
    assert!(w.graph().vec_of(child).unwrap().contains(rel_id.0));
    let node_id = w.graph().node_of(child).unwrap();
    assert_eq!(w.graph().node(node_id).objects_of(child, rel_id.0), &[parent]);
}

/// An Out monitor on an entity that also carries a relation still reports the
/// pre-removal value of a plain `Read` term: archetype membership moves as soon as
/// [`World::remove_component`] is called, but the backing column isn't blanked until
/// [`World::flush_deletions`] runs, so a read between the two still sees the old value.
#[test]
fn out_monitor_on_related_entity_reports_value_from_before_removal() {
    let mut w = new_world();
    w.register_relation::<ChildOf>().unwrap();
    w.register_value::<Position>().unwrap();

    let parent = w.spawn(());
    let child = w.spawn(Position { x: 3.0, y: 4.0 });
    w.add_relation::<ChildOf>(child, parent);

    let m = MonitorState::<(Entity, Has<ChildOf>, Read<Position>)>::new(&mut w);
    let added: Vec<_> = m.added(&w).map(|(e, _, _)| e).collect();
    assert_eq!(added, vec![child]);
    m.clear();

    w.remove_component::<Position>(child);

    let removed: Vec<_> = m.removed(&w).collect();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].0, child);
    assert_eq!(*removed[0].2, Position { x: 3.0, y: 4.0 });

    w.flush_deletions();
    assert!(m.removed(&w).next().is_none(), "column is blanked after flush, so the stale read no longer resolves");
}

/// An Out monitor over `Entity` joined via `EmitsFrom` with `Has(Attacking)` never
/// sees `beam` transition at its own anchor node (`beam` never gains or loses
/// `EmitsFrom` here); the removal is upstream, on `player`'s `Attacking` tag. The
/// monitor must propagate that through `objectToSubjects` and report `beam` in
/// `removed` with an undefined (empty) join payload.
#[test]
fn out_monitor_on_related_entity_propagates_upstream_attacking_removal() {
    let mut w = new_world();
    w.register_tag::<Attacking>().unwrap();
    w.register_relation::<EmitsFrom>().unwrap();
    w.register_value::<Position>().unwrap();

    let m = MonitorState::<(Entity, Related<EmitsFrom, Has<Attacking>>)>::new(&mut w);

    let player = w.spawn((Position { x: 0.0, y: 0.0 }, Attacking));
    let beam = w.spawn(Position { x: 1.0, y: 1.0 });
    w.add_relation::<EmitsFrom>(beam, player);

    let added: Vec<_> = m.added(&w).map(|(e, _)| e).collect();
    assert_eq!(added, vec![beam]);
    m.clear();

    w.remove_component::<Attacking>(player);

    let removed: Vec<_> = m.removed(&w).collect();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].0, beam);
    assert!(removed[0].1.is_empty(), "Attacking is gone from player, so the join is undefined");
}

/// A remote write with an older version than what's already stored loses; a later
/// message with a newer version wins, regardless of the order the two messages are
/// decoded and applied in.
#[test]
fn version_based_convergence_ignores_stale_remote_writes() {
    let mut sender = new_world();
    let id = sender.register_value::<Position>().unwrap();
    let e = sender.spawn((Position { x: 0.0, y: 0.0 }, Replicated));
    sender.commit();

    let mut receiver = new_world();
    receiver.register_value::<Position>().unwrap();
    let e2 = receiver.spawn(());
    assert_eq!(e2, e);

    let newer = Transaction {
        domain_id: 0,
        seq: 0,
        tick: 10,
        ops: vec![ReplicationOp::Set {
            entity: e,
            component: id,
            version: 10,
            rel: None,
            payload: encode(&Position { x: 5.0, y: 5.0 }),
        }],
    };
    let stale = Transaction {
        domain_id: 0,
        seq: 1,
        tick: 3,
        ops: vec![ReplicationOp::Set {
            entity: e,
            component: id,
            version: 3,
            rel: None,
            payload: encode(&Position { x: 1.0, y: 1.0 }),
        }],
    };

    // Newer write lands first, stale write arrives after: stale must not clobber it.
    wire::apply_transaction(&mut receiver, &newer);
    wire::apply_transaction(&mut receiver, &stale);
    assert_eq!(receiver.get_component::<Position>(e2), Some(&Position { x: 5.0, y: 5.0 }));
}

fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

/// A client's speculatively-spawned entity (in the transient domain) is rewritten to
/// the authoritative id carried by an incoming `Spawn` transaction whose `causalKey`
/// matches the client's own prediction, and its components land on the promoted id.
#[test]
fn causal_key_promotion_rewrites_predicted_entity_across_the_wire() {
    let mut client = World::new(WorldConfig {
        domain_id: 1,
        authoritative: false,
        history_enabled: true,
        ..WorldConfig::default()
    });
    client.register_value::<Position>().unwrap();
    let predicted = client.spawn((Position { x: 3.0, y: 4.0 }, Replicated));
    assert_eq!(predicted.domain(), orbit_ecs::entity::TRANSIENT_DOMAIN);

    let authoritative_entity = EntityId::pack(0, 7);
    let position_id = client.components().id_of::<Position>().unwrap();
    // `causalKey = intentTick * 2^15 + indexWithinTick`: the client's first replicated
    // spawn this tick, at index 0, so this is the key `World::spawn` assigned it.
    let causal_key = client.tick() * (1 << 15);
    let tx = Transaction {
        domain_id: 0,
        seq: 0,
        tick: client.tick(),
        ops: vec![ReplicationOp::Spawn {
            entity: authoritative_entity,
            causal_key,
            components: vec![SpawnComponent {
                component: position_id,
                rel: None,
                version: 0,
                payload: encode(&Position { x: 3.0, y: 4.0 }),
            }],
        }],
    };

    let bytes = wire::encode_transaction(&tx);
    let decoded = wire::decode_transaction(&bytes).unwrap();
    wire::apply_transaction(&mut client, &decoded);

    assert!(!client.is_alive(predicted));
    assert!(client.is_alive(authoritative_entity));
    assert_eq!(client.get_component::<Position>(authoritative_entity), Some(&Position { x: 3.0, y: 4.0 }));
}

/// `encode_transaction` / `decode_transaction` round-trip to an equal `Transaction`,
/// including a relation-bearing op.
#[test]
fn transaction_wire_roundtrip_is_identity() {
    let mut w = new_world();
    w.register_relation::<ChildOf>().unwrap();
    let parent = w.spawn(());
    let child = w.spawn(());
    let rel_id = w.components().id_of::<ChildOf>().unwrap();
    let built = Transaction {
        domain_id: 0,
        seq: 5,
        tick: 0,
        ops: vec![ReplicationOp::Set {
            entity: child,
            component: orbit_ecs::component::ComponentId(rel_id.0),
            version: 0,
            rel: Some(orbit_ecs::transaction::RelPair { rel_id: rel_id.0, object: parent }),
            payload: Vec::new(),
        }],
    };
    let bytes = wire::encode_transaction(&built);
    let roundtripped = wire::decode_transaction(&bytes).unwrap();
    assert_eq!(roundtripped, built);
}

/// Spawning and despawning the same entity within a single tick nets to zero
/// replication ops: the transaction machinery never ships a phantom entity.
#[test]
fn spawn_then_despawn_same_tick_produces_no_transaction() {
    let mut w = new_world();
    let e = w.spawn((Position { x: 0.0, y: 0.0 }, Replicated));
    w.despawn(e);
    w.flush_deletions();
    assert!(w.commit().is_none());
}

/// `commit` is idempotent when nothing has been buffered since the last call.
#[test]
fn commit_on_empty_pending_ops_is_idempotent() {
    let mut w = new_world();
    w.spawn(Position { x: 0.0, y: 0.0 }); // not replicated, no ops buffered
    assert!(w.commit().is_none());
    assert!(w.commit().is_none());
}
