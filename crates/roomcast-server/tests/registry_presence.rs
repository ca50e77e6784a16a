//! Membership and presence tests through the dispatcher.
//!
//! Signals go through `Hub::dispatch` exactly as the transport delivers
//! them; each peer is the outbound queue a socket writer would drain.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use proptest::prelude::*;
use roomcast_harness::{SimEnv, TestPeer};
use roomcast_proto::{ConnectionId, Event, PresenceStatus, RoomId, Signal, Timestamp, UserId};
use roomcast_server::{
    ConnectionRegistry, Hub, MemoryAggregates, MemoryStore, ServerConfig, StaticDirectory,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

type TestHub = Hub<SimEnv, MemoryStore>;

fn hub() -> Arc<TestHub> {
    let directory: StaticDirectory =
        [("alice".to_string(), ALICE), ("bob".to_string(), BOB)].into_iter().collect();
    Arc::new(Hub::new(
        SimEnv::new(),
        MemoryStore::new(),
        Arc::new(directory),
        Arc::new(MemoryAggregates::new()),
        ServerConfig::default(),
    ))
}

async fn login(hub: &TestHub, token: &str, capacity: usize) -> TestPeer {
    let (tx, rx) = mpsc::channel(capacity);
    let id = hub.connect(tx).unwrap();
    hub.dispatch(id, Signal::Authenticate { token: token.to_string() }).await;
    TestPeer::new(id, rx)
}

async fn join(hub: &TestHub, peer: &TestPeer, room: &str) {
    hub.dispatch(peer.id(), Signal::Join { room_id: RoomId::new(room) }).await;
}

fn joined(user: UserId, room: &str) -> impl Fn(&Event) -> bool {
    let room = RoomId::new(room);
    move |e| matches!(e, Event::RoomJoined { user_id, room_id } if *user_id == user && *room_id == room)
}

fn left(user: UserId, room: &str) -> impl Fn(&Event) -> bool {
    let room = RoomId::new(room);
    move |e| matches!(e, Event::RoomLeft { user_id, room_id } if *user_id == user && *room_id == room)
}

#[tokio::test(start_paused = true)]
async fn double_join_single_leave_unsubscribes() {
    let hub = hub();
    let mut alice = login(&hub, "alice", 64).await;
    let mut bob = login(&hub, "bob", 64).await;
    join(&hub, &bob, "lobby").await;
    bob.drain();

    join(&hub, &alice, "lobby").await;
    join(&hub, &alice, "lobby").await;
    let acks = alice.count(|e| matches!(e, Event::JoinAck { .. }));
    assert_eq!(acks, 2);
    assert_eq!(bob.count(joined(ALICE, "lobby")), 1);

    hub.dispatch(alice.id(), Signal::Leave { room_id: RoomId::new("lobby") }).await;

    assert!(!hub.registry().room_members(&RoomId::new("lobby")).contains(&alice.id()));
    assert_eq!(bob.count(left(ALICE, "lobby")), 1);

    // Leaving again is acknowledged but announces nothing
    hub.dispatch(alice.id(), Signal::Leave { room_id: RoomId::new("lobby") }).await;
    assert_eq!(alice.count(|e| matches!(e, Event::LeaveAck { .. })), 2);
    assert!(bob.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_announces_departure_once_per_room() {
    let hub = hub();
    let alice = login(&hub, "alice", 64).await;
    let mut bob = login(&hub, "bob", 64).await;
    for room in ["a", "b", "c"] {
        join(&hub, &bob, room).await;
        join(&hub, &alice, room).await;
    }
    bob.drain();

    hub.disconnect(alice.id());
    hub.disconnect(alice.id());

    let events = bob.drain();
    for room in ["a", "b", "c"] {
        assert_eq!(events.iter().filter(|e| left(ALICE, room)(e)).count(), 1, "room {room}");
    }
    assert_eq!(events.len(), 3);
    assert!(!hub.registry().is_registered(alice.id()));
    assert_eq!(hub.health().connected_identities, 1);
}

#[tokio::test(start_paused = true)]
async fn typing_burst_announces_start_and_one_expiry() {
    let hub = hub();
    let alice = login(&hub, "alice", 64).await;
    let mut bob = login(&hub, "bob", 64).await;
    join(&hub, &bob, "lobby").await;
    join(&hub, &alice, "lobby").await;
    bob.drain();

    for _ in 0..10 {
        hub.dispatch(alice.id(), Signal::TypingStart { room_id: RoomId::new("lobby") }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(bob.drain(), vec![Event::Typing { user_id: ALICE, room_id: RoomId::new("lobby") }]);

    // Expiry is measured from the last refresh
    tokio::time::sleep(Duration::from_millis(5_800)).await;
    assert!(bob.drain().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        bob.drain(),
        vec![Event::StoppedTyping { user_id: ALICE, room_id: RoomId::new("lobby") }]
    );
    assert_eq!(hub.presence().typing_count(), 0);
    assert_eq!(hub.presence().armed_timers(), 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(bob.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn identity_stays_present_while_any_connection_remains() {
    let hub = hub();
    let mut bob = login(&hub, "bob", 64).await;
    join(&hub, &bob, "lobby").await;
    let laptop = login(&hub, "alice", 64).await;
    let phone = login(&hub, "alice", 64).await;
    join(&hub, &laptop, "lobby").await;
    join(&hub, &phone, "lobby").await;

    assert_eq!(bob.count(joined(ALICE, "lobby")), 1);
    assert_eq!(hub.registry().connections_of(ALICE).len(), 2);

    hub.disconnect(laptop.id());
    assert_eq!(bob.count(left(ALICE, "lobby")), 0);
    let record = hub.presence().record(&RoomId::new("lobby"), ALICE).unwrap();
    assert_eq!(record.status, PresenceStatus::Online);

    hub.disconnect(phone.id());
    assert_eq!(bob.count(left(ALICE, "lobby")), 1);
    assert!(hub.presence().record(&RoomId::new("lobby"), ALICE).is_none());
}

#[tokio::test(start_paused = true)]
async fn presence_change_reaches_every_joined_room() {
    let hub = hub();
    let mut alice = login(&hub, "alice", 64).await;
    let mut bob = login(&hub, "bob", 64).await;
    for room in ["a", "b"] {
        join(&hub, &alice, room).await;
        join(&hub, &bob, room).await;
    }
    alice.drain();

    hub.dispatch(bob.id(), Signal::Presence { status: PresenceStatus::Away }).await;
    hub.dispatch(bob.id(), Signal::Presence { status: PresenceStatus::Away }).await;

    // One change per room, the repeat is a no-op. The changer hears it too.
    let away = |e: &Event| {
        matches!(e, Event::PresenceChanged { user_id, status: PresenceStatus::Away, .. } if *user_id == BOB)
    };
    assert_eq!(alice.count(away), 2);
    assert_eq!(bob.count(away), 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_connection_is_reaped() {
    let hub = hub();
    let shutdown = CancellationToken::new();
    let reaper = hub.spawn_reaper(shutdown.clone()).unwrap();
    assert!(hub.spawn_reaper(shutdown.clone()).is_none());

    let mut alice = login(&hub, "alice", 64).await;
    join(&hub, &alice, "lobby").await;
    // connected, authenticated, joinAck, then one message of headroom
    let stalled = login(&hub, "bob", 4).await;
    join(&hub, &stalled, "lobby").await;
    alice.drain();

    for i in 0..3 {
        let content = format!("flood {i}");
        let signal =
            Signal::SendMessage { room_id: RoomId::new("lobby"), content, kind: "text".into() };
        hub.dispatch(alice.id(), signal).await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(!hub.registry().is_registered(stalled.id()));
    assert_eq!(alice.count(left(BOB, "lobby")), 1);
    assert_eq!(hub.registry().room_members(&RoomId::new("lobby")), vec![alice.id()]);

    shutdown.cancel();
    reaper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn health_counts_connections_identities_and_rooms() {
    let hub = hub();
    let alice = login(&hub, "alice", 64).await;
    let _phone = login(&hub, "alice", 64).await;
    let (tx, _anon) = mpsc::channel(8);
    hub.connect(tx).unwrap();
    join(&hub, &alice, "lobby").await;
    join(&hub, &alice, "ops").await;
    hub.dispatch(alice.id(), Signal::TypingStart { room_id: RoomId::new("ops") }).await;

    let health = hub.health();

    assert_eq!(health.total_connections, 3);
    assert_eq!(health.connected_identities, 1);
    assert_eq!(health.active_rooms, 2);
    assert_eq!(health.typing_records, 1);
}

#[test]
fn concurrent_connects_never_exceed_limit() {
    const LIMIT: usize = 4;
    const CLIENTS: usize = 16;

    for _ in 0..20 {
        let config = ServerConfig { max_connections: LIMIT, ..ServerConfig::default() };
        let hub: TestHub = Hub::new(
            SimEnv::new(),
            MemoryStore::new(),
            Arc::new(StaticDirectory::new()),
            Arc::new(MemoryAggregates::new()),
            config,
        );
        let barrier = Barrier::new(CLIENTS);

        let (hub, barrier) = (&hub, &barrier);
        let admitted: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CLIENTS)
                .map(|_| {
                    scope.spawn(move || {
                        let (tx, rx) = mpsc::channel(4);
                        barrier.wait();
                        hub.connect(tx).ok().map(|id| (id, rx))
                    })
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(admitted.len(), LIMIT);
        assert_eq!(hub.registry().connection_count(), LIMIT);

        // A freed slot admits exactly one more
        hub.disconnect(admitted[0].0);
        let (tx, _rx) = mpsc::channel(4);
        assert!(hub.connect(tx.clone()).is_ok());
        assert!(hub.connect(tx).is_err());
    }
}

#[derive(Debug, Clone)]
enum MembershipOp {
    Join(u64, u8),
    Leave(u64, u8),
    Disconnect(u64),
}

fn membership_op() -> impl Strategy<Value = MembershipOp> {
    prop_oneof![
        3 => (0u64..4, 0u8..3).prop_map(|(c, r)| MembershipOp::Join(c, r)),
        2 => (0u64..4, 0u8..3).prop_map(|(c, r)| MembershipOp::Leave(c, r)),
        1 => (0u64..4).prop_map(MembershipOp::Disconnect),
    ]
}

fn room_name(index: u8) -> RoomId {
    RoomId::new(format!("room-{index}"))
}

#[test]
fn prop_registry_membership_matches_model() {
    proptest!(|(ops in prop::collection::vec(membership_op(), 1..80))| {
        let registry = ConnectionRegistry::new();
        let mut model: HashMap<u64, BTreeSet<u8>> = HashMap::new();
        let mut peers = Vec::new();
        for c in 0..4u64 {
            let (tx, peer) = TestPeer::channel(ConnectionId(c), 8);
            registry.register(ConnectionId(c), Some(UserId(c % 2)), tx, Timestamp::EPOCH);
            model.insert(c, BTreeSet::new());
            peers.push(peer);
        }

        for op in &ops {
            match *op {
                MembershipOp::Join(c, r) => {
                    let result = registry.join(ConnectionId(c), &room_name(r));
                    match model.get_mut(&c) {
                        Some(rooms) => {
                            let outcome = result.unwrap();
                            prop_assert_eq!(outcome.added, rooms.insert(r));
                        },
                        None => prop_assert!(result.is_err()),
                    }
                },
                MembershipOp::Leave(c, r) => {
                    let outcome = registry.leave(ConnectionId(c), &room_name(r));
                    let expected = model.get_mut(&c).is_some_and(|rooms| rooms.remove(&r));
                    prop_assert_eq!(outcome.removed, expected);
                },
                MembershipOp::Disconnect(c) => {
                    let removed = registry.unregister(ConnectionId(c));
                    prop_assert_eq!(removed.is_some(), model.remove(&c).is_some());
                },
            }

            // ORACLE: both indexes agree with the model after every step
            for r in 0..3u8 {
                let mut members = registry.room_members(&room_name(r));
                members.sort();
                let expected: Vec<ConnectionId> = model
                    .iter()
                    .filter(|(_, rooms)| rooms.contains(&r))
                    .map(|(c, _)| ConnectionId(*c))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                prop_assert_eq!(members, expected);
            }
            for (c, rooms) in &model {
                let mut actual: Vec<RoomId> = registry.rooms_of(ConnectionId(*c));
                actual.sort();
                let expected: Vec<RoomId> = rooms.iter().map(|r| room_name(*r)).collect();
                prop_assert_eq!(actual, expected);
            }
            let occupied = (0..3u8).filter(|r| model.values().any(|rooms| rooms.contains(r))).count();
            prop_assert_eq!(registry.room_count(), occupied);
            prop_assert_eq!(registry.connection_count(), model.len());
        }
    });
}
