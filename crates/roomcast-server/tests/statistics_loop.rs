//! Statistics broadcast loop tests on a paused clock.

use std::{sync::Arc, time::Duration};

use roomcast_harness::{SimEnv, TestPeer};
use roomcast_proto::{ConnectionId, Event, StatisticsSnapshot, Timestamp, UserId};
use roomcast_server::{
    Broadcaster, ConnectionRegistry, MemoryAggregates, RegistryAggregates, StatisticsLoop,
};
use tokio_util::sync::CancellationToken;

fn snapshots(peer: &mut TestPeer) -> Vec<StatisticsSnapshot> {
    peer.drain()
        .into_iter()
        .filter_map(|e| match e {
            Event::StatisticsUpdated { statistics } => Some(statistics),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn failed_tick_keeps_previous_snapshot_and_loop_survives() {
    let registry = Arc::new(ConnectionRegistry::new());
    let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 16);
    registry.register(ConnectionId(1), None, tx, Timestamp::EPOCH);
    let counters = MemoryAggregates::new();
    counters.set(3, 10, 20, 1);
    let stats = StatisticsLoop::new(
        SimEnv::new(),
        Arc::new(counters.clone()),
        Broadcaster::new(Arc::clone(&registry)),
        Duration::from_secs(30),
    );
    let shutdown = CancellationToken::new();
    let ticker = stats.spawn(shutdown.clone());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let first = snapshots(&mut peer);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].completed_tasks, 20);

    counters.set_unavailable(true);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(snapshots(&mut peer).is_empty());
    assert_eq!(stats.current(), first[0]);

    counters.set_unavailable(false);
    counters.record_task();
    tokio::time::sleep(Duration::from_secs(30)).await;
    let third = snapshots(&mut peer);
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].completed_tasks, 21);
    assert!(third[0].computed_at > first[0].computed_at);

    shutdown.cancel();
    ticker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn active_users_follow_connected_identities() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut peers = Vec::new();
    for (id, user) in [(1, Some(7)), (2, Some(7)), (3, Some(8)), (4, None)] {
        let (tx, peer) = TestPeer::channel(ConnectionId(id), 16);
        registry.register(ConnectionId(id), user.map(UserId), tx, Timestamp::EPOCH);
        peers.push(peer);
    }
    let counters = MemoryAggregates::new();
    counters.record_session();
    counters.record_achievement();
    let stats = StatisticsLoop::new(
        SimEnv::new(),
        Arc::new(RegistryAggregates::new(Arc::clone(&registry), counters)),
        Broadcaster::new(Arc::clone(&registry)),
        Duration::from_secs(30),
    );

    let snapshot = stats.refresh_now().await.unwrap();

    assert_eq!(snapshot.active_users, 2);
    assert_eq!(snapshot.completed_sessions, 1);
    assert_eq!(snapshot.achievements, 1);
    // Anonymous connections receive the broadcast as well
    for peer in &mut peers {
        assert_eq!(snapshots(peer), vec![snapshot.clone()]);
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_ticking() {
    let registry = Arc::new(ConnectionRegistry::new());
    let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 16);
    registry.register(ConnectionId(1), None, tx, Timestamp::EPOCH);
    let stats = StatisticsLoop::new(
        SimEnv::new(),
        Arc::new(MemoryAggregates::new()),
        Broadcaster::new(registry),
        Duration::from_secs(30),
    );
    let shutdown = CancellationToken::new();
    let ticker = stats.spawn(shutdown.clone());

    tokio::time::sleep(Duration::from_secs(10)).await;
    shutdown.cancel();
    ticker.await.unwrap();
    assert_eq!(snapshots(&mut peer).len(), 1);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(snapshots(&mut peer).is_empty());
}

#[tokio::test(start_paused = true)]
async fn first_snapshot_is_computed_on_start() {
    let registry = Arc::new(ConnectionRegistry::new());
    let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 16);
    registry.register(ConnectionId(1), None, tx, Timestamp::EPOCH);
    let counters = MemoryAggregates::new();
    counters.set(0, 4, 5, 6);
    let stats = StatisticsLoop::new(
        SimEnv::new(),
        Arc::new(counters),
        Broadcaster::new(registry),
        Duration::from_secs(30),
    );
    assert_eq!(stats.current().computed_at, None);
    let shutdown = CancellationToken::new();

    let ticker = stats.spawn(shutdown.clone());
    tokio::time::sleep(Duration::from_millis(1)).await;

    let current = stats.current();
    assert!(current.computed_at.is_some());
    assert_eq!(current.completed_sessions, 4);
    assert_eq!(snapshots(&mut peer), vec![current]);

    shutdown.cancel();
    ticker.await.unwrap();
}
