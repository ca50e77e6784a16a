//! End-to-end tests over a real WebSocket on localhost.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use roomcast_proto::{ErrorCode, Event, RoomId, Signal, UserId};
use roomcast_server::{MemoryAggregates, MemoryStore, Server, ServerConfig};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, protocol::frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

async fn start(max_connections: usize) -> (String, CancellationToken, JoinHandle<()>) {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        max_connections,
        tokens: vec![("alice-secret".to_string(), 1), ("bob-secret".to_string(), 2)],
        ..ServerConfig::default()
    };
    let server = Server::bind(config, MemoryStore::new()).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let shutdown = server.shutdown_token();
    let task = tokio::spawn(async move { server.run().await.unwrap() });
    (url, shutdown, task)
}

async fn send(client: &mut Client, signal: &Signal) {
    client.send(Message::Text(signal.encode().unwrap())).await.unwrap();
}

async fn next_frame_event(client: &mut Client) -> Event {
    loop {
        let frame = tokio::time::timeout(STEP, client.next())
            .await
            .expect("timed out waiting for an event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return Event::decode(&text).unwrap();
        }
    }
}

/// Next event other than the periodic statistics broadcast.
async fn next_event(client: &mut Client) -> Event {
    loop {
        let event = next_frame_event(client).await;
        if !matches!(event, Event::StatisticsUpdated { .. }) {
            return event;
        }
    }
}

async fn open(url: &str, token: &str) -> Client {
    let (mut client, _) = connect_async(url).await.unwrap();
    assert!(matches!(next_event(&mut client).await, Event::Connected { .. }));
    send(&mut client, &Signal::Authenticate { token: token.to_string() }).await;
    assert!(matches!(next_event(&mut client).await, Event::Authenticated { .. }));
    client
}

#[tokio::test]
async fn room_conversation_over_websocket() {
    let (url, shutdown, server) = start(16).await;
    let lobby = RoomId::new("lobby");

    let mut alice = open(&url, "alice-secret").await;
    send(&mut alice, &Signal::Join { room_id: lobby.clone() }).await;
    assert_eq!(next_event(&mut alice).await, Event::JoinAck { room_id: lobby.clone() });

    let mut bob = open(&url, "bob-secret").await;
    send(&mut bob, &Signal::Join { room_id: lobby.clone() }).await;
    assert_eq!(next_event(&mut bob).await, Event::JoinAck { room_id: lobby.clone() });
    assert_eq!(
        next_event(&mut alice).await,
        Event::RoomJoined { user_id: UserId(2), room_id: lobby.clone() }
    );

    let hello = Signal::SendMessage {
        room_id: lobby.clone(),
        content: "hello".to_string(),
        kind: "text".to_string(),
    };
    send(&mut bob, &hello).await;
    let Event::NewMessage { message } = next_event(&mut alice).await else {
        panic!("expected newMessage");
    };
    assert_eq!(message.content, "hello");
    assert_eq!(message.sender_id, UserId(2));
    assert!(!message.is_scheduled);

    bob.close(None).await.unwrap();
    assert_eq!(
        next_event(&mut alice).await,
        Event::RoomLeft { user_id: UserId(2), room_id: lobby }
    );

    shutdown.cancel();
    server.await.unwrap();
}

#[tokio::test]
async fn malformed_frames_are_answered_not_fatal() {
    let (url, shutdown, server) = start(16).await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    assert!(matches!(next_event(&mut client).await, Event::Connected { .. }));

    client.send(Message::Text("{\"type\":\"teleport\"}".to_string())).await.unwrap();
    assert!(matches!(
        next_event(&mut client).await,
        Event::Error { code: ErrorCode::InvalidSignal, .. }
    ));

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert!(matches!(
        next_event(&mut client).await,
        Event::Error { code: ErrorCode::InvalidSignal, .. }
    ));

    send(&mut client, &Signal::Ping).await;
    assert!(matches!(next_event(&mut client).await, Event::Pong { .. }));

    shutdown.cancel();
    server.await.unwrap();
}

#[tokio::test]
async fn connection_limit_closes_with_try_again() {
    let (url, shutdown, server) = start(1).await;
    let _first = open(&url, "alice-secret").await;

    let (mut second, _) = connect_async(url.as_str()).await.unwrap();
    let frame = tokio::time::timeout(STEP, second.next()).await.unwrap();
    match frame {
        Some(Ok(Message::Close(Some(close)))) => assert_eq!(close.code, CloseCode::Again),
        other => panic!("expected close frame, got {other:?}"),
    }

    shutdown.cancel();
    server.await.unwrap();
}

#[tokio::test]
async fn recorded_counters_reach_statistics_broadcast() {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        tokens: vec![("alice-secret".to_string(), 1)],
        ..ServerConfig::default()
    };
    let counters = MemoryAggregates::new();
    let server = Server::bind_with_counters(config, MemoryStore::new(), counters.clone()).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let hub = std::sync::Arc::clone(server.hub());
    let shutdown = server.shutdown_token();
    let task = tokio::spawn(async move { server.run().await.unwrap() });

    let mut alice = open(&url, "alice-secret").await;
    counters.record_session();
    counters.record_task();
    counters.record_task();
    counters.record_achievement();
    let refreshed = hub.statistics().refresh_now().await.unwrap();

    assert_eq!(refreshed.active_users, 1);
    assert_eq!(
        (refreshed.completed_sessions, refreshed.completed_tasks, refreshed.achievements),
        (1, 2, 1)
    );
    loop {
        if let Event::StatisticsUpdated { statistics } = next_frame_event(&mut alice).await {
            if statistics.completed_tasks == 2 {
                assert_eq!(statistics, refreshed);
                break;
            }
        }
    }

    shutdown.cancel();
    task.await.unwrap();
}
