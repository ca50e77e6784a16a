//! Client end of a connection's outbound queue.

use roomcast_proto::{ConnectionId, Event, Outbound};
use tokio::sync::mpsc;

/// Receives what the server queued for one connection.
///
/// Stands in for the WebSocket writer task: tests register the sender half
/// with the server and inspect delivered events here.
pub struct TestPeer {
    id: ConnectionId,
    rx: mpsc::Receiver<Outbound>,
}

impl TestPeer {
    /// Wrap an existing receiver.
    pub fn new(id: ConnectionId, rx: mpsc::Receiver<Outbound>) -> Self {
        Self { id, rx }
    }

    /// Fresh queue of `capacity` events, returning the sender half to
    /// register with the server.
    pub fn channel(id: ConnectionId, capacity: usize) -> (mpsc::Sender<Outbound>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(id, rx))
    }

    /// Connection this peer listens on.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(Event::clone(&event));
        }
        events
    }

    /// Wait for the next event. `None` once the server dropped the queue.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await.map(|event| Event::clone(&event))
    }

    /// Number of queued events matching `predicate`, consuming the queue.
    pub fn count(&mut self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.drain().iter().filter(|e| predicate(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use roomcast_proto::Timestamp;

    use super::*;

    #[tokio::test]
    async fn drain_preserves_order() {
        let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 8);
        for millis in [1, 2, 3] {
            tx.send(Arc::new(Event::Pong { timestamp: Timestamp::from_millis(millis) }))
                .await
                .unwrap();
        }

        let stamps: Vec<_> = peer
            .drain()
            .into_iter()
            .map(|e| match e {
                Event::Pong { timestamp } => timestamp.as_millis(),
                _ => 0,
            })
            .collect();

        assert_eq!(stamps, vec![1, 2, 3]);
        assert!(peer.drain().is_empty());
    }

    #[tokio::test]
    async fn recv_ends_when_sender_dropped() {
        let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 1);
        drop(tx);
        assert!(peer.recv().await.is_none());
    }
}
