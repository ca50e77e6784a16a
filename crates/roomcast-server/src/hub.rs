//! Signal dispatcher.
//!
//! The [`Hub`] owns every server component and turns one inbound [`Signal`]
//! from one connection into registry, presence, storage and delivery calls.
//! It is transport-agnostic: the WebSocket layer and the tests drive it the
//! same way, through [`Hub::connect`], [`Hub::dispatch`] and
//! [`Hub::disconnect`].
//!
//! # Replies
//!
//! Direct replies (acks, listings, errors) go to the acting connection's
//! outbound queue, the same queue its room broadcasts use, so a client sees
//! `joinAck` before any event of the room it just joined. Failures never
//! close the connection; they come back as `error{code, message}`.

use std::sync::Arc;

use roomcast_core::{DeliveryError, Environment, NewMessage};
use roomcast_proto::{
    ConnectionId, ErrorCode, Event, Outbound, PresenceStatus, ProtocolError, RoomId, Signal,
    Timestamp, UserId,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    ServerError,
    broadcaster::Broadcaster,
    config::ServerConfig,
    directory::{AuthError, UserDirectory},
    presence::PresenceService,
    registry::{ConnectionRegistry, IdentityBinding, Registration},
    scheduler::DeliveryEngine,
    statistics::{AggregateSource, StatisticsLoop},
    storage::MessageStore,
};

/// Point-in-time server load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Distinct identities with at least one connection
    pub connected_identities: usize,
    /// Rooms with at least one member
    pub active_rooms: usize,
    /// Registered connections, anonymous included
    pub total_connections: usize,
    /// Identities currently typing, summed over rooms
    pub typing_records: usize,
}

/// A refused signal, sent back as `error{code, message}`.
#[derive(Debug)]
struct Rejection {
    code: ErrorCode,
    message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<DeliveryError> for Rejection {
    fn from(err: DeliveryError) -> Self {
        Self { code: err.code(), message: err.to_string() }
    }
}

/// Every runtime component behind one dispatcher.
pub struct Hub<E: Environment, S: MessageStore> {
    env: E,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    presence: PresenceService<E>,
    engine: DeliveryEngine<E, S>,
    statistics: StatisticsLoop<E>,
    directory: Arc<dyn UserDirectory>,
    config: ServerConfig,
}

impl<E: Environment, S: MessageStore> Hub<E, S> {
    /// Wire up a hub over `store`, resolving tokens with `directory` and
    /// reading statistics from `aggregates`.
    pub fn new(
        env: E,
        store: S,
        directory: Arc<dyn UserDirectory>,
        aggregates: Arc<dyn AggregateSource>,
        config: ServerConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self::with_registry(env, store, registry, directory, aggregates, config)
    }

    /// Like [`new`](Self::new), over an existing registry.
    pub fn with_registry(
        env: E,
        store: S,
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn UserDirectory>,
        aggregates: Arc<dyn AggregateSource>,
        config: ServerConfig,
    ) -> Self {
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let presence = PresenceService::new(
            env.clone(),
            Arc::clone(&registry),
            broadcaster.clone(),
            config.presence.typing_timeout,
        );
        let engine = DeliveryEngine::new(env.clone(), store, broadcaster.clone(), config.delivery);
        let statistics = StatisticsLoop::new(
            env.clone(),
            aggregates,
            broadcaster.clone(),
            config.statistics.interval,
        );

        Self { env, registry, broadcaster, presence, engine, statistics, directory, config }
    }

    /// Register a new anonymous connection and send it `connected`.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` when `max_connections` is reached.
    pub fn connect(&self, sender: mpsc::Sender<Outbound>) -> Result<ConnectionId, ServerError> {
        let limit = self.config.max_connections;
        let now = self.env.wall_clock();
        let id = loop {
            let candidate = ConnectionId(self.env.random_u64());
            match self.registry.register_bounded(candidate, None, sender.clone(), now, limit) {
                Registration::Registered => break candidate,
                Registration::DuplicateId => {},
                Registration::AtCapacity => {
                    return Err(ServerError::Transport(format!(
                        "connection limit of {limit} reached"
                    )));
                },
            }
        };

        self.reply(id, Event::Connected { connection_id: id });
        tracing::debug!(connection = %id, "connection registered");
        Ok(id)
    }

    /// Handle one signal from `id`. Failures are answered with an error
    /// event, never returned.
    pub async fn dispatch(&self, id: ConnectionId, signal: Signal) {
        self.registry.touch(id, self.env.wall_clock());
        let name = signal.name();
        tracing::debug!(connection = %id, signal = name, "signal received");

        if let Err(rejection) = self.handle(id, signal).await {
            tracing::debug!(
                connection = %id,
                signal = name,
                code = %rejection.code,
                reason = %rejection.message,
                "signal rejected"
            );
            self.reply(id, Event::error(rejection.code, rejection.message));
        }
    }

    /// Answer a frame that did not decode.
    pub fn reject_frame(&self, id: ConnectionId, err: &ProtocolError) {
        tracing::debug!(connection = %id, error = %err, "undecodable frame");
        self.reply(id, Event::error(ErrorCode::InvalidSignal, err.to_string()));
    }

    /// Remove a connection from every room and from the registry.
    ///
    /// Safe to call repeatedly; only the first call has an effect.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(rooms) = self.presence.disconnect(id) {
            tracing::debug!(connection = %id, rooms = rooms.len(), "connection closed");
        }
    }

    /// Current load figures.
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected_identities: self.registry.identity_count(),
            active_rooms: self.registry.room_count(),
            total_connections: self.registry.connection_count(),
            typing_records: self.presence.typing_count(),
        }
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Room broadcaster.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Presence tracker.
    pub fn presence(&self) -> &PresenceService<E> {
        &self.presence
    }

    /// Scheduled delivery engine.
    pub fn engine(&self) -> &DeliveryEngine<E, S> {
        &self.engine
    }

    /// Statistics loop.
    pub fn statistics(&self) -> &StatisticsLoop<E> {
        &self.statistics
    }

    /// Start the recovery sweep, retention cleanup, statistics ticker and the
    /// unreachable-connection reaper. All stop when `shutdown` is cancelled.
    pub fn spawn_background(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            self.engine.spawn_sweeper(shutdown.clone()),
            self.engine.spawn_cleanup(shutdown.clone()),
            self.statistics.spawn(shutdown.clone()),
        ];
        if let Some(reaper) = self.spawn_reaper(shutdown.clone()) {
            tasks.push(reaper);
        }
        tasks
    }

    /// Disconnect connections reported unreachable by the broadcaster.
    ///
    /// Returns `None` if a reaper was already started.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let mut reports = self.registry.take_unreachable()?;
        let hub = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    report = reports.recv() => match report {
                        Some(id) if hub.registry.is_registered(id) => {
                            if let Some(info) = hub.registry.info(id) {
                                tracing::warn!(
                                    connection = %id,
                                    user = ?info.user_id,
                                    rooms = info.rooms.len(),
                                    last_seen = %info.last_seen,
                                    "reaping unreachable connection"
                                );
                                hub.disconnect(id);
                            }
                        },
                        Some(_) => {},
                        None => break,
                    },
                }
            }
            tracing::debug!("reaper stopped");
        }))
    }

    async fn handle(&self, id: ConnectionId, signal: Signal) -> Result<(), Rejection> {
        match signal {
            Signal::Authenticate { token } => self.authenticate(id, &token).await,
            Signal::Join { room_id } => {
                if room_id.in_pair_namespace() {
                    self.check_pair_access(id, &room_id)?;
                }
                self.presence.join(id, &room_id)?;
                self.reply(id, Event::JoinAck { room_id });
                Ok(())
            },
            Signal::Leave { room_id } => {
                self.presence.leave(id, &room_id);
                self.reply(id, Event::LeaveAck { room_id });
                Ok(())
            },
            Signal::TypingStart { room_id } => Ok(self.presence.typing_start(id, &room_id)?),
            Signal::TypingStop { room_id } => Ok(self.presence.typing_stop(id, &room_id)?),
            Signal::Presence { status } => self.set_status(id, status),
            Signal::SendMessage { room_id, content, kind } => {
                let user = self.member_identity(id, &room_id)?;
                self.publish(user, room_id, content, kind)
            },
            Signal::ScheduleMessage { room_id, content, kind, scheduled_at } => {
                let user = self.member_identity(id, &room_id)?;
                let (message, record) =
                    self.engine.schedule_new(room_id, user, content, kind, scheduled_at)?;
                self.reply(id, Event::MessageScheduled {
                    message_id: message.id,
                    scheduled_at: record.scheduled_at,
                });
                Ok(())
            },
            Signal::CancelSchedule { message_id } => {
                let user = self.identity(id)?;
                self.engine.cancel(message_id, user)?;
                self.reply(id, Event::ScheduleCancelled { message_id });
                Ok(())
            },
            Signal::ListScheduled => {
                let user = self.identity(id)?;
                let items = self.engine.scheduled_for(user)?;
                self.reply(id, Event::ScheduledList { items });
                Ok(())
            },
            Signal::JoinDirect { peer_id } => {
                let user = self.peer_of(id, peer_id)?;
                let room_id = RoomId::pair(user, peer_id);
                self.presence.join(id, &room_id)?;
                self.reply(id, Event::JoinAck { room_id });
                Ok(())
            },
            Signal::SendDirect { peer_id, content, kind } => {
                let user = self.peer_of(id, peer_id)?;
                self.publish(user, RoomId::pair(user, peer_id), content, kind)
            },
            Signal::CallSignal { peer_id, payload } => {
                let user = self.peer_of(id, peer_id)?;
                let event = Event::CallSignal { from_user_id: user, payload };
                self.broadcaster.broadcast_to_pair_except(user, peer_id, event, Some(user));
                Ok(())
            },
            Signal::Ping => {
                self.reply(id, Event::Pong { timestamp: self.env.wall_clock() });
                Ok(())
            },
        }
    }

    async fn authenticate(&self, id: ConnectionId, token: &str) -> Result<(), Rejection> {
        if self.registry.identity_of(id).is_some() {
            return Err(already_authenticated());
        }

        let user = self.directory.resolve_identity(token).await.map_err(|e| match e {
            AuthError::UnknownToken => Rejection::new(ErrorCode::AuthFailed, "invalid token"),
            AuthError::Unavailable(reason) => {
                tracing::warn!(connection = %id, %reason, "user directory unavailable");
                Rejection::new(ErrorCode::AuthFailed, "identity provider unavailable")
            },
        })?;

        match self.presence.authenticate(id, user)? {
            IdentityBinding::Bound { .. } => {
                tracing::info!(connection = %id, %user, "connection authenticated");
                self.reply(id, Event::Authenticated { user_id: user });
                Ok(())
            },
            IdentityBinding::AlreadyBound(_) => Err(already_authenticated()),
        }
    }

    fn set_status(&self, id: ConnectionId, status: PresenceStatus) -> Result<(), Rejection> {
        let changed = self.presence.set_status(id, status)?;
        tracing::debug!(connection = %id, ?status, rooms = changed, "presence updated");
        Ok(())
    }

    /// Persist a visible message and fan it out.
    fn publish(
        &self,
        user: UserId,
        room_id: RoomId,
        content: String,
        kind: String,
    ) -> Result<(), Rejection> {
        let now: Timestamp = self.env.wall_clock();
        let message = self
            .engine
            .store()
            .create_message(NewMessage {
                room_id: room_id.clone(),
                sender_id: user,
                content,
                kind,
                created_at: now,
                sent_at: Some(now),
            })
            .map_err(DeliveryError::from)?;

        let event = Event::NewMessage { message: message.to_view(None) };
        let report = match room_id.pair_members() {
            Some((a, b)) => self.broadcaster.broadcast_to_pair(a, b, event),
            None => self.broadcaster.broadcast_to_room(&room_id, event),
        };
        tracing::debug!(message_id = %message.id, room = %room_id, recipients = report.delivered, "message sent");
        Ok(())
    }

    fn identity(&self, id: ConnectionId) -> Result<UserId, Rejection> {
        Ok(self.registry.identity_of(id).ok_or(DeliveryError::AuthRequired)?)
    }

    fn member_identity(&self, id: ConnectionId, room: &RoomId) -> Result<UserId, Rejection> {
        let user = self.identity(id)?;
        if !self.registry.is_member(id, room) {
            return Err(DeliveryError::NotFound(format!("membership in room {room}")).into());
        }
        Ok(user)
    }

    fn peer_of(&self, id: ConnectionId, peer: UserId) -> Result<UserId, Rejection> {
        let user = self.identity(id)?;
        if user == peer {
            return Err(Rejection::new(ErrorCode::InvalidSignal, "peer must be another identity"));
        }
        Ok(user)
    }

    /// Only the two members of a pair channel may join it by name.
    fn check_pair_access(&self, id: ConnectionId, room: &RoomId) -> Result<(), Rejection> {
        let user = self.identity(id)?;
        match room.pair_members() {
            Some((a, b)) if user == a || user == b => Ok(()),
            _ => Err(DeliveryError::NotFound(format!("room {room}")).into()),
        }
    }

    fn reply(&self, id: ConnectionId, event: Event) {
        if let Err(e) = self.broadcaster.send_to_connection(id, event) {
            tracing::debug!(connection = %id, error = %e, "reply dropped");
        }
    }
}

fn already_authenticated() -> Rejection {
    Rejection::new(ErrorCode::AlreadyAuthenticated, "connection is already authenticated")
}

#[cfg(test)]
mod tests {
    use roomcast_harness::{SimEnv, TestPeer};
    use roomcast_proto::MessageId;

    use super::*;
    use crate::{directory::StaticDirectory, statistics::MemoryAggregates, storage::MemoryStore};

    fn hub() -> Hub<SimEnv, MemoryStore> {
        let directory: StaticDirectory =
            [("alice".to_string(), UserId(1)), ("bob".to_string(), UserId(2))].into_iter().collect();
        Hub::new(
            SimEnv::new(),
            MemoryStore::new(),
            Arc::new(directory),
            Arc::new(MemoryAggregates::new()),
            ServerConfig::default(),
        )
    }

    fn open(hub: &Hub<SimEnv, MemoryStore>) -> TestPeer {
        let (tx, rx) = mpsc::channel(64);
        let id = hub.connect(tx).unwrap();
        let mut peer = TestPeer::new(id, rx);
        assert_eq!(peer.drain(), vec![Event::Connected { connection_id: id }]);
        peer
    }

    fn error_code(events: &[Event]) -> Option<ErrorCode> {
        events.iter().find_map(|e| match e {
            Event::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_once() {
        let hub = hub();
        let mut peer = open(&hub);

        hub.dispatch(peer.id(), Signal::Authenticate { token: "nope".into() }).await;
        assert_eq!(error_code(&peer.drain()), Some(ErrorCode::AuthFailed));

        hub.dispatch(peer.id(), Signal::Authenticate { token: "alice".into() }).await;
        assert_eq!(peer.drain(), vec![Event::Authenticated { user_id: UserId(1) }]);

        hub.dispatch(peer.id(), Signal::Authenticate { token: "bob".into() }).await;
        assert_eq!(error_code(&peer.drain()), Some(ErrorCode::AlreadyAuthenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_join_receives_broadcasts_but_cannot_send() {
        let hub = hub();
        let mut anon = open(&hub);
        let mut alice = open(&hub);
        let lobby = RoomId::new("lobby");
        hub.dispatch(alice.id(), Signal::Authenticate { token: "alice".into() }).await;
        hub.dispatch(anon.id(), Signal::Join { room_id: lobby.clone() }).await;
        hub.dispatch(alice.id(), Signal::Join { room_id: lobby.clone() }).await;
        alice.drain();

        let send = |content: &str| Signal::SendMessage {
            room_id: lobby.clone(),
            content: content.into(),
            kind: "text".into(),
        };
        hub.dispatch(anon.id(), send("hi")).await;
        hub.dispatch(alice.id(), send("hello")).await;

        let events = anon.drain();
        assert_eq!(events[0], Event::JoinAck { room_id: lobby.clone() });
        assert_eq!(events[1], Event::RoomJoined { user_id: UserId(1), room_id: lobby.clone() });
        assert_eq!(error_code(&events), Some(ErrorCode::AuthRequired));
        assert_eq!(events.iter().filter(|e| matches!(e, Event::NewMessage { .. })).count(), 1);
        assert_eq!(alice.count(|e| matches!(e, Event::NewMessage { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_join_acks_twice_announces_once() {
        let hub = hub();
        let mut alice = open(&hub);
        let mut bob = open(&hub);
        let lobby = RoomId::new("lobby");
        hub.dispatch(alice.id(), Signal::Authenticate { token: "alice".into() }).await;
        hub.dispatch(bob.id(), Signal::Authenticate { token: "bob".into() }).await;
        hub.dispatch(alice.id(), Signal::Join { room_id: lobby.clone() }).await;
        alice.drain();

        hub.dispatch(bob.id(), Signal::Join { room_id: lobby.clone() }).await;
        hub.dispatch(bob.id(), Signal::Join { room_id: lobby.clone() }).await;

        assert_eq!(bob.count(|e| matches!(e, Event::JoinAck { .. })), 2);
        assert_eq!(alice.count(|e| matches!(e, Event::RoomJoined { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_then_cancel_round_trip() {
        let hub = hub();
        let mut alice = open(&hub);
        let lobby = RoomId::new("lobby");
        hub.dispatch(alice.id(), Signal::Authenticate { token: "alice".into() }).await;
        hub.dispatch(alice.id(), Signal::Join { room_id: lobby.clone() }).await;
        alice.drain();

        let at = hub.env.wall_clock().saturating_add(std::time::Duration::from_secs(60));
        hub.dispatch(alice.id(), Signal::ScheduleMessage {
            room_id: lobby,
            content: "later".into(),
            kind: "text".into(),
            scheduled_at: at,
        })
        .await;
        let events = alice.drain();
        let Some(Event::MessageScheduled { message_id, scheduled_at }) = events.first().cloned() else {
            panic!("expected messageScheduled, got {events:?}");
        };
        assert_eq!(scheduled_at, at);

        hub.dispatch(alice.id(), Signal::ListScheduled).await;
        let Some(Event::ScheduledList { items }) = alice.drain().pop() else {
            panic!("expected scheduledList");
        };
        assert_eq!(items.len(), 1);

        hub.dispatch(alice.id(), Signal::CancelSchedule { message_id }).await;
        assert_eq!(alice.drain(), vec![Event::ScheduleCancelled { message_id }]);

        hub.dispatch(alice.id(), Signal::CancelSchedule { message_id }).await;
        assert_eq!(error_code(&alice.drain()), Some(ErrorCode::Conflict));

        hub.dispatch(alice.id(), Signal::CancelSchedule { message_id: MessageId(999) }).await;
        assert_eq!(error_code(&alice.drain()), Some(ErrorCode::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduling_requires_membership() {
        let hub = hub();
        let mut alice = open(&hub);
        hub.dispatch(alice.id(), Signal::Authenticate { token: "alice".into() }).await;
        alice.drain();

        hub.dispatch(alice.id(), Signal::ScheduleMessage {
            room_id: RoomId::new("elsewhere"),
            content: "x".into(),
            kind: "text".into(),
            scheduled_at: Timestamp::EPOCH,
        })
        .await;

        assert_eq!(error_code(&alice.drain()), Some(ErrorCode::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn pair_channel_is_private() {
        let hub = hub();
        let mut alice = open(&hub);
        let mut bob = open(&hub);
        let mut anon = open(&hub);
        hub.dispatch(alice.id(), Signal::Authenticate { token: "alice".into() }).await;
        hub.dispatch(bob.id(), Signal::Authenticate { token: "bob".into() }).await;
        hub.dispatch(alice.id(), Signal::JoinDirect { peer_id: UserId(2) }).await;
        hub.dispatch(bob.id(), Signal::JoinDirect { peer_id: UserId(1) }).await;
        alice.drain();
        bob.drain();

        hub.dispatch(anon.id(), Signal::Join { room_id: RoomId::pair(UserId(1), UserId(2)) }).await;
        assert_eq!(error_code(&anon.drain()), Some(ErrorCode::AuthRequired));

        hub.dispatch(alice.id(), Signal::CallSignal {
            peer_id: UserId(2),
            payload: serde_json::json!({"sdp": "offer"}),
        })
        .await;
        assert!(alice.drain().is_empty());
        assert_eq!(bob.count(|e| matches!(e, Event::CallSignal { from_user_id: UserId(1), .. })), 1);

        hub.dispatch(bob.id(), Signal::SendDirect {
            peer_id: UserId(1),
            content: "hey".into(),
            kind: "text".into(),
        })
        .await;
        assert_eq!(alice.count(|e| matches!(e, Event::NewMessage { .. })), 1);
        assert_eq!(bob.count(|e| matches!(e, Event::NewMessage { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_pongs_and_disconnect_cleans_up() {
        let hub = hub();
        let mut alice = open(&hub);
        hub.dispatch(alice.id(), Signal::Authenticate { token: "alice".into() }).await;
        hub.dispatch(alice.id(), Signal::Join { room_id: RoomId::new("lobby") }).await;
        alice.drain();

        hub.dispatch(alice.id(), Signal::Ping).await;
        assert!(matches!(alice.drain().as_slice(), [Event::Pong { .. }]));

        assert_eq!(hub.health().total_connections, 1);
        assert_eq!(hub.health().active_rooms, 1);
        hub.disconnect(alice.id());
        hub.disconnect(alice.id());

        assert_eq!(hub.health(), HealthSnapshot {
            connected_identities: 0,
            active_rooms: 0,
            total_connections: 0,
            typing_records: 0,
        });
    }

    #[tokio::test(start_paused = true)]
    async fn connection_limit_enforced() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        let hub: Hub<SimEnv, MemoryStore> = Hub::new(
            SimEnv::new(),
            MemoryStore::new(),
            Arc::new(StaticDirectory::new()),
            Arc::new(MemoryAggregates::new()),
            config,
        );
        let (tx, _rx) = mpsc::channel(4);

        assert!(hub.connect(tx.clone()).is_ok());
        assert!(matches!(hub.connect(tx), Err(ServerError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_frame_is_answered() {
        let hub = hub();
        let mut peer = open(&hub);
        let err = Signal::decode("{\"type\":\"bogus\"}").unwrap_err();

        hub.reject_frame(peer.id(), &err);

        assert_eq!(error_code(&peer.drain()), Some(ErrorCode::InvalidSignal));
    }
}
