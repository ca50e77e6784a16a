//! Presence and typing tracker.
//!
//! Wraps one [`RoomPresence`] state machine per room and executes its
//! actions: broadcasts go through the [`Broadcaster`], typing timers are
//! tokio tasks sleeping on the [`Environment`].
//!
//! Every registry mutation that can change who is present in a room runs
//! under that room's presence lock, and the resulting broadcasts are queued
//! before the lock is released. Two connections of the same identity racing
//! to join therefore announce the identity exactly once, and every member
//! observes a room's presence events in the same order.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use roomcast_core::{DeliveryError, Environment, PresenceAction, PresenceRecord, RoomPresence};
use roomcast_proto::{ConnectionId, PresenceStatus, RoomId, UserId};
use tokio::task::AbortHandle;

use crate::{
    broadcaster::Broadcaster,
    registry::{ConnectionRegistry, IdentityBinding, JoinOutcome, LeaveOutcome},
};

type RoomCell = Arc<Mutex<RoomPresence>>;

/// Room-scoped presence and typing state, shared by all connections.
#[derive(Clone)]
pub struct PresenceService<E: Environment> {
    env: E,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    rooms: Arc<DashMap<RoomId, RoomCell>>,
    timers: Arc<DashMap<(RoomId, UserId), (u64, AbortHandle)>>,
    typing_timeout: Duration,
}

impl<E: Environment> PresenceService<E> {
    /// Tracker over `registry`, expiring typing indicators after
    /// `typing_timeout`.
    pub fn new(
        env: E,
        registry: Arc<ConnectionRegistry>,
        broadcaster: Broadcaster,
        typing_timeout: Duration,
    ) -> Self {
        Self {
            env,
            registry,
            broadcaster,
            rooms: Arc::new(DashMap::new()),
            timers: Arc::new(DashMap::new()),
            typing_timeout,
        }
    }

    /// Join `room`. The identity is announced if this is its first
    /// connection there.
    ///
    /// # Errors
    ///
    /// `DeliveryError::NotFound` if the connection is unknown or closing.
    pub fn join(&self, id: ConnectionId, room: &RoomId) -> Result<JoinOutcome, DeliveryError> {
        let result = {
            let cell = self.room_cell(room);
            let mut state = cell.lock();
            let result = self.registry.join(id, room);
            if let Ok(JoinOutcome { first_for_identity: true, user_id: Some(user), .. }) = result {
                let actions = state.identity_joined(user);
                self.execute(room, actions);
            }
            result
        };
        self.release_room(room);
        result
    }

    /// Leave `room`. The identity's departure is announced if no other
    /// connection of it remains.
    pub fn leave(&self, id: ConnectionId, room: &RoomId) -> LeaveOutcome {
        let outcome = self.leave_locked(id, room);
        self.release_room(room);
        outcome
    }

    /// Remove a connection from every room, then from the registry.
    ///
    /// Returns the rooms it was in, or `None` if it was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> Option<Vec<RoomId>> {
        let (user, rooms) = self.registry.begin_unregister(id)?;
        for room in &rooms {
            self.leave(id, room);
        }
        self.registry.finish_unregister(id);
        tracing::debug!(connection = %id, user = ?user, rooms = rooms.len(), "connection removed");
        Some(rooms)
    }

    /// Bind `user` to an anonymous connection and announce the identity in
    /// every room the connection already joined.
    ///
    /// # Errors
    ///
    /// `DeliveryError::NotFound` if the connection is unknown or closing.
    pub fn authenticate(
        &self,
        id: ConnectionId,
        user: UserId,
    ) -> Result<IdentityBinding, DeliveryError> {
        let binding = self.registry.attach_identity(id, user)?;
        if let IdentityBinding::Bound { rooms } = &binding {
            for room in rooms {
                {
                    let cell = self.room_cell(room);
                    let mut state = cell.lock();
                    if self.registry.bind_identity_in_room(id, room) {
                        let actions = state.identity_joined(user);
                        self.execute(room, actions);
                    }
                }
                self.release_room(room);
            }
        }
        Ok(binding)
    }

    /// Change the connection's identity status in every room it is in.
    ///
    /// Returns the number of rooms where the status actually changed.
    ///
    /// # Errors
    ///
    /// `DeliveryError::AuthRequired` for anonymous connections.
    pub fn set_status(
        &self,
        id: ConnectionId,
        status: PresenceStatus,
    ) -> Result<usize, DeliveryError> {
        let user = self.registry.identity_of(id).ok_or(DeliveryError::AuthRequired)?;
        let mut changed = 0;
        for room in self.registry.rooms_of(id) {
            let Some(cell) = self.existing_cell(&room) else {
                continue;
            };
            let mut state = cell.lock();
            let actions = state.set_status(user, status);
            if !actions.is_empty() {
                changed += 1;
                self.execute(&room, actions);
            }
        }
        Ok(changed)
    }

    /// Typing started, or refreshed, in `room`.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::AuthRequired` for anonymous connections
    /// - `DeliveryError::NotFound` if the connection is not in the room
    pub fn typing_start(&self, id: ConnectionId, room: &RoomId) -> Result<(), DeliveryError> {
        self.with_member_state(id, room, RoomPresence::typing_start)
    }

    /// Typing stopped in `room`.
    ///
    /// # Errors
    ///
    /// Same as [`typing_start`](Self::typing_start).
    pub fn typing_stop(&self, id: ConnectionId, room: &RoomId) -> Result<(), DeliveryError> {
        self.with_member_state(id, room, RoomPresence::typing_stop)
    }

    /// Current record of `user` in `room`.
    pub fn record(&self, room: &RoomId, user: UserId) -> Option<PresenceRecord> {
        self.existing_cell(room).and_then(|cell| cell.lock().get(user).cloned())
    }

    /// Identities currently typing, across all rooms.
    pub fn typing_count(&self) -> usize {
        let cells: Vec<RoomCell> = self.rooms.iter().map(|entry| Arc::clone(entry.value())).collect();
        cells.iter().map(|cell| cell.lock().typing_count()).sum()
    }

    /// Typing timers currently armed.
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    fn with_member_state(
        &self,
        id: ConnectionId,
        room: &RoomId,
        transition: impl FnOnce(&mut RoomPresence, UserId) -> Vec<PresenceAction>,
    ) -> Result<(), DeliveryError> {
        let user = self.registry.identity_of(id).ok_or(DeliveryError::AuthRequired)?;
        if !self.registry.is_member(id, room) {
            return Err(DeliveryError::NotFound(format!("membership in room {room}")));
        }
        let Some(cell) = self.existing_cell(room) else {
            return Err(DeliveryError::NotFound(format!("room {room}")));
        };

        let mut state = cell.lock();
        let actions = transition(&mut state, user);
        self.execute(room, actions);
        Ok(())
    }

    fn leave_locked(&self, id: ConnectionId, room: &RoomId) -> LeaveOutcome {
        let cell = self.room_cell(room);
        let mut state = cell.lock();
        let outcome = self.registry.leave(id, room);
        if let LeaveOutcome { last_for_identity: true, user_id: Some(user), .. } = outcome {
            let actions = state.identity_left(user);
            self.execute(room, actions);
        }
        outcome
    }

    fn typing_expired(&self, room: &RoomId, user: UserId, generation: u64) {
        if let Some(cell) = self.existing_cell(room) {
            let mut state = cell.lock();
            let actions = state.typing_expired(user, generation);
            if !actions.is_empty() {
                tracing::debug!(%room, %user, "typing indicator expired");
            }
            self.execute(room, actions);
        }
        self.timers.remove_if(&(room.clone(), user), |_, (armed, _)| *armed == generation);
        self.release_room(room);
    }

    /// Run state machine actions. Called with the room's lock held.
    fn execute(&self, room: &RoomId, actions: Vec<PresenceAction>) {
        for action in actions {
            match action {
                PresenceAction::Broadcast { event, exclude } => {
                    self.broadcaster.broadcast_to_room_except(room, event, exclude);
                },
                PresenceAction::ArmTypingTimer { user_id, generation } => {
                    self.arm_timer(room, user_id, generation);
                },
                PresenceAction::CancelTypingTimer { user_id } => {
                    if let Some((_, (_, handle))) = self.timers.remove(&(room.clone(), user_id)) {
                        handle.abort();
                    }
                },
            }
        }
    }

    fn arm_timer(&self, room: &RoomId, user: UserId, generation: u64) {
        let service = self.clone();
        let target = room.clone();
        let handle = tokio::spawn(async move {
            service.env.sleep(service.typing_timeout).await;
            service.typing_expired(&target, user, generation);
        })
        .abort_handle();

        if let Some((_, previous)) = self.timers.insert((room.clone(), user), (generation, handle)) {
            previous.abort();
        }
    }

    fn room_cell(&self, room: &RoomId) -> RoomCell {
        let entry = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RoomPresence::new(room.clone()))));
        Arc::clone(entry.value())
    }

    fn existing_cell(&self, room: &RoomId) -> Option<RoomCell> {
        self.rooms.get(room).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a room's state once nobody is present and nobody holds it.
    fn release_room(&self, room: &RoomId) {
        self.rooms.remove_if(room, |_, cell| Arc::strong_count(cell) == 1 && cell.lock().is_empty());
    }
}
