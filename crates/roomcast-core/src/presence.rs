//! Presence and typing state machine.
//!
//! One [`RoomPresence`] holds the ephemeral per-identity state of a single
//! room. Methods mutate the state and return [`PresenceAction`]s; the server
//! executes them (broadcasts, typing timers). Every state change produces
//! exactly one broadcast, and calls that change nothing produce none.
//!
//! # Typing
//!
//! ```text
//!              typing_start                typing_start (reset timer)
//! ┌──────┐  broadcast Typing   ┌────────┐ ───────────┐
//! │ Idle │───────────────────> │ Typing │ <──────────┘
//! └──────┘ <───────────────────└────────┘
//!          typing_stop / typing_expired
//!          broadcast StoppedTyping
//! ```
//!
//! Timers are identified by a generation counter. Every start, reset and
//! stop bumps it, so an expiry carrying an older generation is stale and
//! ignored.

use std::{collections::HashMap, time::Duration};

use roomcast_proto::{Event, PresenceStatus, RoomId, UserId};

/// How long a typing indicator lives without a refresh.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(6);

/// Actions returned by the presence state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceAction {
    /// Deliver `event` to every connection in the room.
    Broadcast {
        /// Event to deliver
        event: Event,
        /// Identity whose connections are skipped
        exclude: Option<UserId>,
    },

    /// Start (or restart) the typing timer for `user_id`.
    ///
    /// Any timer already running for the identity must be dropped.
    ArmTypingTimer {
        /// Typing identity
        user_id: UserId,
        /// Value to pass back to [`RoomPresence::typing_expired`]
        generation: u64,
    },

    /// Drop the typing timer for `user_id`.
    CancelTypingTimer {
        /// Identity
        user_id: UserId,
    },
}

/// Ephemeral state for one identity in one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Self-reported availability
    pub status: PresenceStatus,
    /// Whether a typing indicator is showing
    pub is_typing: bool,
    typing_generation: u64,
}

impl PresenceRecord {
    fn online() -> Self {
        Self { status: PresenceStatus::Online, is_typing: false, typing_generation: 0 }
    }
}

/// Presence state of a single room.
#[derive(Debug, Clone)]
pub struct RoomPresence {
    room_id: RoomId,
    records: HashMap<UserId, PresenceRecord>,
}

impl RoomPresence {
    /// Empty room.
    pub fn new(room_id: RoomId) -> Self {
        Self { room_id, records: HashMap::new() }
    }

    /// Room this state belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Record for an identity, if present.
    pub fn get(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.records.get(&user_id)
    }

    /// Whether no identity is present.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of present identities.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Number of identities currently typing.
    pub fn typing_count(&self) -> usize {
        self.records.values().filter(|r| r.is_typing).count()
    }

    /// The identity's first connection joined the room.
    pub fn identity_joined(&mut self, user_id: UserId) -> Vec<PresenceAction> {
        if self.records.contains_key(&user_id) {
            return Vec::new();
        }
        self.records.insert(user_id, PresenceRecord::online());

        vec![self.broadcast(
            Event::RoomJoined { user_id, room_id: self.room_id.clone() },
            Some(user_id),
        )]
    }

    /// The identity's last connection left the room.
    ///
    /// A showing typing indicator is withdrawn before the departure is
    /// announced.
    pub fn identity_left(&mut self, user_id: UserId) -> Vec<PresenceAction> {
        let Some(record) = self.records.remove(&user_id) else {
            return Vec::new();
        };

        let mut actions = Vec::with_capacity(3);
        if record.is_typing {
            actions.push(PresenceAction::CancelTypingTimer { user_id });
            actions.push(self.broadcast(
                Event::StoppedTyping { user_id, room_id: self.room_id.clone() },
                Some(user_id),
            ));
        }
        actions.push(
            self.broadcast(Event::RoomLeft { user_id, room_id: self.room_id.clone() }, None),
        );
        actions
    }

    /// Explicit availability change.
    pub fn set_status(&mut self, user_id: UserId, status: PresenceStatus) -> Vec<PresenceAction> {
        let Some(record) = self.records.get_mut(&user_id) else {
            return Vec::new();
        };
        if record.status == status {
            return Vec::new();
        }
        record.status = status;

        vec![self.broadcast(
            Event::PresenceChanged { user_id, room_id: self.room_id.clone(), status },
            None,
        )]
    }

    /// Typing signal. Repeats while already typing only reset the timer.
    pub fn typing_start(&mut self, user_id: UserId) -> Vec<PresenceAction> {
        let Some(record) = self.records.get_mut(&user_id) else {
            return Vec::new();
        };
        record.typing_generation += 1;
        let generation = record.typing_generation;
        let arm = PresenceAction::ArmTypingTimer { user_id, generation };

        if record.is_typing {
            return vec![arm];
        }
        record.is_typing = true;

        vec![
            self.broadcast(
                Event::Typing { user_id, room_id: self.room_id.clone() },
                Some(user_id),
            ),
            arm,
        ]
    }

    /// Explicit end of a typing burst.
    pub fn typing_stop(&mut self, user_id: UserId) -> Vec<PresenceAction> {
        let Some(record) = self.records.get_mut(&user_id) else {
            return Vec::new();
        };
        if !record.is_typing {
            return Vec::new();
        }
        record.is_typing = false;
        record.typing_generation += 1;

        vec![
            PresenceAction::CancelTypingTimer { user_id },
            self.broadcast(
                Event::StoppedTyping { user_id, room_id: self.room_id.clone() },
                Some(user_id),
            ),
        ]
    }

    /// A typing timer armed with `generation` ran out.
    pub fn typing_expired(&mut self, user_id: UserId, generation: u64) -> Vec<PresenceAction> {
        let Some(record) = self.records.get_mut(&user_id) else {
            return Vec::new();
        };
        if !record.is_typing || record.typing_generation != generation {
            return Vec::new();
        }
        record.is_typing = false;

        vec![self.broadcast(
            Event::StoppedTyping { user_id, room_id: self.room_id.clone() },
            Some(user_id),
        )]
    }

    fn broadcast(&self, event: Event, exclude: Option<UserId>) -> PresenceAction {
        PresenceAction::Broadcast { event, exclude }
    }
}
