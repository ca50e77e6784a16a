//! Server → client events.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    ids::{ConnectionId, MessageId, RoomId, Timestamp, UserId},
    signal::PresenceStatus,
};

/// A persisted message as clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    /// Message id
    pub id: MessageId,
    /// Room or pair channel the message belongs to
    pub room_id: RoomId,
    /// Author
    pub sender_id: UserId,
    /// Body
    pub content: String,
    /// Application-defined message type
    pub kind: String,
    /// When the message was first persisted
    pub created_at: Timestamp,
    /// When the message became visible
    pub sent_at: Option<Timestamp>,
    /// Whether the message went through the scheduled delivery path
    pub is_scheduled: bool,
    /// Who scheduled it, for scheduled messages
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scheduled_by: Option<UserId>,
}

/// One row of a `scheduledList` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledItem {
    /// Scheduled message
    pub message_id: MessageId,
    /// Target room
    pub room_id: RoomId,
    /// Delivery time
    pub scheduled_at: Timestamp,
    /// Message body
    pub content: String,
}

/// Aggregate counters pushed to every connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    /// Identities active in the reporting window
    pub active_users: u64,
    /// Completed sessions in the reporting window
    pub completed_sessions: u64,
    /// Completed tasks in the reporting window
    pub completed_tasks: u64,
    /// Achievements earned in the reporting window
    pub achievements: u64,
    /// When the snapshot was computed, `None` before the first success
    pub computed_at: Option<Timestamp>,
}

/// Machine-readable error category attached to [`Event::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Token could not be resolved to an identity
    AuthFailed,
    /// Operation needs an authenticated connection
    AuthRequired,
    /// Connection already has an identity
    AlreadyAuthenticated,
    /// Referenced entity does not exist or is not visible to the caller
    NotFound,
    /// State changed underneath the request
    Conflict,
    /// Persistence backend unavailable; retry later
    StoreUnavailable,
    /// Frame could not be decoded
    InvalidSignal,
    /// Server refused the connection
    Rejected,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AuthFailed => "auth_failed",
            Self::AuthRequired => "auth_required",
            Self::AlreadyAuthenticated => "already_authenticated",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::StoreUnavailable => "store_unavailable",
            Self::InvalidSignal => "invalid_signal",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// A notification or reply sent to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    /// First event on every connection.
    Connected {
        /// Server-assigned connection id
        connection_id: ConnectionId,
    },
    /// Identity bound to the connection.
    Authenticated {
        /// Resolved identity
        user_id: UserId,
    },
    /// The acting connection joined a room.
    JoinAck {
        /// Joined room
        room_id: RoomId,
    },
    /// The acting connection left a room.
    LeaveAck {
        /// Left room
        room_id: RoomId,
    },
    /// An identity became present in a room.
    RoomJoined {
        /// Joining identity
        user_id: UserId,
        /// Room
        room_id: RoomId,
    },
    /// An identity's last connection left a room.
    RoomLeft {
        /// Leaving identity
        user_id: UserId,
        /// Room
        room_id: RoomId,
    },
    /// An identity started typing.
    Typing {
        /// Typing identity
        user_id: UserId,
        /// Room
        room_id: RoomId,
    },
    /// An identity stopped typing, explicitly or by timeout.
    StoppedTyping {
        /// Identity
        user_id: UserId,
        /// Room
        room_id: RoomId,
    },
    /// An identity changed availability in a room.
    PresenceChanged {
        /// Identity
        user_id: UserId,
        /// Room
        room_id: RoomId,
        /// New status
        status: PresenceStatus,
    },
    /// A message became visible.
    NewMessage {
        /// The message
        message: MessageView,
    },
    /// A scheduled message was accepted.
    MessageScheduled {
        /// Persisted message id
        message_id: MessageId,
        /// Delivery time
        scheduled_at: Timestamp,
    },
    /// A scheduled message was cancelled.
    ScheduleCancelled {
        /// Cancelled message id
        message_id: MessageId,
    },
    /// Reply to `listScheduled`, ordered by delivery time.
    ScheduledList {
        /// Pending deliveries
        items: Vec<ScheduledItem>,
    },
    /// Periodic aggregate counters.
    StatisticsUpdated {
        /// Latest snapshot
        statistics: StatisticsSnapshot,
    },
    /// Relayed call-negotiation payload.
    CallSignal {
        /// Sender identity
        from_user_id: UserId,
        /// Opaque payload
        payload: serde_json::Value,
    },
    /// Reply to `ping`.
    Pong {
        /// Server wall clock
        timestamp: Timestamp,
    },
    /// A request failed.
    Error {
        /// Error category
        code: ErrorCode,
        /// Human-readable description
        message: String,
    },
}

impl Event {
    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode one outbound frame. Used by clients and tests.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Construct an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error { code, message: message.into() }
    }
}
