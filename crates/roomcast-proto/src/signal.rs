//! Client → server signals.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    ids::{MessageId, RoomId, Timestamp, UserId},
};

/// Largest inbound text frame accepted by [`Signal::decode`].
pub const MAX_SIGNAL_SIZE: usize = 64 * 1024;

/// Self-reported availability of an identity within a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Connected and active
    Online,
    /// Connected but idle
    Away,
    /// Not available
    #[default]
    Offline,
}

/// A request sent by a connected client.
///
/// # Wire format
///
/// ```json
/// {"type":"join","roomId":"lobby"}
/// {"type":"scheduleMessage","roomId":"lobby","content":"hi","scheduledAt":1700000002000}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Signal {
    /// Bind an identity to the connection.
    Authenticate {
        /// Opaque credential resolved by the user directory
        token: String,
    },
    /// Subscribe to a room's broadcasts.
    Join {
        /// Room to join
        room_id: RoomId,
    },
    /// Unsubscribe from a room.
    Leave {
        /// Room to leave
        room_id: RoomId,
    },
    /// Start of a typing burst.
    TypingStart {
        /// Room being typed into
        room_id: RoomId,
    },
    /// Explicit end of a typing burst.
    TypingStop {
        /// Room being typed into
        room_id: RoomId,
    },
    /// Change availability in every joined room.
    Presence {
        /// New status
        status: PresenceStatus,
    },
    /// Persist and immediately broadcast a message.
    SendMessage {
        /// Target room
        room_id: RoomId,
        /// Message body
        content: String,
        /// Application-defined message type
        #[serde(default = "default_kind")]
        kind: String,
    },
    /// Persist a message that becomes visible at `scheduled_at`.
    ScheduleMessage {
        /// Target room
        room_id: RoomId,
        /// Message body
        content: String,
        /// Application-defined message type
        #[serde(default = "default_kind")]
        kind: String,
        /// Delivery time
        scheduled_at: Timestamp,
    },
    /// Cancel one of the caller's pending scheduled messages.
    CancelSchedule {
        /// Message whose delivery should be cancelled
        message_id: MessageId,
    },
    /// List the caller's pending scheduled messages.
    ListScheduled,
    /// Join the pair channel shared with `peer_id`.
    JoinDirect {
        /// The other party
        peer_id: UserId,
    },
    /// Persist and deliver a message on the pair channel.
    SendDirect {
        /// The other party
        peer_id: UserId,
        /// Message body
        content: String,
        /// Application-defined message type
        #[serde(default = "default_kind")]
        kind: String,
    },
    /// Relay an opaque call-negotiation payload to `peer_id`.
    CallSignal {
        /// The other party
        peer_id: UserId,
        /// Offer, answer, or candidate blob
        payload: serde_json::Value,
    },
    /// Liveness probe.
    Ping,
}

fn default_kind() -> String {
    "text".to_string()
}

impl Signal {
    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooLarge` if the frame exceeds [`MAX_SIGNAL_SIZE`]
    /// - `ProtocolError::Malformed` if it is not a known signal
    pub fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_SIGNAL_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: text.len(), max: MAX_SIGNAL_SIZE });
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode as a JSON text frame.
    ///
    /// Used by clients and tests.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::TypingStart { .. } => "typingStart",
            Self::TypingStop { .. } => "typingStop",
            Self::Presence { .. } => "presence",
            Self::SendMessage { .. } => "sendMessage",
            Self::ScheduleMessage { .. } => "scheduleMessage",
            Self::CancelSchedule { .. } => "cancelSchedule",
            Self::ListScheduled => "listScheduled",
            Self::JoinDirect { .. } => "joinDirect",
            Self::SendDirect { .. } => "sendDirect",
            Self::CallSignal { .. } => "callSignal",
            Self::Ping => "ping",
        }
    }
}
