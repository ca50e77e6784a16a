//! Persisted message records.

use roomcast_proto::{MessageId, MessageView, RoomId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Input for persisting a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Target room or pair channel
    pub room_id: RoomId,
    /// Author
    pub sender_id: UserId,
    /// Body
    pub content: String,
    /// Application-defined message type
    pub kind: String,
    /// Creation time
    pub created_at: Timestamp,
    /// Visible immediately when set; scheduled messages start hidden
    pub sent_at: Option<Timestamp>,
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Room or pair channel
    pub room_id: RoomId,
    /// Author
    pub sender_id: UserId,
    /// Body
    pub content: String,
    /// Application-defined message type
    pub kind: String,
    /// Creation time
    pub created_at: Timestamp,
    /// When it became visible, `None` while hidden
    pub sent_at: Option<Timestamp>,
    /// Pending delivery time, cleared once visible
    pub scheduled_at: Option<Timestamp>,
}

impl Message {
    /// Materialize a new record.
    pub fn from_new(id: MessageId, new: NewMessage) -> Self {
        Self {
            id,
            room_id: new.room_id,
            sender_id: new.sender_id,
            content: new.content,
            kind: new.kind,
            created_at: new.created_at,
            sent_at: new.sent_at,
            scheduled_at: None,
        }
    }

    /// Whether clients may see this message.
    pub fn is_visible(&self) -> bool {
        self.sent_at.is_some()
    }

    /// Make the message visible and clear its pending delivery time.
    pub fn mark_visible(&mut self, sent_at: Timestamp) {
        self.sent_at = Some(sent_at);
        self.scheduled_at = None;
    }

    /// Client view. `scheduled_by` is set for messages delivered by the
    /// scheduler.
    pub fn to_view(&self, scheduled_by: Option<UserId>) -> MessageView {
        MessageView {
            id: self.id,
            room_id: self.room_id.clone(),
            sender_id: self.sender_id,
            content: self.content.clone(),
            kind: self.kind.clone(),
            created_at: self.created_at,
            sent_at: self.sent_at,
            is_scheduled: scheduled_by.is_some(),
            scheduled_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_visible_clears_schedule() {
        let mut msg = Message::from_new(
            MessageId(1),
            NewMessage {
                room_id: RoomId::new("r"),
                sender_id: UserId(2),
                content: "later".into(),
                kind: "text".into(),
                created_at: Timestamp::from_millis(5),
                sent_at: None,
            },
        );
        msg.scheduled_at = Some(Timestamp::from_millis(50));
        assert!(!msg.is_visible());

        msg.mark_visible(Timestamp::from_millis(51));

        assert!(msg.is_visible());
        assert_eq!(msg.scheduled_at, None);
        let view = msg.to_view(Some(UserId(2)));
        assert!(view.is_scheduled);
        assert_eq!(view.sent_at, Some(Timestamp::from_millis(51)));
    }
}
