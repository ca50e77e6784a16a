//! Roomcast wire protocol.
//!
//! Clients speak JSON text frames. Every frame is an object with a camelCase
//! `type` tag. Inbound frames decode into [`Signal`], outbound frames are
//! encoded from [`Event`]. Timestamps on the wire are unix milliseconds.
//!
//! # Components
//!
//! - [`ids`]: identifier newtypes and the [`Timestamp`] clock value
//! - [`Signal`]: client → server requests
//! - [`Event`]: server → client notifications and replies
//! - [`ProtocolError`]: decode and encode failures

#![forbid(unsafe_code)]

mod errors;
mod event;
pub mod ids;
mod signal;

use std::sync::Arc;

pub use errors::{ProtocolError, Result};
pub use event::{ErrorCode, Event, MessageView, ScheduledItem, StatisticsSnapshot};
pub use ids::{ConnectionId, MessageId, RoomId, ScheduleId, Timestamp, UserId};
pub use signal::{PresenceStatus, Signal};

/// An event queued for delivery to one connection.
///
/// Broadcasts share one allocation across every recipient.
pub type Outbound = Arc<Event>;
