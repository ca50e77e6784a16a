//! Pure logic for the roomcast server.
//!
//! Nothing in this crate performs I/O. State machines take time as input and
//! return actions for a driver to execute, which keeps them deterministic
//! under test.
//!
//! - [`env`]: time and randomness abstraction
//! - [`presence`]: per-room presence and typing state machine
//! - [`delivery`]: scheduled delivery records and their status lifecycle
//! - [`message`]: persisted message records

#![forbid(unsafe_code)]

pub mod delivery;
pub mod env;
pub mod error;
pub mod message;
pub mod presence;

pub use delivery::{DeliveryStatus, NewSchedule, ScheduledDelivery};
pub use env::Environment;
pub use error::DeliveryError;
pub use message::{Message, NewMessage};
pub use presence::{PresenceAction, PresenceRecord, RoomPresence};
