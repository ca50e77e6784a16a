//! Identifier newtypes.
//!
//! Numeric ids serialize as bare JSON numbers. [`RoomId`] is an opaque string
//! so that callers can use whatever room naming their product needs; the one
//! reserved shape is the pair channel produced by [`RoomId::pair`].

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Prefix of pair channel names.
const PAIR_PREFIX: &str = "dm:";

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Authenticated user identity, resolved by the user directory.
    UserId
);
numeric_id!(
    /// One live socket. Unique for the lifetime of the process.
    ConnectionId
);
numeric_id!(
    /// Persisted message.
    MessageId
);
numeric_id!(
    /// Persisted scheduled delivery record.
    ScheduleId
);

/// Broadcast scope: a group room or a two-party pair channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap a room name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Canonical pair channel for two identities.
    ///
    /// Symmetric: `pair(a, b) == pair(b, a)`.
    pub fn pair(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{PAIR_PREFIX}{low}:{high}"))
    }

    /// The two identities of a pair channel, `None` for group rooms.
    pub fn pair_members(&self) -> Option<(UserId, UserId)> {
        let rest = self.0.strip_prefix(PAIR_PREFIX)?;
        let (low, high) = rest.split_once(':')?;
        let low = low.parse().ok().map(UserId)?;
        let high = high.parse().ok().map(UserId)?;
        // Reject non-canonical spellings so each pair has exactly one channel
        if low > high || Self::pair(low, high).0 != self.0 {
            return None;
        }
        Some((low, high))
    }

    /// Whether this names a pair channel.
    pub fn is_pair(&self) -> bool {
        self.pair_members().is_some()
    }

    /// Whether the name uses the pair-channel namespace, canonical or not.
    pub fn in_pair_namespace(&self) -> bool {
        self.0.starts_with(PAIR_PREFIX)
    }

    /// Borrowed room name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Wall-clock instant in unix milliseconds.
///
/// Used for everything that is persisted or sent over the wire. Monotonic
/// scheduling uses the environment's own instant type instead.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The unix epoch.
    pub const EPOCH: Self = Self(0);

    /// Construct from unix milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Unix milliseconds.
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// `self + duration`, saturating at the maximum representable instant.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// `self - duration`, saturating at the epoch.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
