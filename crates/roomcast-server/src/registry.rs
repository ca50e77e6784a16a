//! Connection registry for identity and room membership tracking.
//!
//! The registry maintains bidirectional mappings: room → connections (for
//! broadcast) and connection → rooms (for cleanup on disconnect), plus
//! identity → connections. Lookups are O(1) in every direction.
//!
//! # Concurrency
//!
//! Each map is a sharded [`DashMap`], so operations on unrelated rooms or
//! connections do not contend. Lock order is always
//! connection entry → room entry → identity entry; nothing acquires them in
//! reverse. A room's entry is held for the whole of a fan-out, which
//! serializes broadcasts per room and keeps every member's event order
//! identical.
//!
//! # Lifecycle
//!
//! Unregistering is two-phase. [`begin_unregister`] marks the connection as
//! closing (rejecting further joins) and hands back its rooms exactly once;
//! the caller leaves each room; [`finish_unregister`] drops the entry. This
//! lets presence bookkeeping lock each room around its own leave.
//!
//! [`begin_unregister`]: ConnectionRegistry::begin_unregister
//! [`finish_unregister`]: ConnectionRegistry::finish_unregister

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use roomcast_core::DeliveryError;
use roomcast_proto::{ConnectionId, Outbound, RoomId, Timestamp, UserId};
use tokio::sync::mpsc;

/// Snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Bound identity, `None` while anonymous
    pub user_id: Option<UserId>,
    /// Joined rooms
    pub rooms: HashSet<RoomId>,
    /// When the connection registered
    pub connected_at: Timestamp,
    /// Last inbound activity
    pub last_seen: Timestamp,
}

/// Result of [`ConnectionRegistry::register_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Entry created
    Registered,
    /// Id already registered
    DuplicateId,
    /// The limit was already reached
    AtCapacity,
}

/// Result of [`ConnectionRegistry::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinOutcome {
    /// Membership was created (false if already a member)
    pub added: bool,
    /// Identity of the joining connection
    pub user_id: Option<UserId>,
    /// First connection of this identity in the room
    pub first_for_identity: bool,
}

/// Result of [`ConnectionRegistry::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaveOutcome {
    /// Membership was removed (false if not a member)
    pub removed: bool,
    /// Identity of the leaving connection
    pub user_id: Option<UserId>,
    /// No connection of this identity remains in the room
    pub last_for_identity: bool,
}

/// Result of [`ConnectionRegistry::attach_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityBinding {
    /// Identity bound. These rooms were joined while anonymous and still
    /// need [`ConnectionRegistry::bind_identity_in_room`].
    Bound {
        /// Rooms joined before authentication
        rooms: Vec<RoomId>,
    },
    /// The connection already carries an identity.
    AlreadyBound(UserId),
}

struct ConnectionEntry {
    user_id: Option<UserId>,
    rooms: HashSet<RoomId>,
    sender: mpsc::Sender<Outbound>,
    connected_at: Timestamp,
    last_seen: Timestamp,
    closing: bool,
}

/// One connection's membership in a room.
#[derive(Clone)]
pub(crate) struct Member {
    pub(crate) user_id: Option<UserId>,
    pub(crate) sender: mpsc::Sender<Outbound>,
}

/// Members of one room, with per-identity connection counts.
#[derive(Default)]
pub(crate) struct RoomMembers {
    members: HashMap<ConnectionId, Member>,
    identities: HashMap<UserId, usize>,
}

impl RoomMembers {
    /// Add a member. Returns true if it is the identity's first connection.
    fn insert(&mut self, id: ConnectionId, member: Member) -> bool {
        let user_id = member.user_id;
        if self.members.insert(id, member).is_some() {
            return false;
        }
        user_id.is_some_and(|user| self.count_in(user) == 1)
    }

    /// Remove a member. Returns its identity and whether it was the last
    /// connection of that identity.
    fn remove(&mut self, id: ConnectionId) -> Option<(Option<UserId>, bool)> {
        let member = self.members.remove(&id)?;
        let last = member.user_id.is_some_and(|user| self.count_out(user) == 0);
        Some((member.user_id, last))
    }

    /// Attach an identity to an anonymous member. Returns true if it is the
    /// identity's first connection in the room.
    fn bind_identity(&mut self, id: ConnectionId, user: UserId) -> bool {
        match self.members.get_mut(&id) {
            Some(member) if member.user_id.is_none() => {
                member.user_id = Some(user);
                self.count_in(user) == 1
            },
            _ => false,
        }
    }

    fn count_in(&mut self, user: UserId) -> usize {
        let count = self.identities.entry(user).or_default();
        *count += 1;
        *count
    }

    fn count_out(&mut self, user: UserId) -> usize {
        let Some(count) = self.identities.get_mut(&user) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.identities.remove(&user);
        }
        remaining
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &Member)> {
        self.members.iter()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Registry of live connections and their room memberships.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<RoomId, RoomMembers>,
    identities: DashMap<UserId, HashSet<ConnectionId>>,
    /// Reserved slots; never below the number of entries
    admitted: AtomicUsize,
    unreachable_tx: mpsc::UnboundedSender<ConnectionId>,
    unreachable_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionId>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        let (unreachable_tx, unreachable_rx) = mpsc::unbounded_channel();
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            identities: DashMap::new(),
            admitted: AtomicUsize::new(0),
            unreachable_tx,
            unreachable_rx: Mutex::new(Some(unreachable_rx)),
        }
    }

    /// Register a connection and its outbound queue.
    ///
    /// Returns `false` if the id is already registered.
    pub fn register(
        &self,
        id: ConnectionId,
        user_id: Option<UserId>,
        sender: mpsc::Sender<Outbound>,
        now: Timestamp,
    ) -> bool {
        self.register_bounded(id, user_id, sender, now, usize::MAX) == Registration::Registered
    }

    /// Register a connection unless `limit` connections already exist.
    ///
    /// The slot is reserved atomically before the entry is created, so
    /// concurrent callers never overshoot `limit`.
    pub fn register_bounded(
        &self,
        id: ConnectionId,
        user_id: Option<UserId>,
        sender: mpsc::Sender<Outbound>,
        now: Timestamp,
        limit: usize,
    ) -> Registration {
        let reserved = self
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1));
        if reserved.is_err() {
            return Registration::AtCapacity;
        }

        match self.connections.entry(id) {
            Entry::Occupied(_) => {
                self.admitted.fetch_sub(1, Ordering::SeqCst);
                Registration::DuplicateId
            },
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    user_id,
                    rooms: HashSet::new(),
                    sender,
                    connected_at: now,
                    last_seen: now,
                    closing: false,
                });
                if let Some(user) = user_id {
                    self.identities.entry(user).or_default().insert(id);
                }
                Registration::Registered
            },
        }
    }

    /// Bind an identity to an anonymous connection.
    ///
    /// # Errors
    ///
    /// `DeliveryError::NotFound` if the connection is unknown or closing.
    pub fn attach_identity(
        &self,
        id: ConnectionId,
        user: UserId,
    ) -> Result<IdentityBinding, DeliveryError> {
        let mut entry = self.live_entry(id)?;
        if let Some(existing) = entry.user_id {
            return Ok(IdentityBinding::AlreadyBound(existing));
        }
        entry.user_id = Some(user);
        self.identities.entry(user).or_default().insert(id);
        Ok(IdentityBinding::Bound { rooms: entry.rooms.iter().cloned().collect() })
    }

    /// Carry a newly bound identity into one room joined while anonymous.
    ///
    /// Returns true if this makes the identity present in the room.
    pub fn bind_identity_in_room(&self, id: ConnectionId, room: &RoomId) -> bool {
        let Some(entry) = self.connections.get(&id) else {
            return false;
        };
        let Some(user) = entry.user_id else {
            return false;
        };
        if !entry.rooms.contains(room) {
            return false;
        }
        self.rooms.get_mut(room).is_some_and(|mut members| members.bind_identity(id, user))
    }

    /// Add a connection to a room's membership. Idempotent.
    ///
    /// # Errors
    ///
    /// `DeliveryError::NotFound` if the connection is unknown or closing.
    pub fn join(&self, id: ConnectionId, room: &RoomId) -> Result<JoinOutcome, DeliveryError> {
        let mut entry = self.live_entry(id)?;
        let user_id = entry.user_id;
        if !entry.rooms.insert(room.clone()) {
            return Ok(JoinOutcome { added: false, user_id, first_for_identity: false });
        }

        let member = Member { user_id, sender: entry.sender.clone() };
        let first = self.rooms.entry(room.clone()).or_default().insert(id, member);
        Ok(JoinOutcome { added: true, user_id, first_for_identity: first })
    }

    /// Remove a connection from a room's membership. Idempotent.
    ///
    /// Allowed while the connection is closing.
    pub fn leave(&self, id: ConnectionId, room: &RoomId) -> LeaveOutcome {
        let outcome = {
            let Some(mut entry) = self.connections.get_mut(&id) else {
                return LeaveOutcome::default();
            };
            let user_id = entry.user_id;
            if !entry.rooms.remove(room) {
                return LeaveOutcome { removed: false, user_id, last_for_identity: false };
            }
            let removed = self.rooms.get_mut(room).and_then(|mut members| members.remove(id));
            match removed {
                Some((user_id, last)) => {
                    LeaveOutcome { removed: true, user_id, last_for_identity: last }
                },
                None => LeaveOutcome { removed: true, user_id, last_for_identity: false },
            }
        };
        self.rooms.remove_if(room, |_, members| members.is_empty());
        outcome
    }

    /// Mark a connection as closing and return its identity and rooms.
    ///
    /// Returns `None` if the connection is unknown or already closing, so
    /// concurrent unregister attempts clean up exactly once.
    pub fn begin_unregister(&self, id: ConnectionId) -> Option<(Option<UserId>, Vec<RoomId>)> {
        let mut entry = self.connections.get_mut(&id)?;
        if entry.closing {
            return None;
        }
        entry.closing = true;
        Some((entry.user_id, entry.rooms.iter().cloned().collect()))
    }

    /// Drop a connection's entry and identity index.
    ///
    /// Any membership still present is removed without notification.
    pub fn finish_unregister(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let (_, entry) = self.connections.remove(&id)?;
        self.admitted.fetch_sub(1, Ordering::SeqCst);

        for room in &entry.rooms {
            if let Some(mut members) = self.rooms.get_mut(room) {
                members.remove(id);
            }
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        if let Some(user) = entry.user_id {
            if let Some(mut connections) = self.identities.get_mut(&user) {
                connections.remove(&id);
            }
            self.identities.remove_if(&user, |_, connections| connections.is_empty());
        }

        Some(ConnectionInfo {
            id,
            user_id: entry.user_id,
            rooms: entry.rooms,
            connected_at: entry.connected_at,
            last_seen: entry.last_seen,
        })
    }

    /// Remove a connection from every room and drop it.
    ///
    /// Returns the rooms it was in and the outcome of each leave. `None` if
    /// it was unknown or already being unregistered.
    pub fn unregister(&self, id: ConnectionId) -> Option<Vec<(RoomId, LeaveOutcome)>> {
        let (_, rooms) = self.begin_unregister(id)?;
        let outcomes = rooms
            .into_iter()
            .map(|room| {
                let outcome = self.leave(id, &room);
                (room, outcome)
            })
            .collect();
        self.finish_unregister(id);
        Some(outcomes)
    }

    /// Record inbound activity.
    pub fn touch(&self, id: ConnectionId, now: Timestamp) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.last_seen = now;
        }
    }

    /// Report a connection whose queue is full or closed.
    ///
    /// The report is handled asynchronously by whoever holds the receiver
    /// from [`take_unreachable`](Self::take_unreachable).
    pub fn report_unreachable(&self, id: ConnectionId) {
        // Receiver gone means the server is shutting down
        let _ = self.unreachable_tx.send(id);
    }

    /// Take the unreachable-connection receiver. Only the first call gets it.
    pub fn take_unreachable(&self) -> Option<mpsc::UnboundedReceiver<ConnectionId>> {
        self.unreachable_rx.lock().take()
    }

    /// Snapshot of one connection.
    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|entry| ConnectionInfo {
            id,
            user_id: entry.user_id,
            rooms: entry.rooms.clone(),
            connected_at: entry.connected_at,
            last_seen: entry.last_seen,
        })
    }

    /// Whether a connection is registered and not closing.
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.get(&id).is_some_and(|entry| !entry.closing)
    }

    /// Identity bound to a connection.
    pub fn identity_of(&self, id: ConnectionId) -> Option<UserId> {
        self.connections.get(&id).and_then(|entry| entry.user_id)
    }

    /// Whether a connection is in a room.
    pub fn is_member(&self, id: ConnectionId, room: &RoomId) -> bool {
        self.connections.get(&id).is_some_and(|entry| entry.rooms.contains(room))
    }

    /// Rooms a connection is in.
    pub fn rooms_of(&self, id: ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(&id)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Connections in a room.
    pub fn room_members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    /// Connections bound to an identity.
    pub fn connections_of(&self, user: UserId) -> Vec<ConnectionId> {
        self.identities
            .get(&user)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Registered connections, including closing ones.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Distinct identities with at least one connection.
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Run `f` over a room's members while holding the room's entry.
    pub(crate) fn with_room_members<R>(
        &self,
        room: &RoomId,
        f: impl FnOnce(&RoomMembers) -> R,
    ) -> Option<R> {
        self.rooms.get_mut(room).map(|members| f(&members))
    }

    /// Run `f` over every live connection.
    pub(crate) fn for_each_connection(
        &self,
        mut f: impl FnMut(ConnectionId, Option<UserId>, &mpsc::Sender<Outbound>),
    ) {
        for entry in &self.connections {
            if !entry.closing {
                f(*entry.key(), entry.user_id, &entry.sender);
            }
        }
    }

    /// Outbound queue of a live connection.
    pub(crate) fn sender_of(&self, id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.connections.get(&id).filter(|entry| !entry.closing).map(|entry| entry.sender.clone())
    }

    fn live_entry(
        &self,
        id: ConnectionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, ConnectionId, ConnectionEntry>, DeliveryError>
    {
        match self.connections.get_mut(&id) {
            Some(entry) if !entry.closing => Ok(entry),
            _ => Err(DeliveryError::NotFound(format!("connection {id}"))),
        }
    }
}
