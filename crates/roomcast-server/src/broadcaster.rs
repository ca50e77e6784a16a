//! Event fan-out to room members.
//!
//! Every event is serialized once into an [`Outbound`] and the same `Arc` is
//! queued on each recipient. Queues are bounded: a recipient whose queue is
//! full or closed is skipped, reported to the registry for cleanup, and never
//! blocks delivery to the other members.

use std::sync::Arc;

use roomcast_core::DeliveryError;
use roomcast_proto::{ConnectionId, Event, Outbound, RoomId, UserId};
use tokio::sync::mpsc::error::TrySendError;

use crate::registry::ConnectionRegistry;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the event was queued for
    pub delivered: usize,
    /// Recipients skipped because their queue was full or closed
    pub unreachable: Vec<ConnectionId>,
}

/// Routes events to rooms, pair channels, single connections or everyone.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Broadcaster over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `event` to every connection in `room`.
    pub fn broadcast_to_room(&self, room: &RoomId, event: Event) -> BroadcastReport {
        self.fan_out_room(room, Arc::new(event), |_| true)
    }

    /// Deliver `event` to every connection in `room` except those bound to
    /// `exclude`.
    pub fn broadcast_to_room_except(
        &self,
        room: &RoomId,
        event: Event,
        exclude: Option<UserId>,
    ) -> BroadcastReport {
        match exclude {
            Some(skip) => self.fan_out_room(room, Arc::new(event), |user| user != Some(skip)),
            None => self.broadcast_to_room(room, event),
        }
    }

    /// Deliver `event` to the connections of `a` and `b` in their pair
    /// channel. Nobody else receives it, even if present in the channel.
    pub fn broadcast_to_pair(&self, a: UserId, b: UserId, event: Event) -> BroadcastReport {
        self.broadcast_to_pair_except(a, b, event, None)
    }

    /// Pair delivery skipping the connections of `exclude`, typically the
    /// sender relaying to its peer.
    pub fn broadcast_to_pair_except(
        &self,
        a: UserId,
        b: UserId,
        event: Event,
        exclude: Option<UserId>,
    ) -> BroadcastReport {
        let room = RoomId::pair(a, b);
        self.fan_out_room(&room, Arc::new(event), |user| {
            user.is_some_and(|user| (user == a || user == b) && Some(user) != exclude)
        })
    }

    /// Deliver `event` to every live connection, anonymous ones included,
    /// optionally skipping one identity.
    pub fn broadcast_to_all(&self, event: Event, exclude: Option<UserId>) -> BroadcastReport {
        let event: Outbound = Arc::new(event);
        let mut report = BroadcastReport::default();

        self.registry.for_each_connection(|id, user, sender| {
            if exclude.is_some() && user == exclude {
                return;
            }
            push(&mut report, id, sender.try_send(Arc::clone(&event)));
        });

        self.settle(&report, None);
        report
    }

    /// Queue `event` for one connection.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::NotFound` if the connection is not registered
    /// - `DeliveryError::DeliveryUnreachable` if its queue is full or closed
    pub fn send_to_connection(&self, id: ConnectionId, event: Event) -> Result<(), DeliveryError> {
        let sender = self
            .registry
            .sender_of(id)
            .ok_or_else(|| DeliveryError::NotFound(format!("connection {id}")))?;

        match sender.try_send(Arc::new(event)) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(connection = %id, reason = send_failure(&e), "direct send dropped");
                self.registry.report_unreachable(id);
                Err(DeliveryError::DeliveryUnreachable(id))
            },
        }
    }

    fn fan_out_room(
        &self,
        room: &RoomId,
        event: Outbound,
        keep: impl Fn(Option<UserId>) -> bool,
    ) -> BroadcastReport {
        let report = self
            .registry
            .with_room_members(room, |members| {
                let mut report = BroadcastReport::default();
                for (id, member) in members.iter() {
                    if keep(member.user_id) {
                        push(&mut report, *id, member.sender.try_send(Arc::clone(&event)));
                    }
                }
                report
            })
            .unwrap_or_default();

        self.settle(&report, Some(room));
        report
    }

    /// Hand unreachable recipients to the registry, outside any room lock.
    fn settle(&self, report: &BroadcastReport, room: Option<&RoomId>) {
        for id in &report.unreachable {
            match room {
                Some(room) => tracing::warn!(connection = %id, %room, "recipient unreachable"),
                None => tracing::warn!(connection = %id, "recipient unreachable"),
            }
            self.registry.report_unreachable(*id);
        }
        tracing::trace!(delivered = report.delivered, "fan-out complete");
    }
}

fn push(report: &mut BroadcastReport, id: ConnectionId, result: Result<(), TrySendError<Outbound>>) {
    match result {
        Ok(()) => report.delivered += 1,
        Err(_) => report.unreachable.push(id),
    }
}

fn send_failure(err: &TrySendError<Outbound>) -> &'static str {
    match err {
        TrySendError::Full(_) => "queue full",
        TrySendError::Closed(_) => "queue closed",
    }
}
