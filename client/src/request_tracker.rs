// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Packet-id allocation, outstanding-request bookkeeping, and timeout-driven
//! retransmission for SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (`QoS` > 0).
//!
//! `send`/`on_complete` are not stored as opaque function pointers here, as
//! spec.md's data model narrates them; instead each [`OutstandingRequest`]
//! stores the concrete protocol operation it was allocated for, since those
//! are the only three operations a packet id is ever allocated for. This
//! keeps retransmission (re-deriving wire bytes with `DUP=1`) and
//! `on_complete` dispatch (a boxed `FnOnce` carrying the caller's opaque
//! user data) in one place without a layer of indirection spec.md leaves
//! unspecified.

use std::collections::HashMap;

use mqtt_codec::v3::{PublishPacket, SubscribeTopic};
use mqtt_codec::{EncodePacket, PacketId};

use crate::error::{Error, ErrorKind};
use crate::packet_id::PacketIdAllocator;

/// The protocol operation an outstanding packet id was allocated for.
///
/// `Subscribe`/`Unsubscribe` store the request payload rather than a
/// pre-built `SubscribePacket`/`UnsubscribePacket`, since the packet id is
/// only known once [`RequestTracker::create_request`] has allocated it —
/// after the packet would otherwise need to have been constructed. The
/// packet is assembled fresh on every `encode` call instead.
pub(crate) enum PendingOperation {
    /// `QoS` 1: completes on PUBACK. `QoS` 2: moves to `AwaitingComplete` on
    /// PUBREC instead of completing outright.
    Publish(PublishPacket),
    Subscribe(Vec<SubscribeTopic>),
    Unsubscribe(Vec<String>),
    /// `QoS` 2 publish that has received its PUBREC and sent PUBREL; waits
    /// for PUBCOMP. Retransmission of PUBREL does not set `DUP`.
    AwaitingComplete,
}

impl PendingOperation {
    /// Encodes the bytes to put on the wire for this attempt, stamping `id`
    /// onto the packet. `first_attempt` selects whether a retransmitted
    /// PUBLISH carries `DUP=1`.
    fn encode(&self, first_attempt: bool, id: PacketId) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        match self {
            Self::Publish(packet) => {
                let mut packet = packet.clone();
                packet.set_packet_id(id);
                if !first_attempt {
                    packet.set_dup(true)?;
                }
                packet.encode(&mut buf)?;
            }
            Self::Subscribe(topics) => {
                mqtt_codec::v3::SubscribePacket::new(id, topics.clone())?.encode(&mut buf)?;
            }
            Self::Unsubscribe(filters) => {
                let refs: Vec<&str> = filters.iter().map(String::as_str).collect();
                mqtt_codec::v3::UnsubscribePacket::new(id, &refs)?.encode(&mut buf)?;
            }
            Self::AwaitingComplete => {
                mqtt_codec::v3::PublishReleasePacket::new(id).encode(&mut buf)?;
            }
        }
        Ok(buf)
    }
}

pub(crate) struct OutstandingRequest {
    operation: PendingOperation,
    /// `None` once `dispatched` by an offline-queue drain or the first send.
    sent: bool,
    completed: bool,
    on_complete: Option<Box<dyn FnOnce(Result<(), Error>) + Send>>,
}

/// Owns the packet-id allocator and the table of in-flight requests.
///
/// All methods are meant to be called with the connection's single
/// request-tracker mutex held for the duration of the call; see spec.md §5.
pub(crate) struct RequestTracker {
    allocator: PacketIdAllocator,
    inflight: HashMap<u16, OutstandingRequest>,
    /// FIFO of ids allocated while not `Connected`, awaiting a drain.
    offline_queue: std::collections::VecDeque<u16>,
}

impl RequestTracker {
    pub(crate) fn new() -> Self {
        Self {
            allocator: PacketIdAllocator::new(),
            inflight: HashMap::new(),
            offline_queue: std::collections::VecDeque::new(),
        }
    }

    /// Allocates an id and registers `operation`. If `connected` is true the
    /// caller is expected to transmit the returned bytes immediately and arm
    /// a retry timer; if false the request is parked on the offline queue
    /// for [`RequestTracker::drain_offline_queue`] to dispatch later, per
    /// spec.md §4.C "Offline".
    pub(crate) fn create_request(
        &mut self,
        operation: PendingOperation,
        connected: bool,
        on_complete: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) -> Result<(PacketId, Option<Vec<u8>>), Error> {
        let id = self
            .allocator
            .allocate()
            .ok_or_else(|| Error::new(ErrorKind::NoPacketIds, "all 65535 packet ids in flight"))?;

        let bytes = if connected {
            let bytes = operation.encode(true, PacketId::new(id))?;
            Some(bytes)
        } else {
            self.offline_queue.push_back(id);
            None
        };

        self.inflight.insert(
            id,
            OutstandingRequest {
                operation,
                sent: connected,
                completed: false,
                on_complete: Some(Box::new(on_complete)),
            },
        );

        Ok((PacketId::new(id), bytes))
    }

    /// Drains the offline queue in FIFO order, returning `(id, bytes)` pairs
    /// ready to transmit now that the connection is `Connected`.
    pub(crate) fn drain_offline_queue(&mut self) -> Result<Vec<(PacketId, Vec<u8>)>, Error> {
        let mut drained = Vec::with_capacity(self.offline_queue.len());
        while let Some(id) = self.offline_queue.pop_front() {
            if let Some(req) = self.inflight.get_mut(&id) {
                let bytes = req.operation.encode(true, PacketId::new(id))?;
                req.sent = true;
                drained.push((PacketId::new(id), bytes));
            }
        }
        Ok(drained)
    }

    /// Re-encodes every still-outstanding, already-sent request with `DUP=1`
    /// (where applicable), in ascending id order. Called once on entering
    /// `Connected` after a reconnect, per spec.md §4.D's "unacked QoS>0
    /// PUBLISHes are re-sent with `DUP=1`" — unlike [`Self::fail_all`], these
    /// requests are not completed; they simply get another attempt.
    pub(crate) fn resend_in_flight(&mut self) -> Result<Vec<(PacketId, Vec<u8>)>, Error> {
        let mut ids: Vec<u16> = self
            .inflight
            .iter()
            .filter(|(_, req)| req.sent && !req.completed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        let mut resent = Vec::with_capacity(ids.len());
        for id in ids {
            let req = self.inflight.get_mut(&id).expect("id taken from inflight keys");
            let bytes = req.operation.encode(false, PacketId::new(id))?;
            resent.push((PacketId::new(id), bytes));
        }
        Ok(resent)
    }

    /// Re-encodes the retransmission (`DUP=1` for PUBLISH) for `id`, if it
    /// is still outstanding and not yet completed. Returns `None` if the ack
    /// already arrived or the timer lost the race — the caller should treat
    /// that as "nothing to do", not an error.
    pub(crate) fn retransmit(&mut self, id: u16) -> Result<Option<Vec<u8>>, Error> {
        let Some(req) = self.inflight.get_mut(&id) else {
            return Ok(None);
        };
        if req.completed {
            return Ok(None);
        }
        let bytes = req.operation.encode(false, PacketId::new(id))?;
        Ok(Some(bytes))
    }

    /// Handles an inbound PUBACK/UNSUBACK/SUBACK for `id`: completes the
    /// request. A late ack for an id no longer in the table is a silent
    /// drop, matching spec.md's idempotency contract.
    pub(crate) fn complete(&mut self, id: u16, result: Result<(), Error>) {
        if let Some(mut req) = self.inflight.remove(&id) {
            if !req.completed {
                req.completed = true;
                if let Some(cb) = req.on_complete.take() {
                    cb(result);
                }
            }
            self.allocator.release(id);
        }
    }

    /// Handles an inbound PUBREC for a `QoS` 2 publish: moves the request to
    /// `AwaitingComplete` and returns the PUBREL bytes to send, without
    /// completing the request yet. Returns `None` if `id` is unknown, already
    /// past this stage, or the operation was never a PUBLISH.
    pub(crate) fn received(&mut self, id: u16) -> Result<Option<Vec<u8>>, Error> {
        let Some(req) = self.inflight.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(req.operation, PendingOperation::Publish(_)) {
            return Ok(None);
        }
        req.operation = PendingOperation::AwaitingComplete;
        let bytes = req.operation.encode(true, PacketId::new(id))?;
        Ok(Some(bytes))
    }

    /// Fails every outstanding request with `error`, in no particular order,
    /// and clears the table — used on disconnect per spec.md §7 ("Disconnect
    /// cancels all timers and fails all in-flight requests with
    /// `Disconnected` before releasing them").
    pub(crate) fn fail_all(&mut self, error: &Error) {
        for (id, mut req) in self.inflight.drain() {
            if !req.completed {
                req.completed = true;
                if let Some(cb) = req.on_complete.take() {
                    cb(Err(error.clone()));
                }
            }
            self.allocator.release(id);
        }
        self.offline_queue.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_codec::QoS;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn publish_op(topic: &str) -> PendingOperation {
        PendingOperation::Publish(PublishPacket::new(topic, QoS::AtLeastOnce, b"hi").unwrap())
    }

    #[test]
    fn create_request_while_connected_sends_immediately() {
        let mut tracker = RequestTracker::new();
        let (id, bytes) = tracker
            .create_request(publish_op("a/b"), true, |_| {})
            .unwrap();
        assert_ne!(id.value(), 0);
        assert!(bytes.is_some());
    }

    #[test]
    fn create_request_while_offline_defers_send() {
        let mut tracker = RequestTracker::new();
        let (id, bytes) = tracker
            .create_request(publish_op("a/b"), false, |_| {})
            .unwrap();
        assert!(bytes.is_none());

        let drained = tracker.drain_offline_queue().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, id);
    }

    #[test]
    fn complete_runs_callback_exactly_once() {
        let mut tracker = RequestTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let (id, _) = tracker
            .create_request(publish_op("a/b"), true, move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tracker.complete(id.value(), Ok(()));
        // A duplicate/late ack for the same id is now a no-op.
        tracker.complete(id.value(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn late_ack_for_unknown_id_is_silently_dropped() {
        let mut tracker = RequestTracker::new();
        tracker.complete(999, Ok(())); // must not panic
    }

    #[test]
    fn retransmit_sets_dup_and_keeps_same_id() {
        let mut tracker = RequestTracker::new();
        let (id, first_bytes) = tracker
            .create_request(publish_op("a/b"), true, |_| {})
            .unwrap();
        let retry_bytes = tracker.retransmit(id.value()).unwrap().unwrap();
        assert_ne!(first_bytes.unwrap(), retry_bytes);
        // DUP bit (0x08 in the fixed-header flags nibble) is now set.
        assert_eq!(retry_bytes[0] & 0b0000_1000, 0b0000_1000);
    }

    #[test]
    fn retransmit_after_completion_is_a_noop() {
        let mut tracker = RequestTracker::new();
        let (id, _) = tracker
            .create_request(publish_op("a/b"), true, |_| {})
            .unwrap();
        tracker.complete(id.value(), Ok(()));
        assert_eq!(tracker.retransmit(id.value()).unwrap(), None);
    }

    #[test]
    fn qos2_does_not_complete_on_pubrec() {
        let mut tracker = RequestTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut packet = PublishPacket::new("a/b", QoS::ExactlyOnce, b"hi").unwrap();
        packet.set_packet_id(PacketId::new(1));
        let (id, _) = tracker
            .create_request(PendingOperation::Publish(packet), true, move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let pubrel_bytes = tracker.received(id.value()).unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0, "PUBREC must not complete the request");
        assert!(!tracker.is_empty());

        tracker.complete(id.value(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let _ = pubrel_bytes;
    }

    #[test]
    fn resend_in_flight_sets_dup_and_skips_offline_and_completed() {
        let mut tracker = RequestTracker::new();
        let (sent_id, _) = tracker
            .create_request(publish_op("a/b"), true, |_| {})
            .unwrap();
        let (offline_id, _) = tracker
            .create_request(publish_op("c/d"), false, |_| {})
            .unwrap();
        let (done_id, _) = tracker
            .create_request(publish_op("e/f"), true, |_| {})
            .unwrap();
        tracker.complete(done_id.value(), Ok(()));

        let resent = tracker.resend_in_flight().unwrap();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].0, sent_id);
        assert_eq!(resent[0].1[0] & 0b0000_1000, 0b0000_1000);
        let _ = offline_id;
    }

    #[test]
    fn offline_request_is_dispatched_exactly_once_on_reconnect() {
        // Regression test for the reconnect sequence: `resend_in_flight` must
        // run before `drain_offline_queue`, because the latter flips `sent`
        // to `true` for every id it dispatches. Calling them in the wrong
        // order would make the resend pass pick the same ids back up and
        // put them on the wire a second time with DUP set.
        let mut tracker = RequestTracker::new();
        let (offline_id, bytes) = tracker
            .create_request(publish_op("a/b"), false, |_| {})
            .unwrap();
        assert!(bytes.is_none());

        let resent = tracker.resend_in_flight().unwrap();
        assert!(resent.is_empty(), "an undispatched offline request must not be resent");

        let drained = tracker.drain_offline_queue().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, offline_id);

        let resent_again = tracker.resend_in_flight().unwrap();
        assert!(
            resent_again.is_empty(),
            "a request drained this reconnect must not also be resent this reconnect"
        );
    }

    #[test]
    fn fail_all_completes_every_outstanding_request_with_error() {
        let mut tracker = RequestTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls2 = calls.clone();
            tracker
                .create_request(publish_op("a/b"), true, move |result| {
                    assert!(result.is_err());
                    calls2.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let err = Error::new(ErrorKind::Disconnected, "connection closed");
        tracker.fail_all(&err);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(tracker.is_empty());
    }
}
