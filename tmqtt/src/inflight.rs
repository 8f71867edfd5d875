//! QoS 1/2 handshake state of one connection.
//!
//! [`OutInflight`] tracks messages the broker sent and the client has not fully
//! acknowledged, in send order, and owns the packet identifier space of the outgoing
//! direction. [`InInflight`] is the receiver side of QoS 2: the ids of messages that
//! were delivered locally and wait for PUBREL.

use std::collections::BTreeSet;
use std::num::NonZeroU16;
use std::time::Duration;

use itertools::Itertools;
use rust_box::dequemap::DequeBTreeMap as DequeMap;
use serde::{Deserialize, Serialize};

use crate::types::{From, MqttError, PacketId, Publish, TimestampMillis};
use crate::utils::timestamp_millis;

type OutQueues = DequeMap<PacketId, OutInflightMessage>;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub enum MomentStatus {
    /// QoS 1, waiting for PUBACK.
    UnAck,
    /// QoS 2, waiting for PUBREC.
    UnReceived,
    /// QoS 2, PUBREL sent, waiting for PUBCOMP.
    UnComplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub from: From,
    pub status: MomentStatus,
    pub update_time: TimestampMillis,
    pub retries: u32,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: MomentStatus, from: From, publish: Publish) -> Self {
        Self { publish, from, status, update_time: timestamp_millis(), retries: 0 }
    }

    #[inline]
    fn update_status(&mut self, status: MomentStatus) {
        self.update_time = timestamp_millis();
        self.status = status;
    }

    /// Marks the message as sent again.
    #[inline]
    pub fn retried(&mut self) {
        self.update_time = timestamp_millis();
        self.retries += 1;
    }

    #[inline]
    pub fn timeout(&self, interval_millis: TimestampMillis) -> bool {
        interval_millis > 0 && ((timestamp_millis() - self.update_time) >= interval_millis)
    }

    #[inline]
    pub fn packet_id(&self) -> Option<PacketId> {
        self.publish.packet_id.map(|id| id.get())
    }
}

/// One bit per packet identifier; id 0 is never handed out.
struct PacketIds {
    bits: Box<[u64; 1024]>,
    next: u16,
    used: usize,
}

impl PacketIds {
    fn new() -> Self {
        Self { bits: Box::new([0; 1024]), next: 1, used: 0 }
    }

    #[inline]
    fn is_used(&self, id: u16) -> bool {
        self.bits[id as usize / 64] & (1 << (id % 64)) != 0
    }

    fn set(&mut self, id: u16) -> bool {
        if self.is_used(id) {
            return false;
        }
        self.bits[id as usize / 64] |= 1 << (id % 64);
        self.used += 1;
        true
    }

    fn clear(&mut self, id: u16) -> bool {
        if !self.is_used(id) {
            return false;
        }
        self.bits[id as usize / 64] &= !(1 << (id % 64));
        self.used -= 1;
        true
    }

    /// Next free id after the last one handed out, wrapping around.
    fn next_free(&mut self) -> Option<NonZeroU16> {
        if self.used >= u16::MAX as usize {
            return None;
        }
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if !self.is_used(id) {
                return NonZeroU16::new(id);
            }
        }
        None
    }
}

pub struct OutInflight {
    cap: usize,
    interval: TimestampMillis,
    queues: OutQueues,
    ids: PacketIds,
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize, retry_interval: Duration) -> Self {
        Self { cap, interval: retry_interval.as_millis() as TimestampMillis, queues: OutQueues::default(), ids: PacketIds::new() }
    }

    /// Time left until the oldest message must be retransmitted.
    #[inline]
    pub fn get_timeout(&self) -> Option<Duration> {
        if self.interval == 0 {
            return None;
        }
        self.queues.front().map(|(_, m)| {
            let t = (self.interval - (timestamp_millis() - m.update_time)).max(1);
            Duration::from_millis(t as u64)
        })
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.queues.get(&packet_id)
    }

    #[inline]
    pub fn front(&self) -> Option<(&PacketId, &OutInflightMessage)> {
        self.queues.front()
    }

    /// Takes the oldest message out if its retry interval elapsed. The caller
    /// retransmits it and pushes it back, which moves it to the end of the queue.
    #[inline]
    pub fn pop_front_timeout(&mut self) -> Option<OutInflightMessage> {
        match self.queues.front() {
            Some((_, m)) if m.timeout(self.interval) => self.queues.pop_front().map(|(_, m)| m),
            _ => None,
        }
    }

    /// Appends a sent message. The message must carry its packet id.
    pub fn push_back(&mut self, m: OutInflightMessage) -> Option<OutInflightMessage> {
        let Some(packet_id) = m.packet_id() else {
            log::warn!("packet_id is None, inflight message: {:?}", m);
            return None;
        };
        self.ids.set(packet_id);
        self.queues.insert(packet_id, m)
    }

    /// Removes a fully acknowledged message and frees its packet id.
    #[inline]
    pub fn remove(&mut self, packet_id: &PacketId) -> Option<OutInflightMessage> {
        let m = self.queues.remove(packet_id);
        if m.is_some() {
            self.ids.clear(*packet_id);
        }
        m
    }

    #[inline]
    pub fn update_status(&mut self, packet_id: &PacketId, s: MomentStatus) -> bool {
        if let Some(m) = self.queues.get_mut(packet_id) {
            m.update_status(s);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.queues.contains_key(packet_id)
    }

    /// Whether the send window has room and a packet id is free.
    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap && self.ids.used < u16::MAX as usize
    }

    /// Next packet id not held by an unacknowledged message.
    #[inline]
    pub fn next_id(&mut self) -> Result<NonZeroU16, MqttError> {
        self.ids.next_free().ok_or_else(|| MqttError::SendError("no packet id available".into()))
    }

    /// Drains all messages in send order.
    pub fn to_inflight_messages(&mut self) -> Vec<OutInflightMessage> {
        let mut inflight_messages = Vec::new();
        while let Some((packet_id, msg)) = self.queues.pop_front() {
            self.ids.clear(packet_id);
            inflight_messages.push(msg);
        }
        inflight_messages
    }

    pub fn clone_inflight_messages(&self) -> Vec<OutInflightMessage> {
        self.queues.iter().map(|(_, msg)| msg.clone()).collect_vec()
    }
}

/// Ids of QoS 2 messages received and delivered, waiting for PUBREL.
#[derive(Debug, Default)]
pub struct InInflight {
    cached: BTreeSet<NonZeroU16>,
    max_inflight: usize,
}

impl InInflight {
    pub fn new(max_inflight: u16) -> Self {
        Self { cached: BTreeSet::default(), max_inflight: max_inflight as usize }
    }

    /// Restores ids saved with the session.
    pub fn restore(&mut self, ids: impl IntoIterator<Item = NonZeroU16>) {
        self.cached.extend(ids);
    }

    /// Records a received QoS 2 id. Returns false for a retransmission of a message that
    /// was already delivered.
    #[inline]
    pub fn add(&mut self, pid: NonZeroU16) -> Result<bool, MqttError> {
        if self.cached.contains(&pid) {
            return Ok(false);
        }
        if self.cached.len() >= self.max_inflight {
            return Err(MqttError::ReceiveMaximumExceeded);
        }
        self.cached.insert(pid);
        Ok(true)
    }

    #[inline]
    pub fn remove(&mut self, pid: &NonZeroU16) -> bool {
        self.cached.remove(pid)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }

    pub fn ids(&self) -> Vec<NonZeroU16> {
        self.cached.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::{ClientId, Id, QoS};

    fn message(inflight: &mut OutInflight, topic: &'static str) -> OutInflightMessage {
        let mut p = Publish::new(topic, Bytes::from_static(b"x"), QoS::AtLeastOnce, false);
        p.packet_id = Some(inflight.next_id().unwrap());
        OutInflightMessage::new(MomentStatus::UnAck, From::from_custom(Id::new(0, 1, ClientId::from_static("c"), None, None)), p)
    }

    #[test]
    fn packet_ids_skip_outstanding_and_wrap() {
        let mut ids = PacketIds::new();
        assert_eq!(ids.next_free().map(|id| id.get()), Some(1));
        assert!(ids.set(2));
        assert!(!ids.set(2));
        assert_eq!(ids.next_free().map(|id| id.get()), Some(3));

        ids.next = u16::MAX;
        assert_eq!(ids.next_free().map(|id| id.get()), Some(u16::MAX));
        assert_eq!(ids.next_free().map(|id| id.get()), Some(1));
        assert_eq!(ids.next_free().map(|id| id.get()), Some(3));
        assert!(ids.clear(2));
        assert!(!ids.clear(2));
    }

    #[test]
    fn packet_id_exhaustion() {
        let mut ids = PacketIds::new();
        for id in 1..=u16::MAX {
            assert!(ids.set(id));
        }
        assert_eq!(ids.next_free(), None);
        ids.clear(777);
        assert_eq!(ids.next_free().map(|id| id.get()), Some(777));
    }

    #[test]
    fn ordered_window() {
        let mut inflight = OutInflight::new(2, Duration::from_secs(10));
        let m1 = message(&mut inflight, "a");
        inflight.push_back(m1.clone());
        let m2 = message(&mut inflight, "b");
        inflight.push_back(m2.clone());
        assert!(!inflight.has_credit());
        assert_eq!(inflight.get_timeout().map(|t| t <= Duration::from_secs(10)), Some(true));
        assert!(inflight.pop_front_timeout().is_none());

        assert!(inflight.update_status(&2, MomentStatus::UnComplete));
        assert_eq!(inflight.remove(&1).map(|m| m.publish.topic), Some("a".into()));
        assert!(inflight.has_credit());
        assert_eq!(inflight.clone_inflight_messages().len(), 1);

        let drained = inflight.to_inflight_messages();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].status, MomentStatus::UnComplete);
        assert!(inflight.is_empty());
    }

    #[test]
    fn retry_moves_to_back() {
        let mut inflight = OutInflight::new(10, Duration::from_millis(1));
        let m1 = message(&mut inflight, "a");
        inflight.push_back(m1);
        let m2 = message(&mut inflight, "b");
        inflight.push_back(m2);
        std::thread::sleep(Duration::from_millis(5));

        let mut m = inflight.pop_front_timeout().unwrap();
        assert_eq!(m.publish.topic, "a");
        m.retried();
        inflight.push_back(m);
        assert_eq!(inflight.front().map(|(id, _)| *id), Some(2));
        assert_eq!(inflight.get(1).map(|m| m.retries), Some(1));
    }

    #[test]
    fn qos2_receiver_dedupe() {
        let mut in_inflight = InInflight::new(2);
        let id = |v| NonZeroU16::new(v).unwrap();
        assert_eq!(in_inflight.add(id(1)), Ok(true));
        assert_eq!(in_inflight.add(id(1)), Ok(false));
        assert_eq!(in_inflight.add(id(2)), Ok(true));
        assert_eq!(in_inflight.add(id(3)), Err(MqttError::ReceiveMaximumExceeded));
        assert!(in_inflight.remove(&id(1)));
        assert!(!in_inflight.remove(&id(1)));
        assert_eq!(in_inflight.ids(), vec![id(2)]);

        let mut restored = InInflight::new(2);
        restored.restore(in_inflight.ids());
        assert_eq!(restored.add(id(2)), Ok(false));
    }
}
