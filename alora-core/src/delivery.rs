//! Reliable delivery: bounded pool of in-flight sends with capped exponential backoff,
//! one-shot discovery escalation, and exhaustion.
//!
//! The pool never transmits by itself. The engine asks for the next due slot, decides
//! whether airtime allows a transmission, then reports back with `record_attempt` or
//! `defer`.

use serde::{Deserialize, Serialize};

use crate::packet::{NodeAddr, WireChatPacket};

/// Concurrent outbound messages.
pub const MAX_PENDING: usize = 4;

/// True once `now` has reached `deadline` on a wrapping millisecond clock.
pub(crate) fn time_reached(now_ms: u32, deadline_ms: u32) -> bool {
    (now_ms.wrapping_sub(deadline_ms) as i32) >= 0
}

/// Retry tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Wait after the first transmission.
    pub base_delay_ms: u32,
    /// Backoff cap.
    pub max_delay_ms: u32,
    /// Transmissions before the send is abandoned.
    pub max_attempts: u8,
    /// Unacknowledged transmissions before one Discovery probe is issued.
    pub discovery_after_attempts: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_500,
            max_delay_ms: 30_000,
            max_attempts: 5,
            discovery_after_attempts: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after transmission number `attempt` (1-based): doubles each attempt,
    /// capped at `max_delay_ms`.
    pub fn retry_delay_ms(&self, attempt: u8) -> u32 {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let delay = (self.base_delay_ms as u64) << shift;
        delay.min(self.max_delay_ms as u64) as u32
    }
}

/// Index of a slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(usize);

/// One in-flight outbound message. The packet is a private copy, resent verbatim.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub dst: NodeAddr,
    pub attempts: u8,
    pub discovery_sent: bool,
    pub last_send_ms: u32,
    pub next_send_ms: u32,
    pub packet: WireChatPacket,
}

impl PendingSend {
    pub fn msg_id(&self) -> u32 {
        self.packet.msg_id
    }
}

/// What the engine should do with a due slot.
#[derive(Debug)]
pub enum Step {
    /// Transmit (again). `escalate` asks for a Discovery probe first.
    Send {
        slot: SlotHandle,
        dst: NodeAddr,
        attempt: u8,
        escalate: bool,
    },
    /// Attempts used up. The slot has been freed.
    Exhausted(PendingSend),
}

/// Fixed-capacity pending-send pool.
pub struct DeliveryQueue {
    policy: RetryPolicy,
    slots: [Option<PendingSend>; MAX_PENDING],
}

impl DeliveryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            slots: Default::default(),
        }
    }

    /// Enqueue a packet for `dst`; it is due immediately. Fails when every slot is in use.
    pub fn submit(
        &mut self,
        dst: NodeAddr,
        packet: WireChatPacket,
        now_ms: u32,
    ) -> Result<SlotHandle, DeliveryError> {
        debug_assert!(
            !self.slots.iter().flatten().any(|s| s.msg_id() == packet.msg_id),
            "msg id already in flight"
        );
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(DeliveryError::Busy)?;
        self.slots[idx] = Some(PendingSend {
            dst,
            attempts: 0,
            discovery_sent: false,
            last_send_ms: now_ms,
            next_send_ms: now_ms,
            packet,
        });
        Ok(SlotHandle(idx))
    }

    /// First slot whose deadline has passed, classified. Exhausted slots are removed here.
    pub fn next_due(&mut self, now_ms: u32) -> Option<Step> {
        let idx = self
            .slots
            .iter()
            .position(|s| matches!(s, Some(s) if time_reached(now_ms, s.next_send_ms)))?;
        let max_attempts = self.policy.max_attempts;
        let escalate_after = self.policy.discovery_after_attempts;
        let slot = self.slots[idx].as_ref()?;
        if slot.attempts >= max_attempts {
            return self.slots[idx].take().map(Step::Exhausted);
        }
        Some(Step::Send {
            slot: SlotHandle(idx),
            dst: slot.dst,
            attempt: slot.attempts + 1,
            escalate: !slot.discovery_sent && slot.attempts >= escalate_after,
        })
    }

    pub fn packet(&self, slot: SlotHandle) -> Option<&WireChatPacket> {
        self.slots.get(slot.0)?.as_ref().map(|s| &s.packet)
    }

    /// The slot's packet went out: count it and schedule the next retry.
    pub fn record_attempt(&mut self, slot: SlotHandle, now_ms: u32) {
        let policy = self.policy;
        if let Some(s) = self.slots.get_mut(slot.0).and_then(Option::as_mut) {
            s.attempts = s.attempts.saturating_add(1);
            s.last_send_ms = now_ms;
            s.next_send_ms = now_ms.wrapping_add(policy.retry_delay_ms(s.attempts));
        }
    }

    pub fn mark_discovery_sent(&mut self, slot: SlotHandle) {
        if let Some(s) = self.slots.get_mut(slot.0).and_then(Option::as_mut) {
            s.discovery_sent = true;
        }
    }

    /// Transmission was not possible (airtime): try again at `until` without using an attempt.
    pub fn defer(&mut self, slot: SlotHandle, until_ms: u32) {
        if let Some(s) = self.slots.get_mut(slot.0).and_then(Option::as_mut) {
            s.next_send_ms = until_ms;
        }
    }

    /// Ack arrived from `src` for `ref_msg_id`. Clears and returns the matching slot only.
    pub fn on_ack(&mut self, src: NodeAddr, ref_msg_id: u32) -> Option<PendingSend> {
        let idx = self.slots.iter().position(
            |s| matches!(s, Some(s) if s.dst == src && s.packet.msg_id == ref_msg_id),
        )?;
        self.slots[idx].take()
    }

    /// Abandon the send of `msg_id` to `dst` (superseded or forgotten). Returns it if present.
    pub fn cancel(&mut self, dst: NodeAddr, msg_id: u32) -> Option<PendingSend> {
        self.on_ack(dst, msg_id)
    }

    pub fn pending_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSend> + '_ {
        self.slots.iter().flatten()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no free pending-send slot")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;

    fn chat(msg_id: u32, dst: NodeAddr) -> WireChatPacket {
        let mut pkt = WireChatPacket::new(PacketKind::Chat, msg_id, 1, dst);
        pkt.set_text(b"ping");
        pkt
    }

    /// Drive a slot with no acks; returns (send times, discovery count, exhausted at).
    fn run_unacked(queue: &mut DeliveryQueue) -> (Vec<u32>, usize, Option<u32>) {
        let mut sends = Vec::new();
        let mut discoveries = 0;
        let mut exhausted = None;
        for now in (0..200_000u32).step_by(100) {
            while let Some(step) = queue.next_due(now) {
                match step {
                    Step::Send { slot, escalate, .. } => {
                        if escalate {
                            discoveries += 1;
                            queue.mark_discovery_sent(slot);
                        }
                        sends.push(now);
                        queue.record_attempt(slot, now);
                    }
                    Step::Exhausted(_) => exhausted = Some(now),
                }
            }
        }
        (sends, discoveries, exhausted)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.retry_delay_ms(1), 2_500);
        assert_eq!(p.retry_delay_ms(2), 5_000);
        assert_eq!(p.retry_delay_ms(4), 20_000);
        assert_eq!(p.retry_delay_ms(5), 30_000);
        assert_eq!(p.retry_delay_ms(200), 30_000);
    }

    #[test]
    fn unacked_send_backs_off_escalates_once_then_exhausts() {
        let mut queue = DeliveryQueue::default();
        queue.submit(2, chat(7, 2), 0).unwrap();
        let (sends, discoveries, exhausted) = run_unacked(&mut queue);

        assert_eq!(sends.len(), RetryPolicy::default().max_attempts as usize);
        let gaps: Vec<u32> = sends.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[1] > g[0]), "gaps {:?}", gaps);
        assert_eq!(discoveries, 1);
        let exhausted = exhausted.expect("slot exhausted");
        assert!(exhausted > *sends.last().unwrap());
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.next_due(u32::MAX / 2).is_none());
    }

    #[test]
    fn escalation_happens_after_threshold() {
        let mut queue = DeliveryQueue::default();
        let slot = queue.submit(2, chat(7, 2), 0).unwrap();
        for (now, expect_escalate) in [(0, false), (2_500, false), (7_500, true)] {
            match queue.next_due(now) {
                Some(Step::Send { escalate, .. }) => assert_eq!(escalate, expect_escalate),
                other => panic!("expected send at {}, got {:?}", now, other),
            }
            if expect_escalate {
                queue.mark_discovery_sent(slot);
            }
            queue.record_attempt(slot, now);
        }
    }

    #[test]
    fn ack_clears_only_matching_slot() {
        let mut queue = DeliveryQueue::default();
        queue.submit(2, chat(10, 2), 0).unwrap();
        queue.submit(3, chat(11, 3), 0).unwrap();
        queue.submit(2, chat(12, 2), 0).unwrap();

        assert!(queue.on_ack(3, 10).is_none(), "wrong source");
        assert!(queue.on_ack(2, 99).is_none(), "unknown id");
        let cleared = queue.on_ack(2, 10).unwrap();
        assert_eq!(cleared.msg_id(), 10);
        assert_eq!(queue.pending_count(), 2);
        let left: Vec<u32> = queue.pending().map(|s| s.msg_id()).collect();
        assert_eq!(left, vec![11, 12]);
        assert!(queue.on_ack(2, 10).is_none(), "already cleared");
    }

    #[test]
    fn cancelled_send_is_never_retried() {
        let mut queue = DeliveryQueue::default();
        queue.submit(2, chat(10, 2), 0).unwrap();
        queue.submit(2, chat(11, 2), 0).unwrap();
        assert!(queue.cancel(2, 11).is_some());
        assert!(queue.cancel(2, 11).is_none());
        let ids: Vec<u32> = std::iter::from_fn(|| match queue.next_due(0) {
            Some(Step::Send { slot, .. }) => {
                let id = queue.packet(slot).map(|p| p.msg_id);
                queue.record_attempt(slot, 0);
                id
            }
            _ => None,
        })
        .collect();
        assert_eq!(ids, vec![10]);
    }

    #[test]
    fn full_pool_is_busy() {
        let mut queue = DeliveryQueue::default();
        for id in 0..MAX_PENDING as u32 {
            queue.submit(2, chat(id, 2), 0).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.submit(2, chat(99, 2), 0), Err(DeliveryError::Busy));
        queue.on_ack(2, 0).unwrap();
        assert!(queue.submit(2, chat(99, 2), 0).is_ok());
    }

    #[test]
    fn defer_does_not_consume_attempt() {
        let mut queue = DeliveryQueue::default();
        let slot = queue.submit(2, chat(1, 2), 0).unwrap();
        assert!(matches!(queue.next_due(0), Some(Step::Send { attempt: 1, .. })));
        queue.defer(slot, 5_000);
        assert!(queue.next_due(4_999).is_none());
        assert!(matches!(queue.next_due(5_000), Some(Step::Send { attempt: 1, .. })));
    }

    #[test]
    fn deadlines_survive_clock_wrap() {
        assert!(time_reached(5, u32::MAX - 5));
        assert!(!time_reached(u32::MAX - 5, 5));
        assert!(time_reached(100, 100));
    }
}
