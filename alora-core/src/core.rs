//! Host-driven engine: AloraCore receives packets, ticks and user sends from the host,
//! transmits through the `Radio` collaborator and queues UI events.

use std::sync::Arc;

use heapless::Deque;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

use crate::airtime::{AirtimeBudget, LinkCounters};
use crate::config::Config;
use crate::dedupe::DedupeCache;
use crate::delivery::{DeliveryError, DeliveryQueue, PendingSend, SlotHandle, Step};
use crate::packet::{NodeAddr, PacketKind, WireChatPacket, BROADCAST_ADDR, TEXT_CAPACITY};
use crate::pairing::{PairingError, PairingStore};
use crate::radio::Radio;
use crate::secure;
use crate::sequence::MsgIdAllocator;
use crate::storage::Storage;
use crate::wire::PACKET_LEN;

/// UI events held until the host drains them.
pub const EVENT_QUEUE_LEN: usize = 16;

/// Payload copy carried by events.
pub type MessageText = heapless::Vec<u8, TEXT_CAPACITY>;

/// Outcome of a pairing handshake, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    /// We sent a PairRequest.
    Requested,
    /// A key is now shared with the peer.
    Accepted,
    /// No free key slot, or our request went unanswered.
    Failed,
}

/// Event for the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Delivered {
        to: NodeAddr,
        msg_id: u32,
    },
    /// Attempts exhausted without an Ack. Not retried again.
    DeliveryFailed {
        to: NodeAddr,
        msg_id: u32,
    },
    Incoming {
        from: NodeAddr,
        msg_id: u32,
        ts: u32,
        text: MessageText,
        secure: bool,
    },
    Presence {
        peer: NodeAddr,
        rssi: i16,
        snr: f32,
        status: MessageText,
    },
    Pairing {
        peer: NodeAddr,
        outcome: PairingOutcome,
    },
}

/// Main coordinator. Host passes packets, ticks and sends; core drives the radio.
pub struct AloraCore<S: Storage> {
    local: NodeAddr,
    config: Config,
    storage: S,
    pairing: PairingStore,
    delivery: DeliveryQueue,
    dedupe: DedupeCache,
    airtime: AirtimeBudget,
    ids: MsgIdAllocator,
    counters: Arc<LinkCounters>,
    events: Deque<Event, EVENT_QUEUE_LEN>,
    rng: StdRng,
    last_presence_ms: u32,
}

impl<S: Storage> AloraCore<S> {
    pub fn new(local: NodeAddr, storage: S, config: Config) -> Self {
        Self::with_rng(local, storage, config, StdRng::from_entropy())
    }

    /// Deterministic nonces (tests, simulations).
    pub fn with_seed(local: NodeAddr, storage: S, config: Config, seed: u64) -> Self {
        Self::with_rng(local, storage, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(local: NodeAddr, storage: S, config: Config, rng: StdRng) -> Self {
        Self {
            local,
            pairing: PairingStore::new(local),
            delivery: DeliveryQueue::new(config.retry),
            dedupe: DedupeCache::new(config.dedupe_horizon_ms),
            airtime: AirtimeBudget::new(
                config.lora,
                config.airtime_budget_ms,
                config.airtime_window_ms,
            ),
            ids: MsgIdAllocator::new(),
            counters: Arc::new(LinkCounters::default()),
            events: Deque::new(),
            rng,
            last_presence_ms: 0,
            config,
            storage,
        }
    }

    /// Load persisted pairing state and the message-id lease. Returns paired peer count.
    pub fn begin(&mut self) -> usize {
        self.ids.begin(&mut self.storage);
        let peers = self.pairing.begin(&mut self.storage);
        info!(local = self.local, peers, "alora core started");
        peers
    }

    pub fn local_address(&self) -> NodeAddr {
        self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Send text to `dst`, encrypted when a key is shared with it. Returns the msg id.
    pub fn send_chat(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        dst: NodeAddr,
        text: &[u8],
    ) -> Result<u32, EngineError> {
        if self.pairing.has_key(dst) {
            self.send_secure(radio, now_ms, dst, text)
        } else {
            self.send_plain(radio, now_ms, dst, text)
        }
    }

    pub fn send_plain(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        dst: NodeAddr,
        text: &[u8],
    ) -> Result<u32, EngineError> {
        check_text(text)?;
        self.ensure_slot()?;
        let mut pkt = self.new_packet(PacketKind::Chat, dst, now_ms);
        pkt.set_text(text);
        self.enqueue(radio, now_ms, dst, pkt)
    }

    /// Send encrypted text. Fails with `NoKey` until pairing with `dst` completed.
    pub fn send_secure(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        dst: NodeAddr,
        text: &[u8],
    ) -> Result<u32, EngineError> {
        check_text(text)?;
        let key = self.pairing.load_key(dst).ok_or(EngineError::NoKey(dst))?;
        self.ensure_slot()?;
        let mut pkt = self.new_packet(PacketKind::SecureChat, dst, now_ms);
        pkt.nonce = self.rng.next_u32();
        pkt.set_text(text);
        secure::encrypt(&key, self.local, dst, pkt.nonce, pkt.msg_id, pkt.text_mut());
        self.enqueue(radio, now_ms, dst, pkt)
    }

    /// Start a pairing handshake with `peer`. The request is retried like a chat message
    /// until a PairAccept arrives or attempts run out. A request still outstanding to the
    /// same peer is superseded and stops being retried.
    pub fn request_pairing(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        peer: NodeAddr,
    ) -> Result<u32, EngineError> {
        if let Some(old) = self.pairing.pending_request_id(peer) {
            if self.delivery.cancel(peer, old).is_some() {
                debug!(peer, msg_id = old, "pair request superseded");
            }
        }
        self.ensure_slot()?;
        let mut pkt = self.new_packet(PacketKind::PairRequest, peer, now_ms);
        pkt.nonce = self.rng.next_u32();
        self.pairing
            .record_outgoing_request(peer, pkt.msg_id, pkt.nonce)
            .map_err(|_| EngineError::Busy)?;
        let msg_id = self.enqueue(radio, now_ms, peer, pkt)?;
        self.push_event(Event::Pairing {
            peer,
            outcome: PairingOutcome::Requested,
        });
        Ok(msg_id)
    }

    /// Manually clear a peer's key slot.
    pub fn forget_peer(&mut self, peer: NodeAddr) -> bool {
        if let Some(req) = self.pairing.pending_request_id(peer) {
            self.delivery.cancel(peer, req);
        }
        self.pairing.forget_peer(&mut self.storage, peer)
    }

    /// Entry point for the receive path. `src` comes from radio metadata.
    pub fn on_packet(
        &mut self,
        radio: &mut impl Radio,
        src: NodeAddr,
        pkt: &WireChatPacket,
        rssi: i16,
        snr: f32,
        now_ms: u32,
    ) {
        self.counters.record_rx();
        if !self.dedupe.check_and_insert(src, pkt.msg_id, now_ms) {
            debug!(src, msg_id = pkt.msg_id, kind = ?pkt.kind, "duplicate dropped");
            return;
        }
        if pkt.to != self.local && pkt.to != BROADCAST_ADDR {
            debug!(src, to = pkt.to, "packet for another node");
            return;
        }
        match pkt.kind {
            PacketKind::Chat => {
                self.push_event(Event::Incoming {
                    from: src,
                    msg_id: pkt.msg_id,
                    ts: pkt.ts,
                    text: copy_text(pkt.text()),
                    secure: false,
                });
                self.send_ack(radio, now_ms, src, pkt.msg_id);
            }
            PacketKind::Ack => self.on_ack(src, pkt.ref_msg_id),
            PacketKind::Discovery => {
                // Route refresh is the mesh layer's job.
                debug!(src, ref_msg_id = pkt.ref_msg_id, "discovery probe seen");
            }
            PacketKind::Presence => self.push_event(Event::Presence {
                peer: src,
                rssi,
                snr,
                status: copy_text(pkt.text()),
            }),
            PacketKind::PairRequest => self.on_pair_request(radio, now_ms, src, pkt),
            PacketKind::PairAccept => self.on_pair_accept(src, pkt),
            PacketKind::SecureChat => self.on_secure_chat(radio, now_ms, src, pkt),
        }
    }

    /// Periodic tick from the main loop: retries, escalation, exhaustion, presence.
    pub fn tick(&mut self, radio: &mut impl Radio, now_ms: u32) {
        self.service_deliveries(radio, now_ms);
        self.maybe_broadcast_presence(radio, now_ms);
    }

    /// Next UI event, oldest first.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        self.delivery.pending_count()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSend> + '_ {
        self.delivery.pending()
    }

    pub fn has_key(&self, peer: NodeAddr) -> bool {
        self.pairing.has_key(peer)
    }

    pub fn pairing(&self) -> &PairingStore {
        &self.pairing
    }

    pub fn airtime_used_ms(&self) -> u32 {
        self.airtime.used_ms()
    }

    pub fn airtime_budget_ms(&self) -> u32 {
        self.airtime.budget_ms()
    }

    /// Display only.
    pub fn ms_until_airtime_reset(&self, now_ms: u32) -> u32 {
        self.airtime.ms_until_reset(now_ms)
    }

    /// Shared counters for readers outside the engine's context.
    pub fn counters(&self) -> Arc<LinkCounters> {
        self.counters.clone()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    fn on_ack(&mut self, src: NodeAddr, ref_msg_id: u32) {
        match self.delivery.on_ack(src, ref_msg_id) {
            Some(done) => {
                info!(to = src, msg_id = ref_msg_id, attempts = done.attempts, "delivered");
                self.push_event(Event::Delivered {
                    to: src,
                    msg_id: ref_msg_id,
                });
            }
            None => debug!(src, ref_msg_id, "ack for nothing pending"),
        }
    }

    fn on_pair_request(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        src: NodeAddr,
        req: &WireChatPacket,
    ) {
        if let Some(nonce) = self.pairing.sent_accept(src, req.msg_id) {
            // Our accept was lost; answer again without rekeying.
            debug!(src, msg_id = req.msg_id, "repeating pair accept");
            self.send_pair_accept(radio, now_ms, src, req.msg_id, nonce);
            return;
        }
        if matches!(self.pairing.last_msg_id(src), Some(last) if req.msg_id <= last) {
            debug!(src, msg_id = req.msg_id, "stale pair request dropped");
            return;
        }
        let accept_nonce = self.rng.next_u32();
        match self
            .pairing
            .derive_from_request(&mut self.storage, src, req.nonce, accept_nonce)
        {
            Ok(_) => {
                self.pairing
                    .check_replay_and_update(&mut self.storage, src, req.msg_id);
                self.pairing
                    .record_sent_accept(&mut self.storage, src, req.msg_id, accept_nonce);
                self.send_pair_accept(radio, now_ms, src, req.msg_id, accept_nonce);
                info!(peer = src, "paired (responder)");
                self.push_event(Event::Pairing {
                    peer: src,
                    outcome: PairingOutcome::Accepted,
                });
            }
            Err(e) => {
                warn!(peer = src, error = %e, "pair request refused");
                self.push_event(Event::Pairing {
                    peer: src,
                    outcome: PairingOutcome::Failed,
                });
            }
        }
    }

    fn on_pair_accept(&mut self, src: NodeAddr, accept: &WireChatPacket) {
        match self.pairing.resolve_pending_request(
            &mut self.storage,
            src,
            accept.ref_msg_id,
            accept.nonce,
        ) {
            Ok(_) => {
                self.delivery.on_ack(src, accept.ref_msg_id);
                info!(peer = src, "paired (initiator)");
                self.push_event(Event::Pairing {
                    peer: src,
                    outcome: PairingOutcome::Accepted,
                });
            }
            Err(PairingError::NoPendingRequest) => {
                debug!(src, ref_msg_id = accept.ref_msg_id, "stale pair accept dropped");
            }
            Err(e) => {
                self.delivery.on_ack(src, accept.ref_msg_id);
                warn!(peer = src, error = %e, "pair accept could not be stored");
                self.push_event(Event::Pairing {
                    peer: src,
                    outcome: PairingOutcome::Failed,
                });
            }
        }
    }

    fn on_secure_chat(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        src: NodeAddr,
        pkt: &WireChatPacket,
    ) {
        let Some(key) = self.pairing.load_key(src) else {
            debug!(src, msg_id = pkt.msg_id, "secure chat from unpaired peer dropped");
            return;
        };
        let mut plain = copy_text(pkt.text());
        secure::decrypt(&key, self.local, src, pkt.nonce, pkt.msg_id, &mut plain);
        if !self
            .pairing
            .check_replay_and_update(&mut self.storage, src, pkt.msg_id)
        {
            // Silent: the sender must not be able to tell a replay from loss.
            return;
        }
        self.push_event(Event::Incoming {
            from: src,
            msg_id: pkt.msg_id,
            ts: pkt.ts,
            text: plain,
            secure: true,
        });
        self.send_ack(radio, now_ms, src, pkt.msg_id);
    }

    fn send_pair_accept(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        peer: NodeAddr,
        req_msg_id: u32,
        nonce: u32,
    ) {
        let mut accept = self.new_packet(PacketKind::PairAccept, peer, now_ms);
        accept.ref_msg_id = req_msg_id;
        accept.nonce = nonce;
        if self.transmit(radio, now_ms, peer, &accept, true) != Tx::Sent {
            debug!(peer, "pair accept not sent");
        }
    }

    fn send_ack(&mut self, radio: &mut impl Radio, now_ms: u32, dst: NodeAddr, ref_msg_id: u32) {
        let msg_id = self.ids.next_id(&mut self.storage);
        let ack = WireChatPacket::ack(msg_id, self.local, dst, ref_msg_id);
        if self.transmit(radio, now_ms, dst, &ack, true) != Tx::Sent {
            debug!(dst, ref_msg_id, "ack not sent");
        }
    }

    fn enqueue(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        dst: NodeAddr,
        pkt: WireChatPacket,
    ) -> Result<u32, EngineError> {
        let msg_id = pkt.msg_id;
        self.delivery.submit(dst, pkt, now_ms)?;
        self.service_deliveries(radio, now_ms);
        Ok(msg_id)
    }

    fn service_deliveries(&mut self, radio: &mut impl Radio, now_ms: u32) {
        while let Some(step) = self.delivery.next_due(now_ms) {
            match step {
                Step::Send {
                    slot,
                    dst,
                    attempt,
                    escalate,
                } => {
                    let Some(pkt) = self.delivery.packet(slot).cloned() else {
                        continue;
                    };
                    if escalate {
                        if !self.airtime.reserve(now_ms, PACKET_LEN, false) {
                            self.defer_for_airtime(slot, now_ms);
                            continue;
                        }
                        if radio.send_discovery(dst, pkt.msg_id) {
                            self.counters
                                .record_tx(self.airtime.estimate_ms(PACKET_LEN));
                        }
                        info!(dst, msg_id = pkt.msg_id, "escalating to discovery");
                        self.delivery.mark_discovery_sent(slot);
                    }
                    match self.transmit(radio, now_ms, dst, &pkt, false) {
                        Tx::Sent => {}
                        Tx::NoAirtime => {
                            self.defer_for_airtime(slot, now_ms);
                            continue;
                        }
                        // Counts as an attempt; the retry covers it.
                        Tx::Refused => {
                            debug!(dst, msg_id = pkt.msg_id, attempt, "radio refused send")
                        }
                    }
                    self.delivery.record_attempt(slot, now_ms);
                }
                Step::Exhausted(pending) => self.on_exhausted(pending),
            }
        }
    }

    fn on_exhausted(&mut self, pending: PendingSend) {
        let msg_id = pending.msg_id();
        warn!(dst = pending.dst, msg_id, kind = ?pending.packet.kind, "delivery exhausted");
        if pending.packet.kind == PacketKind::PairRequest {
            if !self.pairing.cancel_request(pending.dst, msg_id) {
                debug!(dst = pending.dst, msg_id, "superseded pair request ran out");
                return;
            }
            self.push_event(Event::Pairing {
                peer: pending.dst,
                outcome: PairingOutcome::Failed,
            });
        } else {
            self.push_event(Event::DeliveryFailed {
                to: pending.dst,
                msg_id,
            });
        }
    }

    fn maybe_broadcast_presence(&mut self, radio: &mut impl Radio, now_ms: u32) {
        let interval = self.config.presence_interval_ms;
        if interval == 0 || now_ms.wrapping_sub(self.last_presence_ms) < interval {
            return;
        }
        self.last_presence_ms = now_ms;
        let mut pkt = self.new_packet(PacketKind::Presence, BROADCAST_ADDR, now_ms);
        pkt.set_text(self.config.presence_status.as_bytes());
        if self.transmit(radio, now_ms, BROADCAST_ADDR, &pkt, false) != Tx::Sent {
            debug!("presence beacon skipped");
        }
    }

    /// Reserve airtime and hand the packet to the radio.
    fn transmit(
        &mut self,
        radio: &mut impl Radio,
        now_ms: u32,
        dst: NodeAddr,
        pkt: &WireChatPacket,
        critical: bool,
    ) -> Tx {
        if !self.airtime.reserve(now_ms, PACKET_LEN, critical) {
            debug!(dst, msg_id = pkt.msg_id, kind = ?pkt.kind, "airtime budget exhausted");
            return Tx::NoAirtime;
        }
        if !radio.send_dm(dst, pkt) {
            return Tx::Refused;
        }
        self.counters.record_tx(self.airtime.estimate_ms(PACKET_LEN));
        Tx::Sent
    }

    fn defer_for_airtime(&mut self, slot: SlotHandle, now_ms: u32) {
        let wait = self.airtime.ms_until_reset(now_ms).max(1);
        self.delivery.defer(slot, now_ms.wrapping_add(wait));
    }

    fn new_packet(&mut self, kind: PacketKind, dst: NodeAddr, now_ms: u32) -> WireChatPacket {
        let msg_id = self.ids.next_id(&mut self.storage);
        let mut pkt = WireChatPacket::new(kind, msg_id, self.local, dst);
        pkt.ts = now_ms / 1000;
        pkt
    }

    fn ensure_slot(&self) -> Result<(), EngineError> {
        if self.delivery.is_full() {
            return Err(EngineError::Busy);
        }
        Ok(())
    }

    fn push_event(&mut self, event: Event) {
        if self.events.is_full() {
            warn!("event queue full, dropping oldest");
            self.events.pop_front();
        }
        let _ = self.events.push_back(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tx {
    Sent,
    NoAirtime,
    Refused,
}

fn check_text(text: &[u8]) -> Result<(), EngineError> {
    if text.len() > TEXT_CAPACITY {
        return Err(EngineError::TextTooLong(text.len()));
    }
    Ok(())
}

fn copy_text(bytes: &[u8]) -> MessageText {
    let n = bytes.len().min(TEXT_CAPACITY);
    heapless::Vec::from_slice(&bytes[..n]).unwrap_or_default()
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// No free pending-send or pairing-request slot. Retry later.
    #[error("no free slot")]
    Busy,
    /// SecureChat needs a paired key; pair first.
    #[error("no key for peer {0}")]
    NoKey(NodeAddr),
    #[error("text of {0} bytes exceeds packet capacity")]
    TextTooLong(usize),
}

impl From<DeliveryError> for EngineError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Busy => EngineError::Busy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::RetryPolicy;
    use crate::radio::{MemoryRadio, Transmission};
    use crate::storage::{FailingStorage, MemoryStorage};

    type Node = AloraCore<MemoryStorage>;

    fn node(addr: NodeAddr, seed: u64) -> (Node, MemoryRadio) {
        node_with(addr, seed, Config::default())
    }

    fn node_with(addr: NodeAddr, seed: u64, config: Config) -> (Node, MemoryRadio) {
        let mut core = AloraCore::with_seed(addr, MemoryStorage::new(), config, seed);
        core.begin();
        (core, MemoryRadio::new(addr))
    }

    /// Hand everything `from_radio` sent to `to`. Returns how many packets were delivered.
    fn relay<T: Storage>(
        from_radio: &mut MemoryRadio,
        to: &mut AloraCore<T>,
        to_radio: &mut MemoryRadio,
        now: u32,
    ) -> usize {
        let src = from_radio.local_address();
        let mut n = 0;
        for t in from_radio.drain() {
            if let Transmission::Dm(dst, pkt) = t {
                if dst == to.local_address() || dst == BROADCAST_ADDR {
                    to.on_packet(to_radio, src, &pkt, -40, 9.5, now);
                    n += 1;
                }
            }
        }
        n
    }

    fn events<T: Storage>(core: &mut AloraCore<T>) -> Vec<Event> {
        std::iter::from_fn(|| core.poll_event()).collect()
    }

    fn pair(a: &mut Node, ra: &mut MemoryRadio, b: &mut Node, rb: &mut MemoryRadio) {
        let peer = b.local_address();
        a.request_pairing(ra, 0, peer).unwrap();
        assert_eq!(relay(ra, b, rb, 10), 1);
        assert_eq!(relay(rb, a, ra, 20), 1);
        events(a);
        events(b);
    }

    #[test]
    fn plain_chat_is_acked_and_delivered() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        let id = a.send_chat(&mut ra, 0, 2, b"hello").unwrap();
        assert_eq!(a.pending_count(), 1);

        relay(&mut ra, &mut b, &mut rb, 5);
        match events(&mut b).as_slice() {
            [Event::Incoming { from: 1, msg_id, text, secure: false, .. }] => {
                assert_eq!(*msg_id, id);
                assert_eq!(text.as_slice(), b"hello");
            }
            other => panic!("unexpected events {:?}", other),
        }
        relay(&mut rb, &mut a, &mut ra, 10);
        assert_eq!(events(&mut a), vec![Event::Delivered { to: 2, msg_id: id }]);
        assert_eq!(a.pending_count(), 0);
        assert_eq!(a.counters().rx_count(), 1);
        assert_eq!(b.counters().tx_count(), 1);
    }

    #[test]
    fn handshake_then_secure_chat() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);

        let req_id = a.request_pairing(&mut ra, 0, 2).unwrap();
        assert_eq!(
            events(&mut a),
            vec![Event::Pairing { peer: 2, outcome: PairingOutcome::Requested }]
        );
        relay(&mut ra, &mut b, &mut rb, 10);
        assert_eq!(
            events(&mut b),
            vec![Event::Pairing { peer: 1, outcome: PairingOutcome::Accepted }]
        );
        let accept = rb.dms().next().map(|(_, p)| p.clone()).unwrap();
        assert_eq!(accept.kind, PacketKind::PairAccept);
        assert_eq!(accept.ref_msg_id, req_id);

        relay(&mut rb, &mut a, &mut ra, 20);
        assert_eq!(
            events(&mut a),
            vec![Event::Pairing { peer: 2, outcome: PairingOutcome::Accepted }]
        );
        assert_eq!(a.pending_count(), 0);
        assert!(a.pairing().load_key(2).is_some());
        assert_eq!(a.pairing().load_key(2), b.pairing().load_key(1));

        let id = a.send_chat(&mut ra, 100, 2, b"meet at the ridge").unwrap();
        let sent = ra.dms().next().map(|(_, p)| p.clone()).unwrap();
        assert_eq!(sent.kind, PacketKind::SecureChat);
        assert_ne!(sent.text(), b"meet at the ridge");

        relay(&mut ra, &mut b, &mut rb, 110);
        match events(&mut b).as_slice() {
            [Event::Incoming { from: 1, text, secure: true, .. }] => {
                assert_eq!(text.as_slice(), b"meet at the ridge")
            }
            other => panic!("unexpected events {:?}", other),
        }
        relay(&mut rb, &mut a, &mut ra, 120);
        assert_eq!(events(&mut a), vec![Event::Delivered { to: 2, msg_id: id }]);
    }

    #[test]
    fn secure_without_key_is_refused() {
        let (mut a, mut ra) = node(1, 11);
        assert_eq!(a.send_secure(&mut ra, 0, 2, b"x"), Err(EngineError::NoKey(2)));
        assert!(ra.outbox.is_empty());
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn replayed_secure_chat_is_silently_dropped() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        pair(&mut a, &mut ra, &mut b, &mut rb);

        a.send_secure(&mut ra, 100, 2, b"once").unwrap();
        let captured = ra.dms().next().map(|(_, p)| p.clone()).unwrap();
        relay(&mut ra, &mut b, &mut rb, 110);
        assert_eq!(events(&mut b).len(), 1);
        rb.drain();

        // Past the dedupe horizon, so only the replay window can catch it.
        b.on_packet(&mut rb, 1, &captured, -40, 9.5, 10_000);
        assert!(events(&mut b).is_empty());
        assert!(rb.outbox.is_empty(), "replay must not be acked");
    }

    #[test]
    fn duplicate_within_horizon_is_dropped() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        a.send_plain(&mut ra, 0, 2, b"dup").unwrap();
        let pkt = ra.dms().next().map(|(_, p)| p.clone()).unwrap();

        b.on_packet(&mut rb, 1, &pkt, -40, 9.5, 0);
        b.on_packet(&mut rb, 1, &pkt, -40, 9.5, 200);
        assert_eq!(events(&mut b).len(), 1);
        assert_eq!(rb.dms().count(), 1);
    }

    #[test]
    fn unacked_send_escalates_once_then_fails() {
        let (mut a, mut ra) = node(1, 11);
        let id = a.send_plain(&mut ra, 0, 2, b"anyone?").unwrap();
        let mut failed_at = None;
        for now in (0..120_000u32).step_by(250) {
            a.tick(&mut ra, now);
            if let Some(e) = a.poll_event() {
                assert_eq!(e, Event::DeliveryFailed { to: 2, msg_id: id });
                failed_at = Some(now);
                break;
            }
        }
        assert!(failed_at.is_some());
        let out = ra.drain();
        let dms = out
            .iter()
            .filter(|t| matches!(t, Transmission::Dm(2, p) if p.msg_id == id))
            .count();
        let discoveries = out
            .iter()
            .filter(|t| matches!(t, Transmission::Discovery { target: 2, ref_msg_id } if *ref_msg_id == id))
            .count();
        assert_eq!(dms, RetryPolicy::default().max_attempts as usize);
        assert_eq!(discoveries, 1);
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn airtime_budget_defers_non_critical_traffic() {
        let config = Config {
            airtime_budget_ms: 400,
            ..Config::default()
        };
        let (mut a, mut ra) = node_with(1, 11, config);
        let (mut b, mut rb) = node_with(2, 22, Config {
            airtime_budget_ms: 0,
            ..Config::default()
        });

        a.send_plain(&mut ra, 0, 2, b"one").unwrap();
        a.send_plain(&mut ra, 0, 2, b"two").unwrap();
        let third = a.send_plain(&mut ra, 0, 2, b"three").unwrap();
        assert_eq!(ra.dms().count(), 2);
        assert_eq!(a.pending_count(), 3);
        assert_eq!(a.ms_until_airtime_reset(0), 60_000);

        // Acks are critical: they go out even with a zero budget.
        relay(&mut ra, &mut b, &mut rb, 10);
        assert_eq!(rb.dms().count(), 2);
        assert!(b.airtime_used_ms() > b.airtime_budget_ms());
        relay(&mut rb, &mut a, &mut ra, 20);
        assert_eq!(a.pending_count(), 1);

        a.tick(&mut ra, 59_999);
        assert!(ra.outbox.is_empty());
        a.tick(&mut ra, 60_000);
        let resent: Vec<u32> = ra
            .dms()
            .filter(|(dst, _)| *dst == 2)
            .map(|(_, p)| p.msg_id)
            .collect();
        assert_eq!(resent, vec![third]);
    }

    #[test]
    fn send_errors() {
        let (mut a, mut ra) = node(1, 11);
        let long = [b'x'; TEXT_CAPACITY + 1];
        assert_eq!(
            a.send_plain(&mut ra, 0, 2, &long),
            Err(EngineError::TextTooLong(TEXT_CAPACITY + 1))
        );
        for _ in 0..crate::delivery::MAX_PENDING {
            a.send_plain(&mut ra, 0, 2, b"fill").unwrap();
        }
        assert_eq!(a.send_plain(&mut ra, 0, 2, b"more"), Err(EngineError::Busy));
        assert_eq!(a.request_pairing(&mut ra, 0, 3), Err(EngineError::Busy));
    }

    #[test]
    fn packets_for_other_nodes_are_ignored() {
        let (mut b, mut rb) = node(2, 22);
        let mut pkt = WireChatPacket::new(PacketKind::Chat, 5, 1, 3);
        pkt.set_text(b"not yours");
        b.on_packet(&mut rb, 1, &pkt, -40, 9.5, 0);
        assert!(events(&mut b).is_empty());
        assert!(rb.outbox.is_empty());
    }

    #[test]
    fn dedupe_runs_before_address_filter() {
        let (mut b, mut rb) = node(2, 22);
        let elsewhere = WireChatPacket::new(PacketKind::Chat, 5, 1, 3);
        let mine = WireChatPacket::new(PacketKind::Chat, 5, 1, 2);
        b.on_packet(&mut rb, 1, &elsewhere, -40, 9.5, 0);
        // Same (src, msg id) inside the horizon: already seen, whatever it was addressed to.
        b.on_packet(&mut rb, 1, &mine, -40, 9.5, 100);
        assert!(events(&mut b).is_empty());
        assert!(rb.outbox.is_empty());

        b.on_packet(&mut rb, 1, &mine, -40, 9.5, 2_000);
        assert_eq!(events(&mut b).len(), 1);
        assert_eq!(b.counters().rx_count(), 3);
    }

    #[test]
    fn event_queue_drops_oldest() {
        let (mut b, mut rb) = node(2, 22);
        for id in 1..=(EVENT_QUEUE_LEN as u32 + 1) {
            let pkt = WireChatPacket::new(PacketKind::Chat, id, 1, 2);
            b.on_packet(&mut rb, 1, &pkt, -40, 9.5, 0);
        }
        let got = events(&mut b);
        assert_eq!(got.len(), EVENT_QUEUE_LEN);
        assert!(matches!(got[0], Event::Incoming { msg_id: 2, .. }));
    }

    #[test]
    fn presence_beacon_on_interval() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        b.tick(&mut rb, 30_000);
        assert!(rb.outbox.is_empty());
        b.tick(&mut rb, 60_000);
        let (dst, beacon) = rb.dms().next().map(|(d, p)| (d, p.clone())).unwrap();
        assert_eq!(dst, BROADCAST_ADDR);
        assert_eq!(beacon.kind, PacketKind::Presence);

        relay(&mut rb, &mut a, &mut ra, 60_010);
        match events(&mut a).as_slice() {
            [Event::Presence { peer: 2, rssi: -40, status, .. }] => {
                assert_eq!(status.as_slice(), b"online")
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(ra.outbox.is_empty(), "presence is not acked");
    }

    #[test]
    fn lost_accept_is_repeated_without_rekey() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        a.request_pairing(&mut ra, 0, 2).unwrap();
        relay(&mut ra, &mut b, &mut rb, 10);
        let first = rb.drain();
        let key_b = b.pairing().load_key(1);
        events(&mut b);

        a.tick(&mut ra, 2_500);
        assert_eq!(relay(&mut ra, &mut b, &mut rb, 2_510), 1);
        assert!(events(&mut b).is_empty());
        assert_eq!(b.pairing().load_key(1), key_b);
        let nonce = |t: &[Transmission]| match t {
            [Transmission::Dm(_, p)] => p.nonce,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(nonce(&first), nonce(&rb.outbox));

        relay(&mut rb, &mut a, &mut ra, 2_520);
        assert_eq!(a.pairing().load_key(2), key_b);
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn lost_accept_is_repeated_after_restart() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        a.request_pairing(&mut ra, 0, 2).unwrap();
        relay(&mut ra, &mut b, &mut rb, 10);
        let first = rb.drain();
        let key_b = b.pairing().load_key(1);
        assert!(key_b.is_some());

        let mut b2 = AloraCore::with_seed(2, b.into_storage(), Config::default(), 23);
        assert_eq!(b2.begin(), 1);
        let mut rb2 = MemoryRadio::new(2);
        a.tick(&mut ra, 2_500);
        assert_eq!(relay(&mut ra, &mut b2, &mut rb2, 2_510), 1);
        assert!(events(&mut b2).is_empty(), "retransmission must not rekey");
        assert_eq!(b2.pairing().load_key(1), key_b);
        match (first.as_slice(), rb2.outbox.as_slice()) {
            ([Transmission::Dm(_, before)], [Transmission::Dm(_, after)]) => {
                assert_eq!(after.kind, PacketKind::PairAccept);
                assert_eq!(before.nonce, after.nonce);
            }
            other => panic!("unexpected {:?}", other),
        }

        relay(&mut rb2, &mut a, &mut ra, 2_520);
        assert_eq!(a.pairing().load_key(2), key_b);
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn repeated_pair_request_supersedes_the_first() {
        let config = Config {
            airtime_budget_ms: 60_000,
            presence_interval_ms: 0,
            ..Config::default()
        };
        let (mut a, mut ra) = node_with(1, 11, config);
        let (mut b, mut rb) = node(2, 22);

        // B is out of range while both requests are retried.
        a.request_pairing(&mut ra, 0, 2).unwrap();
        ra.drain();
        for now in (250..67_500u32).step_by(250) {
            a.tick(&mut ra, now);
            if now == 30_000 {
                a.request_pairing(&mut ra, now, 2).unwrap();
                assert_eq!(a.pending_count(), 1);
            }
            ra.drain();
        }

        // Fifth attempt of the second request, when the first would have run out.
        a.tick(&mut ra, 67_500);
        assert_eq!(relay(&mut ra, &mut b, &mut rb, 67_510), 1);
        assert_eq!(relay(&mut rb, &mut a, &mut ra, 67_520), 1);

        assert!(a.has_key(2));
        assert_eq!(a.pairing().load_key(2), b.pairing().load_key(1));
        assert_eq!(
            events(&mut a),
            vec![
                Event::Pairing { peer: 2, outcome: PairingOutcome::Requested },
                Event::Pairing { peer: 2, outcome: PairingOutcome::Requested },
                Event::Pairing { peer: 2, outcome: PairingOutcome::Accepted },
            ]
        );
        assert_eq!(a.pending_count(), 0);
        assert!(!a.pairing().has_pending_request(2));
    }

    #[test]
    fn pairing_holds_in_memory_when_storage_fails() {
        let (mut a, mut ra) = node(1, 11);
        let mut b = AloraCore::with_seed(2, FailingStorage::default(), Config::default(), 22);
        assert_eq!(b.begin(), 0);
        let mut rb = MemoryRadio::new(2);

        a.request_pairing(&mut ra, 0, 2).unwrap();
        relay(&mut ra, &mut b, &mut rb, 10);
        relay(&mut rb, &mut a, &mut ra, 20);
        assert!(b.has_key(1));
        assert_eq!(a.pairing().load_key(2), b.pairing().load_key(1));
        events(&mut a);
        events(&mut b);

        a.send_secure(&mut ra, 100, 2, b"still here").unwrap();
        let captured = ra.dms().next().map(|(_, p)| p.clone()).unwrap();
        relay(&mut ra, &mut b, &mut rb, 110);
        match events(&mut b).as_slice() {
            [Event::Incoming { from: 1, text, secure: true, .. }] => {
                assert_eq!(text.as_slice(), b"still here")
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(b.pairing().last_msg_id(1), Some(captured.msg_id));
        assert!(b.storage().writes > 0);

        rb.drain();
        b.on_packet(&mut rb, 1, &captured, -40, 9.5, 10_000);
        assert!(events(&mut b).is_empty(), "window advanced in memory");
        assert!(rb.outbox.is_empty());
    }

    #[test]
    fn unanswered_pair_request_fails() {
        let (mut a, mut ra) = node(1, 11);
        a.request_pairing(&mut ra, 0, 9).unwrap();
        events(&mut a);
        let mut outcome = None;
        for now in (0..120_000u32).step_by(500) {
            a.tick(&mut ra, now);
            if let Some(e) = a.poll_event() {
                outcome = Some(e);
                break;
            }
        }
        assert_eq!(
            outcome,
            Some(Event::Pairing { peer: 9, outcome: PairingOutcome::Failed })
        );
        assert!(!a.pairing().has_pending_request(9));
    }

    #[test]
    fn state_survives_restart() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        pair(&mut a, &mut ra, &mut b, &mut rb);
        let last = a.send_secure(&mut ra, 100, 2, b"before").unwrap();
        relay(&mut ra, &mut b, &mut rb, 110);

        let mut b2 = AloraCore::with_seed(2, b.into_storage(), Config::default(), 23);
        assert_eq!(b2.begin(), 1);
        assert_eq!(b2.pairing().last_msg_id(1), Some(last));

        let mut a2 = AloraCore::with_seed(1, a.into_storage(), Config::default(), 12);
        a2.begin();
        let next = a2.send_secure(&mut ra, 0, 2, b"after").unwrap();
        assert!(next > last);

        let mut rb2 = MemoryRadio::new(2);
        relay(&mut ra, &mut b2, &mut rb2, 10);
        match events(&mut b2).as_slice() {
            [Event::Incoming { text, secure: true, .. }] => assert_eq!(text.as_slice(), b"after"),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn forget_peer_clears_key() {
        let (mut a, mut ra) = node(1, 11);
        let (mut b, mut rb) = node(2, 22);
        pair(&mut a, &mut ra, &mut b, &mut rb);
        assert!(a.forget_peer(2));
        assert!(!a.has_key(2));
        assert!(!a.forget_peer(2));
        a.send_chat(&mut ra, 0, 2, b"plain again").unwrap();
        assert_eq!(ra.dms().next().map(|(_, p)| p.kind), Some(PacketKind::Chat));
    }
}
