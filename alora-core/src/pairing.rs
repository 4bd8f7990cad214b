//! Pairing and key store: per-peer shared keys, outstanding handshakes, replay windows.
//!
//! Keys come from a nonce exchange, not from asymmetric crypto: both ends XOR the two
//! pairing nonces and run the result, with the canonically ordered address pair, through
//! a splitmix64-style mixer. The mixer is public and unkeyed, so anyone who hears both
//! nonces can derive the key. That trade-off is inherited from the deployed protocol and
//! kept for interoperability.

use tracing::{debug, info, warn};

use crate::packet::NodeAddr;
use crate::secure::KEY_LEN;
use crate::storage::{accept_slot_key, peer_slot_key, AcceptRecord, PeerRecord, Storage};

/// Maximum number of paired peers (and of concurrent outgoing requests).
pub const MAX_PEERS: usize = 6;

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone)]
struct PairEntry {
    peer: NodeAddr,
    key: [u8; KEY_LEN],
    /// Highest SecureChat/PairRequest id accepted from this peer.
    last_msg_id: u32,
    /// Answer to the request this key was derived from, if we were the responder.
    accept: Option<AcceptRecord>,
}

#[derive(Debug, Clone, Copy)]
struct PendingPairReq {
    peer: NodeAddr,
    msg_id: u32,
    nonce: u32,
}

/// Fixed-capacity key store. Slot `i` persists under `p{i}`, its last PairAccept under `a{i}`.
pub struct PairingStore {
    local: NodeAddr,
    entries: [Option<PairEntry>; MAX_PEERS],
    pending: [Option<PendingPairReq>; MAX_PEERS],
}

impl PairingStore {
    pub fn new(local: NodeAddr) -> Self {
        Self {
            local,
            entries: Default::default(),
            pending: [None; MAX_PEERS],
        }
    }

    /// Load persisted entries. Unreadable slots are skipped; legacy records are rewritten
    /// in the versioned format. Returns the number of peers loaded.
    pub fn begin(&mut self, storage: &mut impl Storage) -> usize {
        let mut loaded = 0;
        for idx in 0..MAX_PEERS {
            let key = peer_slot_key(idx);
            let bytes = match storage.get(&key) {
                Ok(Some(b)) => b,
                Ok(None) => continue,
                Err(e) => {
                    warn!(slot = idx, error = %e, "pairing slot unreadable");
                    continue;
                }
            };
            let rec = match PeerRecord::decode(&key, &bytes) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!(slot = idx, error = %e, "pairing slot undecodable");
                    continue;
                }
            };
            self.entries[idx] = Some(PairEntry {
                peer: rec.record.peer,
                key: rec.record.key,
                last_msg_id: rec.record.last_msg_id,
                accept: Self::load_accept(&*storage, idx, rec.record.peer),
            });
            loaded += 1;
            if rec.migrated {
                info!(slot = idx, peer = rec.record.peer, "migrating legacy pairing record");
                self.persist_entry(storage, idx);
            }
        }
        loaded
    }

    pub fn has_key(&self, peer: NodeAddr) -> bool {
        self.find_entry(peer).is_some()
    }

    pub fn load_key(&self, peer: NodeAddr) -> Option<[u8; KEY_LEN]> {
        self.find(peer).map(|e| e.key)
    }

    /// Highest accepted message id for `peer`, if paired.
    pub fn last_msg_id(&self, peer: NodeAddr) -> Option<u32> {
        self.find(peer).map(|e| e.last_msg_id)
    }

    /// Paired peers with their replay window, for status display.
    pub fn peers(&self) -> impl Iterator<Item = (NodeAddr, u32)> + '_ {
        self.entries
            .iter()
            .flatten()
            .map(|e| (e.peer, e.last_msg_id))
    }

    pub fn peer_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// Store `key` for `peer`. Re-pairing overwrites the key and keeps `last_msg_id`.
    /// A persist failure is logged; the key is usable in memory either way.
    pub fn remember_key(
        &mut self,
        storage: &mut impl Storage,
        peer: NodeAddr,
        key: &[u8; KEY_LEN],
    ) -> Result<(), PairingError> {
        let idx = match self.find_entry(peer) {
            Some(idx) => {
                if let Some(e) = self.entries[idx].as_mut() {
                    e.key = *key;
                    if e.accept.take().is_some() {
                        if let Err(err) = storage.remove(&accept_slot_key(idx)) {
                            debug!(slot = idx, error = %err, "failed to drop old accept record");
                        }
                    }
                }
                idx
            }
            None => {
                let idx = self
                    .entries
                    .iter()
                    .position(Option::is_none)
                    .ok_or(PairingError::NoFreeSlot)?;
                self.entries[idx] = Some(PairEntry {
                    peer,
                    key: *key,
                    last_msg_id: 0,
                    accept: None,
                });
                idx
            }
        };
        self.persist_entry(storage, idx);
        Ok(())
    }

    /// Track an outgoing PairRequest. A newer request to the same peer replaces the old one.
    pub fn record_outgoing_request(
        &mut self,
        peer: NodeAddr,
        msg_id: u32,
        nonce: u32,
    ) -> Result<(), PairingError> {
        let req = PendingPairReq {
            peer,
            msg_id,
            nonce,
        };
        if let Some(slot) = self.pending.iter_mut().flatten().find(|p| p.peer == peer) {
            *slot = req;
            return Ok(());
        }
        let slot = self
            .pending
            .iter_mut()
            .find(|p| p.is_none())
            .ok_or(PairingError::NoFreeSlot)?;
        *slot = Some(req);
        Ok(())
    }

    pub fn has_pending_request(&self, peer: NodeAddr) -> bool {
        self.pending_request_id(peer).is_some()
    }

    /// Message id of the outstanding request to `peer`, if any.
    pub fn pending_request_id(&self, peer: NodeAddr) -> Option<u32> {
        self.pending
            .iter()
            .flatten()
            .find(|p| p.peer == peer)
            .map(|p| p.msg_id)
    }

    /// Drop the outstanding request `msg_id` to `peer` (handshake gave up). A request that
    /// has since been replaced by a newer one is left alone. Returns whether it was dropped.
    pub fn cancel_request(&mut self, peer: NodeAddr, msg_id: u32) -> bool {
        match self
            .pending
            .iter_mut()
            .find(|p| matches!(p, Some(req) if req.peer == peer && req.msg_id == msg_id))
        {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Complete a handshake we initiated. The pending request is consumed even if no
    /// key slot is free.
    pub fn resolve_pending_request(
        &mut self,
        storage: &mut impl Storage,
        peer: NodeAddr,
        ref_msg_id: u32,
        accept_nonce: u32,
    ) -> Result<[u8; KEY_LEN], PairingError> {
        let idx = self
            .pending
            .iter()
            .position(|p| matches!(p, Some(p) if p.peer == peer && p.msg_id == ref_msg_id))
            .ok_or(PairingError::NoPendingRequest)?;
        let req = self.pending[idx].take().ok_or(PairingError::NoPendingRequest)?;
        let key = self.derive_for_peer(peer, req.nonce ^ accept_nonce);
        self.remember_key(storage, peer, &key)?;
        Ok(key)
    }

    /// Responder side: derive and remember the key for an incoming PairRequest.
    pub fn derive_from_request(
        &mut self,
        storage: &mut impl Storage,
        peer: NodeAddr,
        req_nonce: u32,
        accept_nonce: u32,
    ) -> Result<[u8; KEY_LEN], PairingError> {
        let key = self.derive_for_peer(peer, req_nonce ^ accept_nonce);
        self.remember_key(storage, peer, &key)?;
        Ok(key)
    }

    /// Remember the PairAccept sent for request `req_msg_id` so a retransmission of that
    /// request is answered with the same nonce. Persisted next to the peer record.
    pub fn record_sent_accept(
        &mut self,
        storage: &mut impl Storage,
        peer: NodeAddr,
        req_msg_id: u32,
        nonce: u32,
    ) {
        let Some(idx) = self.find_entry(peer) else {
            return;
        };
        let rec = AcceptRecord {
            peer,
            req_msg_id,
            nonce,
        };
        if let Some(e) = self.entries[idx].as_mut() {
            e.accept = Some(rec);
        }
        if let Err(err) = rec.encode().and_then(|b| storage.put(&accept_slot_key(idx), &b)) {
            warn!(slot = idx, peer, error = %err, "accept record persist failed");
        }
    }

    /// Nonce of the PairAccept already sent for request `req_msg_id` from `peer`.
    pub fn sent_accept(&self, peer: NodeAddr, req_msg_id: u32) -> Option<u32> {
        self.find(peer)
            .and_then(|e| e.accept)
            .filter(|a| a.req_msg_id == req_msg_id)
            .map(|a| a.nonce)
    }

    /// Replay window. Accepts only ids strictly greater than the last accepted one and
    /// advances the window. Unpaired peers are always rejected. A persist failure does not
    /// reject the message; memory stays authoritative.
    pub fn check_replay_and_update(
        &mut self,
        storage: &mut impl Storage,
        peer: NodeAddr,
        msg_id: u32,
    ) -> bool {
        let Some(idx) = self.find_entry(peer) else {
            return false;
        };
        let Some(e) = self.entries[idx].as_mut() else {
            return false;
        };
        if msg_id <= e.last_msg_id {
            debug!(peer, msg_id, last = e.last_msg_id, "replay rejected");
            return false;
        }
        e.last_msg_id = msg_id;
        self.persist_entry(storage, idx);
        true
    }

    /// Manually free a peer's slot (and any outstanding request to it).
    pub fn forget_peer(&mut self, storage: &mut impl Storage, peer: NodeAddr) -> bool {
        for p in self.pending.iter_mut() {
            if matches!(p, Some(req) if req.peer == peer) {
                *p = None;
            }
        }
        let Some(idx) = self.find_entry(peer) else {
            return false;
        };
        let had_accept = self.entries[idx].take().and_then(|e| e.accept).is_some();
        if let Err(e) = storage.remove(&peer_slot_key(idx)) {
            warn!(slot = idx, error = %e, "failed to remove pairing record");
        }
        if had_accept {
            if let Err(e) = storage.remove(&accept_slot_key(idx)) {
                warn!(slot = idx, error = %e, "failed to remove accept record");
            }
        }
        true
    }

    fn load_accept(storage: &impl Storage, idx: usize, peer: NodeAddr) -> Option<AcceptRecord> {
        let bytes = storage.get(&accept_slot_key(idx)).ok()??;
        match AcceptRecord::decode(&bytes) {
            Ok(rec) if rec.peer == peer => Some(rec),
            Ok(_) => None,
            Err(e) => {
                warn!(slot = idx, error = %e, "accept record undecodable");
                None
            }
        }
    }

    fn derive_for_peer(&self, peer: NodeAddr, mixed: u32) -> [u8; KEY_LEN] {
        let lo = self.local.min(peer);
        let hi = self.local.max(peer);
        derive_key_material(lo, hi, mixed)
    }

    fn find_entry(&self, peer: NodeAddr) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.peer == peer))
    }

    fn find(&self, peer: NodeAddr) -> Option<&PairEntry> {
        self.entries.iter().flatten().find(|e| e.peer == peer)
    }

    fn persist_entry(&self, storage: &mut impl Storage, idx: usize) -> bool {
        let Some(e) = self.entries[idx].as_ref() else {
            return false;
        };
        let result = PeerRecord::new(e.peer, e.last_msg_id, e.key)
            .encode()
            .and_then(|bytes| storage.put(&peer_slot_key(idx), &bytes));
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(slot = idx, peer = e.peer, error = %err, "pairing persist failed");
                false
            }
        }
    }
}

/// Deterministic key material from the ordered address pair and mixed nonce.
/// `a` must be the lower address. splitmix64, four 8-byte LE blocks.
pub fn derive_key_material(a: NodeAddr, b: NodeAddr, mixed_nonce: u32) -> [u8; KEY_LEN] {
    let mut state = GOLDEN_GAMMA;
    state ^= ((a as u64) << 16) | b as u64;
    state ^= (mixed_nonce as u64) << 1;

    let mut out = [0u8; KEY_LEN];
    for block in out.chunks_exact_mut(8) {
        state = state.wrapping_add(GOLDEN_GAMMA);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        block.copy_from_slice(&z.to_le_bytes());
    }
    out
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("no free pairing slot")]
    NoFreeSlot,
    #[error("no matching pending pairing request")]
    NoPendingRequest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FailingStorage, MemoryStorage};
    use rand::Rng;

    #[test]
    fn handshake_is_symmetric() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let (a, b): (NodeAddr, NodeAddr) = (rng.gen(), rng.gen());
            let (n1, n2): (u32, u32) = (rng.gen(), rng.gen());
            let mut sa = MemoryStorage::new();
            let mut sb = MemoryStorage::new();
            let mut store_a = PairingStore::new(a);
            let mut store_b = PairingStore::new(b);

            store_a.record_outgoing_request(b, 10, n1).unwrap();
            let kb = store_b.derive_from_request(&mut sb, a, n1, n2).unwrap();
            let ka = store_a.resolve_pending_request(&mut sa, b, 10, n2).unwrap();
            assert_eq!(ka, kb);
            assert_eq!(store_a.load_key(b), Some(ka));
            assert!(!store_a.has_pending_request(b));
        }
    }

    #[test]
    fn derivation_known_answer() {
        // First block for (1, 2, 0): state = gamma ^ 0x10002, then splitmix64 step.
        let key = derive_key_material(1, 2, 0);
        let mut state = GOLDEN_GAMMA ^ 0x0001_0002;
        state = state.wrapping_add(GOLDEN_GAMMA);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        assert_eq!(&key[..8], &z.to_le_bytes());
        assert_ne!(key, derive_key_material(1, 2, 1));
    }

    #[test]
    fn stale_accept_is_dropped() {
        let mut storage = MemoryStorage::new();
        let mut store = PairingStore::new(1);
        store.record_outgoing_request(2, 10, 0xAAAA).unwrap();
        assert_eq!(
            store.resolve_pending_request(&mut storage, 2, 9, 0xBBBB),
            Err(PairingError::NoPendingRequest)
        );
        assert_eq!(
            store.resolve_pending_request(&mut storage, 3, 10, 0xBBBB),
            Err(PairingError::NoPendingRequest)
        );
        assert!(store.resolve_pending_request(&mut storage, 2, 10, 0xBBBB).is_ok());
        // Duplicate accept after resolution.
        assert_eq!(
            store.resolve_pending_request(&mut storage, 2, 10, 0xBBBB),
            Err(PairingError::NoPendingRequest)
        );
    }

    #[test]
    fn newer_request_replaces_pending() {
        let mut storage = MemoryStorage::new();
        let mut store = PairingStore::new(1);
        store.record_outgoing_request(2, 10, 1).unwrap();
        store.record_outgoing_request(2, 12, 2).unwrap();
        assert!(store.resolve_pending_request(&mut storage, 2, 10, 5).is_err());
        assert!(store.resolve_pending_request(&mut storage, 2, 12, 5).is_ok());
    }

    #[test]
    fn cancel_only_drops_the_matching_request() {
        let mut storage = MemoryStorage::new();
        let mut store = PairingStore::new(1);
        store.record_outgoing_request(2, 10, 1).unwrap();
        store.record_outgoing_request(2, 12, 2).unwrap();
        // The first request running out of retries must not take the second with it.
        assert!(!store.cancel_request(2, 10));
        assert_eq!(store.pending_request_id(2), Some(12));
        assert!(store.resolve_pending_request(&mut storage, 2, 12, 5).is_ok());
        assert!(!store.cancel_request(2, 12));

        store.record_outgoing_request(3, 20, 1).unwrap();
        assert!(store.cancel_request(3, 20));
        assert!(!store.has_pending_request(3));
    }

    #[test]
    fn pending_slots_are_bounded() {
        let mut store = PairingStore::new(1);
        for peer in 0..MAX_PEERS as NodeAddr {
            store.record_outgoing_request(100 + peer, 1, 1).unwrap();
        }
        assert_eq!(
            store.record_outgoing_request(999, 1, 1),
            Err(PairingError::NoFreeSlot)
        );
    }

    #[test]
    fn replay_window_only_moves_forward() {
        let mut storage = MemoryStorage::new();
        let mut store = PairingStore::new(1);
        store.remember_key(&mut storage, 2, &[1u8; KEY_LEN]).unwrap();

        assert!(store.check_replay_and_update(&mut storage, 2, 5));
        assert!(!store.check_replay_and_update(&mut storage, 2, 5));
        assert!(!store.check_replay_and_update(&mut storage, 2, 4));
        assert!(store.check_replay_and_update(&mut storage, 2, 6));
        assert!(store.check_replay_and_update(&mut storage, 2, 100));
        assert!(!store.check_replay_and_update(&mut storage, 2, 99));
        assert!(!store.check_replay_and_update(&mut storage, 3, 1000));
        assert_eq!(store.last_msg_id(2), Some(100));
    }

    #[test]
    fn rekey_keeps_replay_counter() {
        let mut storage = MemoryStorage::new();
        let mut store = PairingStore::new(1);
        store.remember_key(&mut storage, 2, &[1u8; KEY_LEN]).unwrap();
        assert!(store.check_replay_and_update(&mut storage, 2, 50));
        store.remember_key(&mut storage, 2, &[2u8; KEY_LEN]).unwrap();
        assert_eq!(store.load_key(2), Some([2u8; KEY_LEN]));
        assert_eq!(store.last_msg_id(2), Some(50));
        assert!(!store.check_replay_and_update(&mut storage, 2, 50));
    }

    #[test]
    fn full_store_refuses_until_cleared() {
        let mut storage = MemoryStorage::new();
        let mut store = PairingStore::new(1);
        for peer in 0..MAX_PEERS as NodeAddr {
            store.remember_key(&mut storage, 10 + peer, &[0u8; KEY_LEN]).unwrap();
        }
        assert_eq!(
            store.remember_key(&mut storage, 99, &[0u8; KEY_LEN]),
            Err(PairingError::NoFreeSlot)
        );
        assert!(store.forget_peer(&mut storage, 12));
        assert_eq!(storage.len(), MAX_PEERS - 1);
        store.remember_key(&mut storage, 99, &[0u8; KEY_LEN]).unwrap();
        assert!(store.has_key(99));
        assert!(!store.has_key(12));
    }

    #[test]
    fn state_survives_reload() {
        let mut storage = MemoryStorage::new();
        {
            let mut store = PairingStore::new(1);
            store.remember_key(&mut storage, 2, &[7u8; KEY_LEN]).unwrap();
            store.remember_key(&mut storage, 3, &[8u8; KEY_LEN]).unwrap();
            assert!(store.check_replay_and_update(&mut storage, 3, 42));
            store.forget_peer(&mut storage, 2);
        }
        let mut store = PairingStore::new(1);
        assert_eq!(store.begin(&mut storage), 1);
        assert!(!store.has_key(2));
        assert_eq!(store.load_key(3), Some([8u8; KEY_LEN]));
        assert_eq!(store.last_msg_id(3), Some(42));
    }

    #[test]
    fn sent_accept_survives_reload_and_rekey_clears_it() {
        let mut storage = MemoryStorage::new();
        {
            let mut store = PairingStore::new(1);
            store.derive_from_request(&mut storage, 2, 0x1111, 0x2222).unwrap();
            store.record_sent_accept(&mut storage, 2, 40, 0x2222);
            assert_eq!(store.sent_accept(2, 40), Some(0x2222));
            assert_eq!(store.sent_accept(2, 41), None);
        }
        let mut store = PairingStore::new(1);
        assert_eq!(store.begin(&mut storage), 1);
        assert_eq!(store.sent_accept(2, 40), Some(0x2222));

        store.remember_key(&mut storage, 2, &[3u8; KEY_LEN]).unwrap();
        assert_eq!(store.sent_accept(2, 40), None);
        assert!(storage.get("a0").unwrap().is_none());
    }

    #[test]
    fn forget_removes_accept_record() {
        let mut storage = MemoryStorage::new();
        let mut store = PairingStore::new(1);
        store.derive_from_request(&mut storage, 2, 1, 2).unwrap();
        store.record_sent_accept(&mut storage, 2, 7, 2);
        assert_eq!(storage.len(), 2);
        assert!(store.forget_peer(&mut storage, 2));
        assert!(storage.is_empty());
    }

    #[test]
    fn persist_failure_keeps_memory_state() {
        let mut storage = FailingStorage::default();
        let mut store = PairingStore::new(1);
        store.remember_key(&mut storage, 2, &[4u8; KEY_LEN]).unwrap();
        assert!(store.has_key(2));
        assert!(store.check_replay_and_update(&mut storage, 2, 9));
        assert!(!store.check_replay_and_update(&mut storage, 2, 9));
        assert_eq!(store.last_msg_id(2), Some(9));
        assert_eq!(storage.writes, 2);
    }

    #[test]
    fn legacy_records_are_rewritten_on_load() {
        let mut storage = MemoryStorage::new();
        let mut legacy = [0u8; crate::storage::LEGACY_PEER_RECORD_LEN];
        legacy[0] = 1;
        legacy[2..4].copy_from_slice(&5u16.to_le_bytes());
        legacy[4..8].copy_from_slice(&9u32.to_le_bytes());
        storage.put("p4", &legacy).unwrap();

        let mut store = PairingStore::new(1);
        assert_eq!(store.begin(&mut storage), 1);
        assert_eq!(store.last_msg_id(5), Some(9));
        let rewritten = storage.get("p4").unwrap().unwrap();
        assert_eq!(rewritten.len(), 39);
    }
}
