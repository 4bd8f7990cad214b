//! Persistence boundary: key/value store trait plus the on-flash record formats.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::packet::NodeAddr;

/// Current persisted peer record version.
pub const PEER_RECORD_VERSION: u8 = 1;

/// Size of a legacy un-versioned peer record (`{inUse u8, peer u16, lastMsgId u32, key[32]}`
/// with C alignment).
pub const LEGACY_PEER_RECORD_LEN: usize = 40;

/// Non-volatile key/value store. Keys are short ASCII names (`p0`..`p5`, `a0`..`a5`, `seq`).
pub trait Storage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

/// Storage failure. Never fatal: in-memory state stays authoritative.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encode/decode: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported record for {key} ({len} bytes)")]
    Unsupported { key: String, len: usize },
}

/// In-memory store (tests, or hosts without flash).
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).get(key)
    }

    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).put(key, bytes)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// Key under which pairing slot `idx` is stored.
pub fn peer_slot_key(idx: usize) -> String {
    format!("p{}", idx)
}

/// Key under which the PairAccept last sent from pairing slot `idx` is stored.
pub fn accept_slot_key(idx: usize) -> String {
    format!("a{}", idx)
}

/// One paired peer as persisted. Absence of a record means the slot is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub version: u8,
    pub peer: NodeAddr,
    pub last_msg_id: u32,
    pub key: [u8; 32],
}

/// Decoded record and whether it came from the legacy layout (caller should rewrite it).
#[derive(Debug)]
pub struct LoadedPeerRecord {
    pub record: PeerRecord,
    pub migrated: bool,
}

impl PeerRecord {
    pub fn new(peer: NodeAddr, last_msg_id: u32, key: [u8; 32]) -> Self {
        Self {
            version: PEER_RECORD_VERSION,
            peer,
            last_msg_id,
            key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a stored record. Accepts the current versioned form and the legacy
    /// 40-byte layout. Returns `Ok(None)` for a legacy record with `inUse == 0`.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Option<LoadedPeerRecord>, StorageError> {
        if bytes.len() == LEGACY_PEER_RECORD_LEN {
            return Ok(Self::decode_legacy(bytes).map(|record| LoadedPeerRecord {
                record,
                migrated: true,
            }));
        }
        let record: PeerRecord = bincode::deserialize(bytes)?;
        if record.version != PEER_RECORD_VERSION {
            return Err(StorageError::Unsupported {
                key: key.to_string(),
                len: bytes.len(),
            });
        }
        Ok(Some(LoadedPeerRecord {
            record,
            migrated: false,
        }))
    }

    fn decode_legacy(bytes: &[u8]) -> Option<PeerRecord> {
        if bytes[0] == 0 {
            return None;
        }
        let peer = u16::from_le_bytes([bytes[2], bytes[3]]);
        let last_msg_id = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[8..40]);
        Some(PeerRecord::new(peer, last_msg_id, key))
    }
}

/// PairAccept last sent from a pairing slot. A retransmitted PairRequest with the same id
/// is answered from this record, also across a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRecord {
    pub peer: NodeAddr,
    pub req_msg_id: u32,
    pub nonce: u32,
}

impl AcceptRecord {
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Store whose writes always fail and which starts empty.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingStorage {
    pub writes: usize,
}

#[cfg(test)]
impl Storage for FailingStorage {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }

    fn put(&mut self, _key: &str, _bytes: &[u8]) -> Result<(), StorageError> {
        self.writes += 1;
        Err(std::io::Error::new(std::io::ErrorKind::Other, "flash write failed").into())
    }

    fn remove(&mut self, _key: &str) -> Result<(), StorageError> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "flash erase failed").into())
    }
}
