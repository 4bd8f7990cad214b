//! Message-id allocation. Ids are strictly increasing per device, across reboots too:
//! the allocator leases blocks of ids and persists the lease ceiling before handing out
//! any id from a new block.

use tracing::warn;

use crate::storage::{Storage, StorageError};

/// Storage key for the lease ceiling.
pub const SEQ_KEY: &str = "seq";

/// Ids leased per persist.
pub const LEASE_BLOCK: u32 = 64;

#[derive(Debug, Clone)]
pub struct MsgIdAllocator {
    next: u32,
    ceiling: u32,
}

impl MsgIdAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            ceiling: 1,
        }
    }

    /// Resume after the last persisted lease. Unreadable state restarts at 1.
    pub fn begin(&mut self, storage: &mut impl Storage) {
        let stored = match storage.get(SEQ_KEY) {
            Ok(Some(bytes)) => bincode::deserialize::<u32>(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "msg id lease undecodable");
                1
            }),
            Ok(None) => 1,
            Err(e) => {
                warn!(error = %e, "msg id lease unreadable");
                1
            }
        };
        self.next = stored.max(1);
        self.ceiling = self.next;
    }

    /// Next id. Persists a new lease when the current one is used up.
    pub fn next_id(&mut self, storage: &mut impl Storage) -> u32 {
        if self.next >= self.ceiling {
            self.ceiling = self.next.saturating_add(LEASE_BLOCK);
            let persisted = bincode::serialize(&self.ceiling)
                .map_err(StorageError::from)
                .and_then(|bytes| storage.put(SEQ_KEY, &bytes));
            if let Err(e) = persisted {
                warn!(error = %e, ceiling = self.ceiling, "msg id lease persist failed");
            }
        }
        let id = self.next;
        self.next = self.next.saturating_add(1);
        id
    }
}

impl Default for MsgIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
