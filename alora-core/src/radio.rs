//! Radio collaborator boundary. The engine only sees decoded packets; framing, routing
//! and the receive loop belong to the implementation.

use crate::packet::{NodeAddr, WireChatPacket};

/// Transmit side of the mesh radio. Calls are fire-and-forget and must not block.
pub trait Radio {
    /// Bring the radio up. Hosts that start their radio elsewhere keep the default.
    fn begin(&mut self) -> bool {
        true
    }

    fn local_address(&self) -> NodeAddr;

    /// Queue a direct message for `dst`. Returns false if the radio refused it.
    fn send_dm(&mut self, dst: NodeAddr, pkt: &WireChatPacket) -> bool;

    /// Ask the mesh to refresh its route to `target`.
    fn send_discovery(&mut self, target: NodeAddr, ref_msg_id: u32) -> bool;
}

/// Something the engine handed to a `MemoryRadio`.
#[derive(Debug, Clone, PartialEq)]
pub enum Transmission {
    Dm(NodeAddr, WireChatPacket),
    Discovery { target: NodeAddr, ref_msg_id: u32 },
}

/// Radio that records transmissions instead of sending them (tests, loopback hosts).
#[derive(Debug, Default)]
pub struct MemoryRadio {
    local: NodeAddr,
    pub outbox: Vec<Transmission>,
    /// When set, every send is refused.
    pub offline: bool,
}

impl MemoryRadio {
    pub fn new(local: NodeAddr) -> Self {
        Self {
            local,
            outbox: Vec::new(),
            offline: false,
        }
    }

    /// Take every recorded transmission.
    pub fn drain(&mut self) -> Vec<Transmission> {
        std::mem::take(&mut self.outbox)
    }

    /// Recorded direct messages only.
    pub fn dms(&self) -> impl Iterator<Item = (NodeAddr, &WireChatPacket)> + '_ {
        self.outbox.iter().filter_map(|t| match t {
            Transmission::Dm(dst, pkt) => Some((*dst, pkt)),
            Transmission::Discovery { .. } => None,
        })
    }
}

impl Radio for MemoryRadio {
    fn local_address(&self) -> NodeAddr {
        self.local
    }

    fn send_dm(&mut self, dst: NodeAddr, pkt: &WireChatPacket) -> bool {
        if self.offline {
            return false;
        }
        self.outbox.push(Transmission::Dm(dst, pkt.clone()));
        true
    }

    fn send_discovery(&mut self, target: NodeAddr, ref_msg_id: u32) -> bool {
        if self.offline {
            return false;
        }
        self.outbox.push(Transmission::Discovery { target, ref_msg_id });
        true
    }
}
