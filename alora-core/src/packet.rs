//! Alora wire packet: kinds and the fixed-size chat record shared by every component.

/// 16-bit mesh node address.
pub type NodeAddr = u16;

/// Destination used for presence beacons.
pub const BROADCAST_ADDR: NodeAddr = 0xFFFF;

/// Size of the `text` buffer carried by every packet.
pub const TEXT_CAPACITY: usize = 80;

/// Packet kinds. Discriminants are part of the deployed wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Plaintext direct message.
    Chat = 0,
    /// Delivery receipt; `ref_msg_id` names the acknowledged message.
    Ack = 1,
    /// Ask the mesh to re-resolve a route to `to`.
    Discovery = 2,
    /// Liveness beacon; `text` may carry a short status string.
    Presence = 3,
    /// Pairing handshake, initiator side. `nonce` is the initiator nonce.
    PairRequest = 4,
    /// Pairing handshake, responder side. `ref_msg_id` names the request.
    PairAccept = 5,
    /// AES-256-CTR ciphertext in `text`, keyed by the pairing store.
    SecureChat = 6,
}

impl TryFrom<u8> for PacketKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => PacketKind::Chat,
            1 => PacketKind::Ack,
            2 => PacketKind::Discovery,
            3 => PacketKind::Presence,
            4 => PacketKind::PairRequest,
            5 => PacketKind::PairAccept,
            6 => PacketKind::SecureChat,
            other => return Err(other),
        })
    }
}

/// Direct message / control record. Layout on air is fixed (see `wire`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChatPacket {
    pub kind: PacketKind,
    /// Sender-chosen id, strictly increasing per sender.
    pub msg_id: u32,
    pub to: NodeAddr,
    pub from: NodeAddr,
    /// Best-effort timestamp (seconds).
    pub ts: u32,
    pub ref_msg_id: u32,
    pub nonce: u32,
    text_len: u16,
    /// Carried for layout compatibility; always sent as zero.
    pub reserved: u16,
    text: [u8; TEXT_CAPACITY],
}

impl WireChatPacket {
    /// Empty packet of `kind`; every text byte is zeroed.
    pub fn new(kind: PacketKind, msg_id: u32, from: NodeAddr, to: NodeAddr) -> Self {
        Self {
            kind,
            msg_id,
            to,
            from,
            ts: 0,
            ref_msg_id: 0,
            nonce: 0,
            text_len: 0,
            reserved: 0,
            text: [0u8; TEXT_CAPACITY],
        }
    }

    pub fn ack(msg_id: u32, from: NodeAddr, to: NodeAddr, ref_msg_id: u32) -> Self {
        let mut pkt = Self::new(PacketKind::Ack, msg_id, from, to);
        pkt.ref_msg_id = ref_msg_id;
        pkt
    }

    /// Replace the payload. Input longer than `TEXT_CAPACITY` is truncated; the
    /// tail of the buffer is re-zeroed so nothing stale goes over the air.
    pub fn set_text(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(TEXT_CAPACITY);
        self.text = [0u8; TEXT_CAPACITY];
        self.text[..n].copy_from_slice(&bytes[..n]);
        self.text_len = n as u16;
        n
    }

    /// Valid payload bytes only.
    pub fn text(&self) -> &[u8] {
        &self.text[..self.text_len()]
    }

    /// Valid payload bytes, mutable (in-place encryption).
    pub fn text_mut(&mut self) -> &mut [u8] {
        let n = self.text_len();
        &mut self.text[..n]
    }

    pub fn text_len(&self) -> usize {
        (self.text_len as usize).min(TEXT_CAPACITY)
    }

    pub(crate) fn raw_text(&self) -> &[u8; TEXT_CAPACITY] {
        &self.text
    }

    /// Install a decoded buffer verbatim. `text_len` is already validated.
    pub(crate) fn set_raw_text(&mut self, text: [u8; TEXT_CAPACITY], text_len: u16) {
        self.text = text;
        self.text_len = text_len;
    }
}
