//! Framing: fixed 108-byte little-endian packet layout, optionally prefixed with the
//! 2-byte source address when carried over a host transport.

use crate::packet::{NodeAddr, PacketKind, WireChatPacket, TEXT_CAPACITY};

/// Revision of the on-air layout below.
pub const WIRE_VERSION: u8 = 1;

/// Encoded size of a `WireChatPacket`. Must never change across deployed devices.
pub const PACKET_LEN: usize = 108;

const SRC_SIZE: usize = 2;

/// Encoded size of a host transport frame (source address + packet).
pub const FRAME_LEN: usize = SRC_SIZE + PACKET_LEN;

const OFF_KIND: usize = 0;
const OFF_MSG_ID: usize = 4;
const OFF_TO: usize = 8;
const OFF_FROM: usize = 10;
const OFF_TS: usize = 12;
const OFF_REF: usize = 16;
const OFF_NONCE: usize = 20;
const OFF_TEXT_LEN: usize = 24;
const OFF_RESERVED: usize = 26;
const OFF_TEXT: usize = 28;

/// Encode a packet into its on-air form. Padding bytes (1..4) are always zero.
pub fn encode_packet(pkt: &WireChatPacket) -> [u8; PACKET_LEN] {
    let mut out = [0u8; PACKET_LEN];
    out[OFF_KIND] = pkt.kind as u8;
    out[OFF_MSG_ID..OFF_MSG_ID + 4].copy_from_slice(&pkt.msg_id.to_le_bytes());
    out[OFF_TO..OFF_TO + 2].copy_from_slice(&pkt.to.to_le_bytes());
    out[OFF_FROM..OFF_FROM + 2].copy_from_slice(&pkt.from.to_le_bytes());
    out[OFF_TS..OFF_TS + 4].copy_from_slice(&pkt.ts.to_le_bytes());
    out[OFF_REF..OFF_REF + 4].copy_from_slice(&pkt.ref_msg_id.to_le_bytes());
    out[OFF_NONCE..OFF_NONCE + 4].copy_from_slice(&pkt.nonce.to_le_bytes());
    out[OFF_TEXT_LEN..OFF_TEXT_LEN + 2].copy_from_slice(&(pkt.text_len() as u16).to_le_bytes());
    out[OFF_RESERVED..OFF_RESERVED + 2].copy_from_slice(&pkt.reserved.to_le_bytes());
    out[OFF_TEXT..].copy_from_slice(pkt.raw_text());
    out
}

/// Decode one packet from the front of `bytes`.
pub fn decode_packet(bytes: &[u8]) -> Result<WireChatPacket, PacketDecodeError> {
    if bytes.len() < PACKET_LEN {
        return Err(PacketDecodeError::Truncated(bytes.len()));
    }
    let kind = PacketKind::try_from(bytes[OFF_KIND]).map_err(PacketDecodeError::UnknownKind)?;
    let text_len = read_u16(bytes, OFF_TEXT_LEN);
    if text_len as usize > TEXT_CAPACITY {
        return Err(PacketDecodeError::TextTooLong(text_len));
    }
    let mut pkt = WireChatPacket::new(
        kind,
        read_u32(bytes, OFF_MSG_ID),
        read_u16(bytes, OFF_FROM),
        read_u16(bytes, OFF_TO),
    );
    pkt.ts = read_u32(bytes, OFF_TS);
    pkt.ref_msg_id = read_u32(bytes, OFF_REF);
    pkt.nonce = read_u32(bytes, OFF_NONCE);
    pkt.reserved = read_u16(bytes, OFF_RESERVED);
    let mut text = [0u8; TEXT_CAPACITY];
    text.copy_from_slice(&bytes[OFF_TEXT..PACKET_LEN]);
    pkt.set_raw_text(text, text_len);
    Ok(pkt)
}

/// Encode a host transport frame: 2 bytes LE source address + packet.
pub fn encode_frame(src: NodeAddr, pkt: &WireChatPacket) -> [u8; FRAME_LEN] {
    let mut out = [0u8; FRAME_LEN];
    out[..SRC_SIZE].copy_from_slice(&src.to_le_bytes());
    out[SRC_SIZE..].copy_from_slice(&encode_packet(pkt));
    out
}

/// Decode a host transport frame. Returns the source address and packet.
pub fn decode_frame(bytes: &[u8]) -> Result<(NodeAddr, WireChatPacket), PacketDecodeError> {
    if bytes.len() < FRAME_LEN {
        return Err(PacketDecodeError::Truncated(bytes.len()));
    }
    let src = read_u16(bytes, 0);
    let pkt = decode_packet(&bytes[SRC_SIZE..])?;
    Ok((src, pkt))
}

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

/// Error decoding a packet (short buffer, unknown kind, or bad length field).
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("truncated packet ({0} bytes)")]
    Truncated(usize),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("text length {0} exceeds buffer")]
    TextTooLong(u16),
}
