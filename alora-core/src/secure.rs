//! Secure channel: AES-256-CTR keyed by the pairing store.
//!
//! The counter block is built from the packet itself: nonce (LE) at 0, msgId (LE) at 4,
//! sender address at 8, recipient address at 10, zero padding to 16. Both ends place the
//! sender first so they derive the same block. No authentication tag: confidentiality
//! only, corrupted ciphertext decrypts to garbage rather than failing.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::packet::NodeAddr;

/// Shared key length.
pub const KEY_LEN: usize = 32;

/// 128-bit big-endian counter, incremented per block.
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Build the initial counter block for one packet.
pub fn counter_block(nonce: u32, msg_id: u32, sender: NodeAddr, recipient: NodeAddr) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..4].copy_from_slice(&nonce.to_le_bytes());
    iv[4..8].copy_from_slice(&msg_id.to_le_bytes());
    iv[8..10].copy_from_slice(&sender.to_le_bytes());
    iv[10..12].copy_from_slice(&recipient.to_le_bytes());
    iv
}

/// Apply the keystream in place. Self-inverse.
pub fn apply_keystream(
    key: &[u8; KEY_LEN],
    sender: NodeAddr,
    recipient: NodeAddr,
    nonce: u32,
    msg_id: u32,
    buf: &mut [u8],
) {
    let iv = counter_block(nonce, msg_id, sender, recipient);
    let mut cipher = Aes256Ctr::new(&(*key).into(), &iv.into());
    cipher.apply_keystream(buf);
}

/// Apply the keystream from `input` into `output`. Lengths must match.
pub fn apply_keystream_b2b(
    key: &[u8; KEY_LEN],
    sender: NodeAddr,
    recipient: NodeAddr,
    nonce: u32,
    msg_id: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<(), SecureChannelError> {
    if input.len() != output.len() {
        return Err(SecureChannelError::LengthMismatch {
            input: input.len(),
            output: output.len(),
        });
    }
    output.copy_from_slice(input);
    apply_keystream(key, sender, recipient, nonce, msg_id, output);
    Ok(())
}

/// Encrypt a payload we are sending to `peer`.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    local: NodeAddr,
    peer: NodeAddr,
    nonce: u32,
    msg_id: u32,
    buf: &mut [u8],
) {
    apply_keystream(key, local, peer, nonce, msg_id, buf);
}

/// Decrypt a payload `peer` sent to us.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    local: NodeAddr,
    peer: NodeAddr,
    nonce: u32,
    msg_id: u32,
    buf: &mut [u8],
) {
    apply_keystream(key, peer, local, nonce, msg_id, buf);
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SecureChannelError {
    #[error("buffer length mismatch: input {input}, output {output}")]
    LengthMismatch { input: usize, output: usize },
}
