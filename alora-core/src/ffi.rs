//! C ABI for linking alora-core as a static library into the handheld firmware.
//! Return convention: 0 (or a byte count) on success, -1 on bad arguments or input.

use std::os::raw::c_int;
use std::ptr;
use std::slice;

use crate::pairing::derive_key_material;
use crate::secure::{self, KEY_LEN};
use crate::wire::{decode_packet, encode_packet, PACKET_LEN, WIRE_VERSION};

/// Returns the on-air layout revision. Keeps a C symbol in the staticlib.
#[no_mangle]
pub extern "C" fn alora_core_version() -> u8 {
    WIRE_VERSION
}

/// AES-256-CTR transform of `len` bytes from `input` into `output` (encrypt and decrypt
/// are the same call). `sender`/`recipient` are the packet's from/to addresses.
/// `input` and `output` may point to the same buffer.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn alora_ctr_transform(
    key_32: *const u8,
    sender: u16,
    recipient: u16,
    nonce: u32,
    msg_id: u32,
    input: *const u8,
    len: usize,
    output: *mut u8,
) -> c_int {
    if key_32.is_null() || (len > 0 && (input.is_null() || output.is_null())) {
        return -1;
    }
    if len == 0 {
        return 0;
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(unsafe { slice::from_raw_parts(key_32, KEY_LEN) });
    unsafe {
        // Overlap-safe; a no-op when transforming in place.
        ptr::copy(input, output, len);
    }
    let buf = unsafe { slice::from_raw_parts_mut(output, len) };
    secure::apply_keystream(&key, sender, recipient, nonce, msg_id, buf);
    0
}

/// Derive the 32-byte pairing key for the address pair and the XOR of both handshake
/// nonces. Order of `a` and `b` does not matter.
#[no_mangle]
pub extern "C" fn alora_derive_key(a: u16, b: u16, mixed_nonce: u32, out_key_32: *mut u8) -> c_int {
    if out_key_32.is_null() {
        return -1;
    }
    let key = derive_key_material(a.min(b), a.max(b), mixed_nonce);
    unsafe {
        out_key_32.copy_from_nonoverlapping(key.as_ptr(), KEY_LEN);
    }
    0
}

/// Normalize a packet buffer (as laid out by the firmware's C struct) into canonical
/// wire bytes: padding zeroed, text length clamped, kind validated. Returns bytes written
/// (108) or -1.
#[no_mangle]
pub extern "C" fn alora_packet_encode(
    packet: *const u8,
    packet_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if packet.is_null() || out_buf.is_null() || out_buf_len < PACKET_LEN {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(packet, packet_len) };
    let pkt = match decode_packet(bytes) {
        Ok(p) => p,
        Err(_) => return -1,
    };
    let wire = encode_packet(&pkt);
    unsafe {
        ptr::copy(wire.as_ptr(), out_buf, PACKET_LEN);
    }
    PACKET_LEN as c_int
}

/// Validate received bytes and report the packet's kind, msgId and sender. Returns the
/// kind byte (0..=6) or -1 if the bytes are not a valid packet. Out pointers may be null.
#[no_mangle]
pub extern "C" fn alora_packet_decode(
    bytes: *const u8,
    len: usize,
    out_msg_id: *mut u32,
    out_from: *mut u16,
) -> c_int {
    if bytes.is_null() {
        return -1;
    }
    let slice = unsafe { slice::from_raw_parts(bytes, len) };
    let pkt = match decode_packet(slice) {
        Ok(p) => p,
        Err(_) => return -1,
    };
    unsafe {
        if !out_msg_id.is_null() {
            *out_msg_id = pkt.msg_id;
        }
        if !out_from.is_null() {
            *out_from = pkt.from;
        }
    }
    pkt.kind as c_int
}
