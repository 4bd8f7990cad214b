//! Alora chat protocol engine for LoRa handhelds.
//! Host-driven: no I/O; the host passes packets and ticks in and supplies the radio
//! and non-volatile storage.

pub mod airtime;
pub mod config;
pub mod dedupe;
pub mod delivery;
pub mod packet;
pub mod pairing;
pub mod radio;
pub mod secure;
pub mod sequence;
pub mod storage;
pub mod wire;

pub mod core;
pub mod ffi;

pub use airtime::{AirtimeBudget, LinkCounters, LoRaParams};
pub use config::Config;
pub use crate::core::{AloraCore, EngineError, Event, MessageText, PairingOutcome};
pub use delivery::RetryPolicy;
pub use packet::{NodeAddr, PacketKind, WireChatPacket, BROADCAST_ADDR, TEXT_CAPACITY};
pub use radio::Radio;
pub use storage::{MemoryStorage, Storage, StorageError};
pub use wire::{decode_frame, encode_frame, PacketDecodeError, FRAME_LEN, PACKET_LEN, WIRE_VERSION};
