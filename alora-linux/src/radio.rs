//! UDP multicast stand-in for the LoRa mesh radio. Every node on the LAN segment joins
//! one group; a frame is the 2-byte source address followed by the 108-byte packet.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alora_core::{
    decode_frame, encode_frame, NodeAddr, PacketKind, Radio, WireChatPacket, BROADCAST_ADDR,
    FRAME_LEN,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);

/// UDP has no link metrics; receivers report these fixed values.
const BENCH_RSSI: i16 = -60;
const BENCH_SNR: f32 = 9.0;

/// A decoded frame for the engine task.
#[derive(Debug)]
pub struct Received {
    pub src: NodeAddr,
    pub packet: WireChatPacket,
    pub rssi: i16,
    pub snr: f32,
}

/// Frame counters shared by the send side and the receive task.
#[derive(Debug, Default)]
pub struct RadioStats {
    pub sent: AtomicU64,
    pub send_failed: AtomicU64,
    pub received: AtomicU64,
    pub dropped: AtomicU64,
}

pub async fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

pub struct UdpRadio {
    local: NodeAddr,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    stats: Arc<RadioStats>,
}

impl UdpRadio {
    pub fn new(local: NodeAddr, socket: Arc<UdpSocket>, port: u16, stats: Arc<RadioStats>) -> Self {
        Self {
            local,
            socket,
            dest: SocketAddr::from((MULTICAST_GROUP, port)),
            stats,
        }
    }

    /// Non-blocking send; a full socket buffer counts as a refused transmission.
    fn send_frame(&self, pkt: &WireChatPacket) -> bool {
        let frame = encode_frame(self.local, pkt);
        match self.socket.try_send_to(&frame, self.dest) {
            Ok(n) if n == FRAME_LEN => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(n) => {
                warn!(written = n, "short udp frame");
                self.stats.send_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(e) => {
                debug!(error = %e, "udp send refused");
                self.stats.send_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl Radio for UdpRadio {
    fn local_address(&self) -> NodeAddr {
        self.local
    }

    fn send_dm(&mut self, dst: NodeAddr, pkt: &WireChatPacket) -> bool {
        if pkt.to != dst {
            let mut addressed = pkt.clone();
            addressed.to = dst;
            return self.send_frame(&addressed);
        }
        self.send_frame(pkt)
    }

    fn send_discovery(&mut self, target: NodeAddr, ref_msg_id: u32) -> bool {
        let mut probe = WireChatPacket::new(PacketKind::Discovery, 0, self.local, target);
        probe.ref_msg_id = ref_msg_id;
        self.send_frame(&probe)
    }
}

/// Receive frames until the engine side goes away. Own frames (multicast loopback),
/// undecodable frames and frames for other nodes are dropped here.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    local: NodeAddr,
    tx: mpsc::Sender<Received>,
    stats: Arc<RadioStats>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(received) = accept_frame(&buf[..n], local) else {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        stats.received.fetch_add(1, Ordering::Relaxed);
        debug!(%from, src = received.src, kind = ?received.packet.kind, "frame received");
        if tx.send(received).await.is_err() {
            return Ok(());
        }
    }
}

fn accept_frame(bytes: &[u8], local: NodeAddr) -> Option<Received> {
    let (src, packet) = match decode_frame(bytes) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, len = bytes.len(), "undecodable frame");
            return None;
        }
    };
    if src == local || (packet.to != local && packet.to != BROADCAST_ADDR) {
        return None;
    }
    Some(Received {
        src,
        packet,
        rssi: BENCH_RSSI,
        snr: BENCH_SNR,
    })
}
