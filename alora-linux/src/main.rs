// Alora Linux host: UDP multicast radio bench, file-backed pairing store, stdin console.

mod config;
mod console;
mod radio;
mod storage;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alora_core::{AloraCore, EngineError, Event, PairingOutcome, Radio, Storage};
use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use console::Command;
use radio::{RadioStats, Received, UdpRadio};
use storage::FileStorage;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TICK: Duration = Duration::from_millis(250);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("alora-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            r = run(cfg) => r,
            r = shutdown_signal() => r,
        }
    })
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let storage = FileStorage::open(&cfg.state_dir)
        .with_context(|| format!("opening state dir {}", cfg.state_dir.display()))?;
    let socket = radio::make_multicast_socket(cfg.radio_port)
        .await
        .with_context(|| format!("binding radio port {}", cfg.radio_port))?;
    let socket = Arc::new(socket);
    let stats = Arc::new(RadioStats::default());
    let mut radio = UdpRadio::new(cfg.node_addr, socket.clone(), cfg.radio_port, stats.clone());
    if !radio.begin() {
        anyhow::bail!("radio failed to start");
    }

    let mut core = AloraCore::new(cfg.node_addr, storage, cfg.engine.clone());
    let peers = core.begin();
    info!(
        node = cfg.node_addr,
        port = cfg.radio_port,
        state = %cfg.state_dir.display(),
        peers,
        "alora-linux {} up",
        VERSION
    );
    println!("{}", console::HELP);

    let (rx_tx, rx_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let rx_stats = stats.clone();
    let local = cfg.node_addr;
    tokio::spawn(async move {
        if let Err(e) = radio::run_receiver(socket, local, rx_tx, rx_stats).await {
            warn!(error = %e, "radio receiver stopped");
        }
    });
    tokio::spawn(async move {
        if let Err(e) = console::run(cmd_tx).await {
            warn!(error = %e, "console stopped");
        }
    });

    engine_loop(core, radio, stats, rx_rx, cmd_rx).await
}

/// Single owner of the engine: radio frames, console commands and the tick are
/// serialized here.
async fn engine_loop<S: Storage>(
    mut core: AloraCore<S>,
    mut radio: UdpRadio,
    stats: Arc<RadioStats>,
    mut rx: mpsc::Receiver<Received>,
    mut commands: mpsc::Receiver<Command>,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let now_ms = || start.elapsed().as_millis() as u32;
    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(f) = frame else {
                    anyhow::bail!("radio receiver closed");
                };
                core.on_packet(&mut radio, f.src, &f.packet, f.rssi, f.snr, now_ms());
            }
            cmd = commands.recv() => match cmd {
                None | Some(Command::Quit) => {
                    info!("quit");
                    return Ok(());
                }
                Some(cmd) => handle_command(&mut core, &mut radio, &stats, cmd, now_ms()),
            },
            _ = tick.tick() => core.tick(&mut radio, now_ms()),
        }
        while let Some(event) = core.poll_event() {
            show_event(&event);
        }
    }
}

fn handle_command<S: Storage>(
    core: &mut AloraCore<S>,
    radio: &mut UdpRadio,
    stats: &RadioStats,
    cmd: Command,
    now: u32,
) {
    let result: Result<Option<u32>, EngineError> = match cmd {
        Command::Send { to, text } => core.send_chat(radio, now, to, text.as_bytes()).map(Some),
        Command::Secure { to, text } => {
            core.send_secure(radio, now, to, text.as_bytes()).map(Some)
        }
        Command::Pair(peer) => core.request_pairing(radio, now, peer).map(Some),
        Command::Forget(peer) => {
            if core.forget_peer(peer) {
                println!("forgot {}", peer);
            } else {
                println!("{} was not paired", peer);
            }
            Ok(None)
        }
        Command::Status => {
            print_status(core, stats, now);
            Ok(None)
        }
        Command::Quit => Ok(None),
    };
    match result {
        Ok(Some(msg_id)) => println!("queued #{}", msg_id),
        Ok(None) => {}
        Err(EngineError::Busy) => println!("busy: all send slots in use, try again shortly"),
        Err(EngineError::NoKey(peer)) => println!("not paired with {}; /pair {} first", peer, peer),
        Err(e) => println!("{}", e),
    }
}

fn print_status<S: Storage>(core: &AloraCore<S>, stats: &RadioStats, now: u32) {
    let counters = core.counters();
    println!(
        "node {} | airtime {}/{} ms (reset in {} s) | rx {} tx {} ({} ms on air)",
        core.local_address(),
        core.airtime_used_ms(),
        core.airtime_budget_ms(),
        core.ms_until_airtime_reset(now) / 1000,
        counters.rx_count(),
        counters.tx_count(),
        counters.tx_airtime_ms(),
    );
    println!(
        "udp sent {} failed {} received {} dropped {}",
        stats.sent.load(Ordering::Relaxed),
        stats.send_failed.load(Ordering::Relaxed),
        stats.received.load(Ordering::Relaxed),
        stats.dropped.load(Ordering::Relaxed),
    );
    println!("{} paired peer(s)", core.pairing().peer_count());
    for (peer, last) in core.pairing().peers() {
        println!("paired {} (last id {})", peer, last);
    }
    for p in core.pending() {
        println!(
            "pending #{} -> {} ({} attempts)",
            p.msg_id(),
            p.dst,
            p.attempts
        );
    }
}

fn show_event(event: &Event) {
    match event {
        Event::Delivered { to, msg_id } => println!("#{} delivered to {}", msg_id, to),
        Event::DeliveryFailed { to, msg_id } => println!("#{} to {} FAILED", msg_id, to),
        Event::Incoming { from, text, secure, .. } => {
            let lock = if *secure { "[secure] " } else { "" };
            println!("<{}> {}{}", from, lock, String::from_utf8_lossy(text));
        }
        Event::Presence { peer, rssi, snr, status } => println!(
            "{} is {} (rssi {} snr {:.1})",
            peer,
            String::from_utf8_lossy(status),
            rssi,
            snr
        ),
        Event::Pairing { peer, outcome } => match outcome {
            PairingOutcome::Requested => println!("pairing with {}...", peer),
            PairingOutcome::Accepted => println!("paired with {}", peer),
            PairingOutcome::Failed => println!("pairing with {} failed", peer),
        },
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown");
    Ok(())
}
