//! Load host config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

use alora_core::NodeAddr;

/// Host configuration. File: ~/.config/alora/config.toml or /etc/alora/config.toml.
/// Env overrides: ALORA_NODE_ADDR, ALORA_RADIO_PORT, ALORA_STATE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This device's mesh address (default 1).
    #[serde(default = "default_node_addr")]
    pub node_addr: NodeAddr,
    /// UDP multicast port standing in for the LoRa channel (default 45690).
    #[serde(default = "default_radio_port")]
    pub radio_port: u16,
    /// Directory holding pairing records and the msg id lease.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Protocol engine tunables (`[engine]` table).
    #[serde(default)]
    pub engine: alora_core::Config,
}

fn default_node_addr() -> NodeAddr {
    1
}
fn default_radio_port() -> u16 {
    45690
}
fn default_state_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/state/alora"),
        None => PathBuf::from("/var/lib/alora"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_addr: default_node_addr(),
            radio_port: default_radio_port(),
            state_dir: default_state_dir(),
            engine: alora_core::Config::default(),
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("ALORA_NODE_ADDR") {
        match parse_addr(&s) {
            Some(a) => c.node_addr = a,
            None => warn!(value = %s, "ignoring invalid ALORA_NODE_ADDR"),
        }
    }
    if let Some(s) = var("ALORA_RADIO_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.radio_port = p,
            Err(_) => warn!(value = %s, "ignoring invalid ALORA_RADIO_PORT"),
        }
    }
    if let Some(s) = var("ALORA_STATE_DIR") {
        if !s.is_empty() {
            c.state_dir = PathBuf::from(s);
        }
    }
}

/// Decimal or `0x`-prefixed hex node address.
pub fn parse_addr(s: &str) -> Option<NodeAddr> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => NodeAddr::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/alora/config.toml"));
    }
    out.push(PathBuf::from("/etc/alora/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config invalid, using defaults");
            None
        }
    }
}
