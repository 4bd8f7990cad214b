//! Engine tunables. Every field has a default, so a partial TOML table is enough.

use serde::{Deserialize, Serialize};

use crate::airtime::{LoRaParams, DEFAULT_AIRTIME_BUDGET_MS, DEFAULT_AIRTIME_WINDOW_MS};
use crate::dedupe::DEFAULT_DEDUPE_HORIZON_MS;
use crate::delivery::RetryPolicy;

/// Default presence beacon interval.
pub const DEFAULT_PRESENCE_INTERVAL_MS: u32 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Transmit budget per airtime window (ms on air).
    pub airtime_budget_ms: u32,
    /// Airtime window length.
    pub airtime_window_ms: u32,
    /// How long a (source, msgId) pair counts as already processed.
    pub dedupe_horizon_ms: u32,
    /// Presence beacon interval; 0 disables beacons.
    pub presence_interval_ms: u32,
    /// Short status carried in presence beacons.
    pub presence_status: String,
    pub retry: RetryPolicy,
    pub lora: LoRaParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            airtime_budget_ms: DEFAULT_AIRTIME_BUDGET_MS,
            airtime_window_ms: DEFAULT_AIRTIME_WINDOW_MS,
            dedupe_horizon_ms: DEFAULT_DEDUPE_HORIZON_MS,
            presence_interval_ms: DEFAULT_PRESENCE_INTERVAL_MS,
            presence_status: "online".to_string(),
            retry: RetryPolicy::default(),
            lora: LoRaParams::default(),
        }
    }
}
