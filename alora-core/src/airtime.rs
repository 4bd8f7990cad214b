//! Airtime discipline: LoRa time-on-air estimate, rolling transmit budget, link counters.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Default transmit budget per window (ms on air).
pub const DEFAULT_AIRTIME_BUDGET_MS: u32 = 1_400;

/// Default rolling window length.
pub const DEFAULT_AIRTIME_WINDOW_MS: u32 = 60_000;

/// Modulation parameters used for the time-on-air estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoRaParams {
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    /// Coding rate denominator offset: 1 = 4/5 .. 4 = 4/8.
    pub coding_rate: u8,
    pub preamble_len: u16,
    pub explicit_header: bool,
    pub crc: bool,
    pub low_data_rate_optimize: bool,
    /// Bytes the mesh layer adds in front of our packet.
    pub mesh_overhead_bytes: u16,
}

impl Default for LoRaParams {
    fn default() -> Self {
        Self {
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            coding_rate: 1,
            preamble_len: 8,
            explicit_header: true,
            crc: true,
            low_data_rate_optimize: false,
            mesh_overhead_bytes: 8,
        }
    }
}

impl LoRaParams {
    /// Estimated time on air for `payload_bytes` of application payload, rounded up to ms.
    pub fn time_on_air_ms(&self, payload_bytes: usize) -> u32 {
        let us = self.time_on_air_us(payload_bytes);
        us.div_ceil(1_000) as u32
    }

    /// Semtech SX127x time-on-air formula, in microseconds.
    pub fn time_on_air_us(&self, payload_bytes: usize) -> u64 {
        let sf = self.spreading_factor.clamp(6, 12) as i64;
        let bw = self.bandwidth_hz.max(1) as u64;
        let cr = self.coding_rate.clamp(1, 4) as i64;
        let t_sym_us = ((1u64 << sf) * 1_000_000) / bw;

        let pl = (payload_bytes + self.mesh_overhead_bytes as usize) as i64;
        let ih = if self.explicit_header { 0 } else { 1 };
        let crc = if self.crc { 1 } else { 0 };
        let de = if self.low_data_rate_optimize { 1 } else { 0 };

        let num = 8 * pl - 4 * sf + 28 + 16 * crc - 20 * ih;
        let den = 4 * (sf - 2 * de);
        let blocks = if num > 0 { (num + den - 1) / den } else { 0 };
        let payload_symbols = 8 + (blocks * (cr + 4)) as u64;

        // Preamble is n + 4.25 symbols; keep quarter symbols in integer math.
        let preamble_quarters = (self.preamble_len as u64) * 4 + 17;
        (preamble_quarters * t_sym_us) / 4 + payload_symbols * t_sym_us
    }
}

/// Rolling-window cap on cumulative transmit time.
#[derive(Debug, Clone)]
pub struct AirtimeBudget {
    params: LoRaParams,
    budget_ms: u32,
    window_ms: u32,
    window_start_ms: u32,
    used_ms: u32,
}

impl AirtimeBudget {
    pub fn new(params: LoRaParams, budget_ms: u32, window_ms: u32) -> Self {
        Self {
            params,
            budget_ms,
            window_ms: window_ms.max(1),
            window_start_ms: 0,
            used_ms: 0,
        }
    }

    /// Try to reserve airtime for one transmission. Non-critical traffic is refused once
    /// `used + estimate` would exceed the budget; critical traffic is always admitted
    /// and still counted.
    pub fn reserve(&mut self, now_ms: u32, payload_bytes: usize, critical: bool) -> bool {
        self.roll(now_ms);
        let estimate = self.estimate_ms(payload_bytes);
        if !critical && self.used_ms.saturating_add(estimate) > self.budget_ms {
            return false;
        }
        self.used_ms = self.used_ms.saturating_add(estimate);
        true
    }

    pub fn estimate_ms(&self, payload_bytes: usize) -> u32 {
        self.params.time_on_air_ms(payload_bytes)
    }

    pub fn used_ms(&self) -> u32 {
        self.used_ms
    }

    pub fn budget_ms(&self) -> u32 {
        self.budget_ms
    }

    /// Display only. Does not roll the window.
    pub fn ms_until_reset(&self, now_ms: u32) -> u32 {
        let elapsed = now_ms.wrapping_sub(self.window_start_ms);
        self.window_ms.saturating_sub(elapsed)
    }

    fn roll(&mut self, now_ms: u32) {
        if now_ms.wrapping_sub(self.window_start_ms) >= self.window_ms {
            self.window_start_ms = now_ms;
            self.used_ms = 0;
        }
    }
}

impl Default for AirtimeBudget {
    fn default() -> Self {
        Self::new(
            LoRaParams::default(),
            DEFAULT_AIRTIME_BUDGET_MS,
            DEFAULT_AIRTIME_WINDOW_MS,
        )
    }
}

/// Link counters: written by the engine, read from any context (status page).
#[derive(Debug, Default)]
pub struct LinkCounters {
    rx: AtomicU32,
    tx: AtomicU32,
    tx_airtime_ms: AtomicU32,
}

impl LinkCounters {
    pub fn record_rx(&self) {
        self.rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx(&self, airtime_ms: u32) {
        self.tx.fetch_add(1, Ordering::Relaxed);
        self.tx_airtime_ms.fetch_add(airtime_ms, Ordering::Relaxed);
    }

    pub fn rx_count(&self) -> u32 {
        self.rx.load(Ordering::Relaxed)
    }

    pub fn tx_count(&self) -> u32 {
        self.tx.load(Ordering::Relaxed)
    }

    pub fn tx_airtime_ms(&self) -> u32 {
        self.tx_airtime_ms.load(Ordering::Relaxed)
    }
}
