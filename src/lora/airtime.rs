//! LoRa time-on-air calculation.
//!
//! Uses the formula from the Semtech SX1262 datasheet (Section 6.1.4). The
//! controller logs the expected airtime before each transmission and the
//! SX1262 backend derives its TX-done deadline from it.
//!
//! Packets are sent with CRC enabled and an explicit header, except at SF6
//! where the modem only supports implicit header mode.

use super::config::{RadioConfig, SpreadingFactor};
use std::time::Duration;

/// Symbol durations above this need low data rate optimization.
const LDRO_SYMBOL_THRESHOLD_US: u64 = 16_000;

/// Symbol duration in microseconds: `2^SF / BW`.
pub fn symbol_duration_us(config: &RadioConfig) -> u64 {
    let sf = config.spreading_factor.value() as u64;
    (1u64 << sf) * 1_000_000 / config.bandwidth.hz() as u64
}

/// Whether low data rate optimization must be enabled (SF11/SF12 at 125 kHz).
pub fn low_data_rate_optimize(config: &RadioConfig) -> bool {
    symbol_duration_us(config) > LDRO_SYMBOL_THRESHOLD_US
}

/// Airtime of a packet carrying `payload_bytes` in microseconds.
pub fn airtime_us(payload_bytes: usize, config: &RadioConfig) -> u64 {
    let sf = config.spreading_factor.value() as f64;
    let t_sym_us = symbol_duration_us(config) as f64;

    let t_preamble_us = (config.preamble_length as f64 + 4.25) * t_sym_us;

    let de = if low_data_rate_optimize(config) { 1.0 } else { 0.0 };
    let implicit_header = config.spreading_factor == SpreadingFactor::Sf6;
    let h = if implicit_header { 1.0 } else { 0.0 };
    let crc_bits = 16.0;

    // 8*PL - 4*SF + 28 + 16*CRC - 20*H over 4*(SF - 2*DE)
    let numerator = 8.0 * payload_bytes as f64 - 4.0 * sf + 28.0 + crc_bits - 20.0 * h;
    let denominator = 4.0 * (sf - 2.0 * de);
    let cr = config.coding_rate.denominator() as f64;

    let payload_symbols = 8.0 + (numerator / denominator).ceil().max(0.0) * cr;

    (t_preamble_us + payload_symbols * t_sym_us) as u64
}

/// Airtime of a packet as a [`Duration`].
pub fn time_on_air(payload_bytes: usize, config: &RadioConfig) -> Duration {
    Duration::from_micros(airtime_us(payload_bytes, config))
}
