//! LoRa modem configuration.
//!
//! [`RadioConfig`] holds every operating parameter applied to the radio in a
//! single `configure` call. The default values are the ones the node ships
//! with: EU 865.1 MHz, SF8 at 125 kHz, coding rate 4/5, private network.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default operating frequency in Hz.
pub const DEFAULT_FREQUENCY_HZ: u32 = 865_100_000;

/// Default TX power in dBm.
pub const DEFAULT_TX_POWER: i8 = 14;

/// Default preamble length in symbols.
pub const DEFAULT_PREAMBLE_LENGTH: u16 = 8;

/// Largest payload the node will hand to the radio.
pub const MAX_PAYLOAD_LEN: usize = 128;

/// Lowest frequency accepted by [`RadioConfig::validate`] (SX126x range).
pub const MIN_FREQUENCY_HZ: u32 = 150_000_000;

/// Highest frequency accepted by [`RadioConfig::validate`] (SX126x range).
pub const MAX_FREQUENCY_HZ: u32 = 960_000_000;

/// TX power range supported by the SX1262 high-power PA.
pub const TX_POWER_RANGE: std::ops::RangeInclusive<i8> = -9..=22;

/// LoRa channel bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bandwidth {
    #[serde(rename = "125khz")]
    Khz125,
    #[serde(rename = "250khz")]
    Khz250,
    #[serde(rename = "500khz")]
    Khz500,
}

impl Bandwidth {
    /// Bandwidth in Hz.
    pub fn hz(self) -> u32 {
        match self {
            Self::Khz125 => 125_000,
            Self::Khz250 => 250_000,
            Self::Khz500 => 500_000,
        }
    }
}

/// LoRa spreading factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpreadingFactor {
    Sf6,
    Sf7,
    Sf8,
    Sf9,
    Sf10,
    Sf11,
    Sf12,
}

impl SpreadingFactor {
    /// Numeric spreading factor (6-12).
    pub fn value(self) -> u8 {
        match self {
            Self::Sf6 => 6,
            Self::Sf7 => 7,
            Self::Sf8 => 8,
            Self::Sf9 => 9,
            Self::Sf10 => 10,
            Self::Sf11 => 11,
            Self::Sf12 => 12,
        }
    }
}

/// LoRa forward error correction coding rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodingRate {
    #[serde(rename = "4/5")]
    Cr4_5,
    #[serde(rename = "4/6")]
    Cr4_6,
    #[serde(rename = "4/7")]
    Cr4_7,
    #[serde(rename = "4/8")]
    Cr4_8,
}

impl CodingRate {
    /// Coding rate denominator (5-8 for 4/5 to 4/8).
    pub fn denominator(self) -> u8 {
        match self {
            Self::Cr4_5 => 5,
            Self::Cr4_6 => 6,
            Self::Cr4_7 => 7,
            Self::Cr4_8 => 8,
        }
    }
}

/// Which way the half-duplex radio is pointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Receive,
    Transmit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receive => write!(f, "rx"),
            Self::Transmit => write!(f, "tx"),
        }
    }
}

/// Operating parameters for the LoRa modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Carrier frequency in Hz.
    pub frequency_hz: u32,
    pub bandwidth: Bandwidth,
    pub spreading_factor: SpreadingFactor,
    pub coding_rate: CodingRate,
    /// Preamble length in symbols.
    pub preamble_length: u16,
    /// TX power in dBm.
    pub tx_power: i8,
    /// Public (LoRaWAN) sync word instead of the private one.
    pub public_network: bool,
    pub iq_inverted: bool,
    pub direction: Direction,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            bandwidth: Bandwidth::Khz125,
            spreading_factor: SpreadingFactor::Sf8,
            coding_rate: CodingRate::Cr4_5,
            preamble_length: DEFAULT_PREAMBLE_LENGTH,
            tx_power: DEFAULT_TX_POWER,
            public_network: false,
            iq_inverted: false,
            direction: Direction::Receive,
        }
    }
}

impl RadioConfig {
    /// Copy of this configuration pointed in `direction`.
    pub fn with_direction(self, direction: Direction) -> Self {
        Self { direction, ..self }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), RadioConfigError> {
        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&self.frequency_hz) {
            return Err(RadioConfigError::FrequencyOutOfRange(self.frequency_hz));
        }
        if !TX_POWER_RANGE.contains(&self.tx_power) {
            return Err(RadioConfigError::TxPowerOutOfRange(self.tx_power));
        }
        // SF6 needs a longer preamble; everything else accepts 6+ symbols.
        let min_preamble = if self.spreading_factor == SpreadingFactor::Sf6 {
            12
        } else {
            6
        };
        if self.preamble_length < min_preamble {
            return Err(RadioConfigError::PreambleTooShort {
                len: self.preamble_length,
                min: min_preamble,
            });
        }
        Ok(())
    }
}

/// Invalid radio parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioConfigError {
    FrequencyOutOfRange(u32),
    TxPowerOutOfRange(i8),
    PreambleTooShort { len: u16, min: u16 },
}

impl fmt::Display for RadioConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrequencyOutOfRange(hz) => write!(
                f,
                "frequency {} Hz outside {}-{} Hz",
                hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ
            ),
            Self::TxPowerOutOfRange(dbm) => write!(
                f,
                "tx power {} dBm outside {}..={} dBm",
                dbm,
                TX_POWER_RANGE.start(),
                TX_POWER_RANGE.end()
            ),
            Self::PreambleTooShort { len, min } => {
                write!(f, "preamble of {} symbols is shorter than {}", len, min)
            }
        }
    }
}

impl std::error::Error for RadioConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_node_settings() {
        let config = RadioConfig::default();
        assert_eq!(config.frequency_hz, 865_100_000);
        assert_eq!(config.bandwidth, Bandwidth::Khz125);
        assert_eq!(config.spreading_factor, SpreadingFactor::Sf8);
        assert_eq!(config.coding_rate, CodingRate::Cr4_5);
        assert_eq!(config.preamble_length, 8);
        assert_eq!(config.tx_power, 14);
        assert!(!config.public_network);
        assert!(!config.iq_inverted);
        assert_eq!(config.direction, Direction::Receive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_direction_keeps_modulation() {
        let rx = RadioConfig::default();
        let tx = rx.with_direction(Direction::Transmit);
        assert_eq!(tx.direction, Direction::Transmit);
        assert_eq!(tx.frequency_hz, rx.frequency_hz);
        assert_eq!(tx.spreading_factor, rx.spreading_factor);
    }

    #[test]
    fn test_enum_values() {
        assert_eq!(Bandwidth::Khz250.hz(), 250_000);
        assert_eq!(SpreadingFactor::Sf12.value(), 12);
        assert_eq!(CodingRate::Cr4_8.denominator(), 8);
    }

    #[test]
    fn test_rejects_bad_frequency() {
        let config = RadioConfig {
            frequency_hz: 2_400_000_000,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(RadioConfigError::FrequencyOutOfRange(2_400_000_000))
        );
    }

    #[test]
    fn test_rejects_bad_power() {
        let config = RadioConfig {
            tx_power: 30,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(RadioConfigError::TxPowerOutOfRange(30))
        );
    }

    #[test]
    fn test_sf6_needs_long_preamble() {
        let config = RadioConfig {
            spreading_factor: SpreadingFactor::Sf6,
            preamble_length: 8,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(RadioConfigError::PreambleTooShort { len: 8, min: 12 })
        );
    }

    #[test]
    fn test_json_roundtrip_uses_readable_names() {
        let json = serde_json::to_string(&RadioConfig::default()).unwrap();
        assert!(json.contains("\"125khz\""));
        assert!(json.contains("\"4/5\""));
        assert!(json.contains("\"receive\""));

        let partial: RadioConfig = serde_json::from_str(r#"{"tx_power": 10}"#).unwrap();
        assert_eq!(partial.tx_power, 10);
        assert_eq!(partial.frequency_hz, DEFAULT_FREQUENCY_HZ);
    }
}
