//! Node configuration.
//!
//! [`NodeConfig`] gathers radio, audio and pin settings plus the transmit
//! payload. Every field has a default matching the reference board, and a
//! JSON file may override any subset of them.
//!
//! ```
//! use lora_audio_node::config::NodeConfig;
//!
//! let config = NodeConfig::from_json(r#"{"payload": "hello"}"#).unwrap();
//! assert_eq!(config.payload, "hello");
//! assert_eq!(config.radio.frequency_hz, 865_100_000);
//! ```

use crate::audio::{AudioConfig, AudioConfigError};
use crate::lora::{RadioConfig, RadioConfigError, DEFAULT_FRAME_QUEUE_DEPTH, MAX_PAYLOAD_LEN};
use crate::signal::DEFAULT_DEBOUNCE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Payload sent on each transmit button press.
pub const DEFAULT_PAYLOAD: &str = "Chevy LS1 5.7L";

/// BOOT button on the T3-S3.
pub const DEFAULT_TRANSMIT_BUTTON_GPIO: u8 = 0;

/// On-board LED on the T3-S3.
pub const DEFAULT_INDICATOR_GPIO: u8 = 37;

/// I2S audio interface lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2sPins {
    pub bclk: u8,
    pub ws: u8,
    pub din: u8,
    pub dout: u8,
}

/// GPIO assignments for the buttons, the activity indicator and audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub transmit_button: u8,
    /// Push-to-record button. Recording is disabled without one.
    pub record_button: Option<u8>,
    pub indicator_led: Option<u8>,
    /// Audio codec interface. Recording is disabled without one.
    pub i2s: Option<I2sPins>,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            transmit_button: DEFAULT_TRANSMIT_BUTTON_GPIO,
            record_button: None,
            indicator_led: Some(DEFAULT_INDICATOR_GPIO),
            i2s: None,
        }
    }
}

impl PinConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut pins = vec![
            Some(self.transmit_button),
            self.record_button,
            self.indicator_led,
        ];
        if let Some(i2s) = self.i2s {
            pins.extend([i2s.bclk, i2s.ws, i2s.din, i2s.dout].map(Some));
        }
        let mut used = Vec::new();
        for pin in pins.into_iter().flatten() {
            if used.contains(&pin) {
                return Err(ConfigError::PinConflict(pin));
            }
            used.push(pin);
        }
        Ok(())
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub radio: RadioConfig,
    pub audio: AudioConfig,
    pub pins: PinConfig,
    pub payload: String,
    /// Received frames buffered between the receive callback and the consumer.
    pub frame_queue_depth: usize,
    pub debounce_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            audio: AudioConfig::default(),
            pins: PinConfig::default(),
            payload: DEFAULT_PAYLOAD.to_string(),
            frame_queue_depth: DEFAULT_FRAME_QUEUE_DEPTH,
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
        }
    }
}

impl NodeConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.radio.validate()?;
        self.audio.validate()?;
        self.pins.validate()?;
        if self.payload.is_empty() {
            return Err(ConfigError::PayloadEmpty);
        }
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadTooLong {
                len: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Radio(RadioConfigError),
    Audio(AudioConfigError),
    PayloadEmpty,
    PayloadTooLong { len: usize, max: usize },
    /// The same GPIO is assigned twice.
    PinConflict(u8),
    Io(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radio(e) => write!(f, "radio: {}", e),
            Self::Audio(e) => write!(f, "audio: {}", e),
            Self::PayloadEmpty => write!(f, "payload cannot be empty"),
            Self::PayloadTooLong { len, max } => {
                write!(f, "payload too long: {} bytes (max {})", len, max)
            }
            Self::PinConflict(pin) => write!(f, "GPIO {} assigned more than once", pin),
            Self::Io(msg) => write!(f, "cannot read config: {}", msg),
            Self::Parse(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Radio(e) => Some(e),
            Self::Audio(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RadioConfigError> for ConfigError {
    fn from(e: RadioConfigError) -> Self {
        Self::Radio(e)
    }
}

impl From<AudioConfigError> for ConfigError {
    fn from(e: AudioConfigError) -> Self {
        Self::Audio(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.payload, "Chevy LS1 5.7L");
        assert_eq!(config.audio.block_count(), 6);
        assert_eq!(config.debounce(), DEFAULT_DEBOUNCE);
    }

    #[test]
    fn test_payload_limits() {
        let mut config = NodeConfig {
            payload: String::new(),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PayloadEmpty));

        config.payload = "x".repeat(MAX_PAYLOAD_LEN + 1);
        assert_eq!(
            config.validate(),
            Err(ConfigError::PayloadTooLong {
                len: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN
            })
        );
    }

    #[test]
    fn test_pin_conflict() {
        let config = NodeConfig {
            pins: PinConfig {
                transmit_button: 0,
                record_button: Some(37),
                indicator_led: Some(37),
                i2s: None,
            },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PinConflict(37)));

        let config = NodeConfig {
            pins: PinConfig {
                record_button: Some(21),
                i2s: Some(I2sPins {
                    bclk: 14,
                    ws: 15,
                    din: 21,
                    dout: 16,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PinConflict(21)));
    }

    #[test]
    fn test_nested_json_override() {
        let config = NodeConfig::from_json(
            r#"{"radio": {"spreading_factor": "sf10"}, "pins": {"record_button": 21}}"#,
        )
        .unwrap();
        assert_eq!(config.radio.spreading_factor.value(), 10);
        assert_eq!(config.pins.record_button, Some(21));
        assert_eq!(config.pins.indicator_led, Some(DEFAULT_INDICATOR_GPIO));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            NodeConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::from_json(r#"{"radio": {"frequency_hz": 10}}"#),
            Err(ConfigError::Radio(RadioConfigError::FrequencyOutOfRange(10)))
        ));
        assert!(matches!(
            NodeConfig::load("/nonexistent/node.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
