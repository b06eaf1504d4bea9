//! LoRa push-to-transmit node with a push-to-record audio path.
//!
//! This library contains platform-independent components that can be tested
//! on the host machine without ESP32 hardware. Hardware backends live behind
//! the `esp32` feature.

pub mod audio;
pub mod config;
pub mod errno;
pub mod lora;
pub mod signal;

// Re-export commonly used items
pub use audio::{AudioBlock, AudioConfig, AudioStream, BlockPool, PoolError, StreamError, Timeout};
pub use config::{ConfigError, NodeConfig};
pub use lora::{
    Direction, FrameSink, RadioConfig, RadioController, RadioError, RadioState, RxEvent,
};
pub use signal::{RecordButton, SignalGate, TransmitButton};
