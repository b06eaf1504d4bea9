//! LoRa radio support.
//!
//! This module contains:
//! - [`config`]: Radio parameters and their standard values
//! - [`airtime`]: Time-on-air calculation for LoRa frames
//! - [`device`]: The modem boundary trait and receive callback types
//! - [`controller`]: Half-duplex arbitration between receive and transmit
//! - [`sink`]: Bounded queue that receive callbacks push frames into
//! - [`worker`]: Button-triggered transmit loop
//! - [`loopback`]: In-memory modem for host runs and tests
//! - [`sx1262`]: SX1262 backend (ESP32 only)

pub mod airtime;
pub mod config;
pub mod controller;
pub mod device;
mod error;
pub mod loopback;
pub mod sink;
pub mod worker;

#[cfg(feature = "esp32")]
pub mod sx1262;

pub use airtime::{airtime_us, time_on_air};
pub use config::{
    Bandwidth, CodingRate, Direction, RadioConfig, RadioConfigError, SpreadingFactor,
    DEFAULT_FREQUENCY_HZ, DEFAULT_PREAMBLE_LENGTH, DEFAULT_TX_POWER, MAX_PAYLOAD_LEN,
};
pub use controller::{RadioController, RadioState};
pub use device::{hex_bytes, RadioDevice, RxCallback, RxEvent, RxFrame};
pub use error::RadioError;
pub use loopback::{LoopbackHandle, LoopbackRadio, RadioCall};
pub use sink::{frame_queue, FrameQueue, FrameSink, ReceivedFrame, DEFAULT_FRAME_QUEUE_DEPTH};
pub use worker::{run_transmit_loop, TransmitSummary};

#[cfg(feature = "esp32")]
pub use sx1262::Sx1262Device;
