//! Radio device boundary.
//!
//! [`RadioDevice`] is the seam between the controller and a concrete modem
//! driver. Drivers report failures as small negative errno values, mirroring
//! the RTOS driver APIs the hardware backends wrap; the controller maps them
//! to [`RadioError`](super::RadioError) kinds.

use super::config::RadioConfig;
use crate::errno::DeviceResult;

/// A frame delivered by the modem. Borrowed from the driver's buffer, so a
/// callback must copy what it wants to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFrame<'a> {
    pub data: &'a [u8],
    /// RSSI in dBm.
    pub rssi: i16,
    /// SNR in dB.
    pub snr: i8,
}

/// Event handed to a receive callback.
///
/// `Cancelled` marks the end of a receive registration. It is distinct from a
/// `Frame` with an empty payload, which is a genuine zero-byte frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent<'a> {
    Frame(RxFrame<'a>),
    Cancelled,
}

/// Receive callback.
///
/// Runs on a driver-owned context (interrupt or driver thread depending on the
/// backend) concurrently with the controller's owner. It must not block; the
/// intended body pushes into a [`FrameSink`](super::FrameSink).
pub type RxCallback = Box<dyn for<'a> FnMut(RxEvent<'a>) + Send + 'static>;

/// A half-duplex LoRa modem.
pub trait RadioDevice: Send {
    /// Whether the hardware came up and answers commands.
    fn is_ready(&self) -> bool;

    /// Apply operating parameters, including the direction.
    fn configure(&mut self, config: &RadioConfig) -> DeviceResult<()>;

    /// Blocking transmit. Returns the number of bytes sent.
    fn send(&mut self, data: &[u8]) -> DeviceResult<usize>;

    /// Arm continuous receive, delivering frames to `callback`.
    fn start_receive(&mut self, callback: RxCallback) -> DeviceResult<()>;

    /// Cancel continuous receive. When this returns `Ok` the device has
    /// dropped the callback and will not invoke it again.
    fn stop_receive(&mut self) -> DeviceResult<()>;
}

impl<D: RadioDevice + ?Sized> RadioDevice for Box<D> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn configure(&mut self, config: &RadioConfig) -> DeviceResult<()> {
        (**self).configure(config)
    }

    fn send(&mut self, data: &[u8]) -> DeviceResult<usize> {
        (**self).send(data)
    }

    fn start_receive(&mut self, callback: RxCallback) -> DeviceResult<()> {
        (**self).start_receive(callback)
    }

    fn stop_receive(&mut self) -> DeviceResult<()> {
        (**self).stop_receive()
    }
}

/// Format bytes the way received and transmitted payloads are logged.
pub fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("0x{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
