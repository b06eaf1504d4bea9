//! In-memory LoRa modem for host runs and tests.
//!
//! [`LoopbackRadio`] implements [`RadioDevice`] without hardware. A
//! [`LoopbackHandle`] sharing its state plays the part of the air and the
//! test bench: it injects frames, scripts failures and exposes the call log.
//!
//! The modem enforces half-duplex rules the way real hardware punishes them:
//! configuring or sending while receive is armed fails with `-EBUSY` and is
//! recorded as a violation.

use super::config::{Direction, RadioConfig};
use super::device::{RadioDevice, RxCallback, RxEvent, RxFrame};
use crate::errno::{self, DeviceResult};
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// A call observed by the loopback modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Configure(Direction),
    Send(Vec<u8>),
    StartReceive,
    StopReceive,
}

#[derive(Default)]
struct Shared {
    ready: bool,
    config: Option<RadioConfig>,
    callback: Option<RxCallback>,
    calls: Vec<RadioCall>,
    violations: Vec<String>,
    configure_failures: VecDeque<(Direction, i32)>,
    send_failures: VecDeque<i32>,
    start_receive_failures: VecDeque<i32>,
    stop_receive_failures: VecDeque<i32>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Loopback radio mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Simulated half-duplex modem.
pub struct LoopbackRadio {
    shared: Arc<Mutex<Shared>>,
}

/// Bench-side handle onto a [`LoopbackRadio`].
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Mutex<Shared>>,
}

impl LoopbackRadio {
    /// Create a ready modem and its bench handle.
    pub fn new() -> (Self, LoopbackHandle) {
        Self::with_ready(true)
    }

    /// Create a modem that never came up.
    pub fn not_ready() -> (Self, LoopbackHandle) {
        Self::with_ready(false)
    }

    fn with_ready(ready: bool) -> (Self, LoopbackHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            ready,
            ..Default::default()
        }));
        (
            Self {
                shared: shared.clone(),
            },
            LoopbackHandle { shared },
        )
    }
}

impl RadioDevice for LoopbackRadio {
    fn is_ready(&self) -> bool {
        lock(&self.shared).ready
    }

    fn configure(&mut self, config: &RadioConfig) -> DeviceResult<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(RadioCall::Configure(config.direction));
        if !shared.ready {
            return Err(-errno::ENODEV);
        }
        if shared.callback.is_some() {
            shared
                .violations
                .push(format!("configure({}) while receiving", config.direction));
            return Err(-errno::EBUSY);
        }
        if let Some(pos) = shared
            .configure_failures
            .iter()
            .position(|(dir, _)| *dir == config.direction)
        {
            if let Some((_, code)) = shared.configure_failures.remove(pos) {
                return Err(code);
            }
        }
        shared.config = Some(*config);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> DeviceResult<usize> {
        let mut shared = lock(&self.shared);
        shared.calls.push(RadioCall::Send(data.to_vec()));
        if !shared.ready {
            return Err(-errno::ENODEV);
        }
        if shared.callback.is_some() {
            shared.violations.push("send while receiving".to_string());
            return Err(-errno::EBUSY);
        }
        match shared.config {
            Some(config) if config.direction == Direction::Transmit => {}
            _ => return Err(-errno::EINVAL),
        }
        if let Some(code) = shared.send_failures.pop_front() {
            return Err(code);
        }
        debug!("Loopback TX: {} bytes", data.len());
        Ok(data.len())
    }

    fn start_receive(&mut self, callback: RxCallback) -> DeviceResult<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(RadioCall::StartReceive);
        if !shared.ready {
            return Err(-errno::ENODEV);
        }
        match shared.config {
            Some(config) if config.direction == Direction::Receive => {}
            _ => return Err(-errno::EINVAL),
        }
        if let Some(code) = shared.start_receive_failures.pop_front() {
            return Err(code);
        }
        shared.callback = Some(callback);
        Ok(())
    }

    fn stop_receive(&mut self) -> DeviceResult<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(RadioCall::StopReceive);
        if let Some(code) = shared.stop_receive_failures.pop_front() {
            return Err(code);
        }
        // Like the RTOS driver, cancellation is reported through the callback
        // once before it is dropped.
        if let Some(mut callback) = shared.callback.take() {
            callback(RxEvent::Cancelled);
        }
        Ok(())
    }
}

impl LoopbackHandle {
    /// Deliver a frame as if it arrived over the air. Returns `false` if the
    /// modem is not receiving.
    pub fn inject(&self, data: &[u8], rssi: i16, snr: i8) -> bool {
        let mut shared = lock(&self.shared);
        match shared.callback.as_mut() {
            Some(callback) => {
                callback(RxEvent::Frame(RxFrame { data, rssi, snr }));
                true
            }
            None => false,
        }
    }

    /// Whether a receive callback is registered.
    pub fn is_receiving(&self) -> bool {
        lock(&self.shared).callback.is_some()
    }

    /// Direction of the last accepted configuration.
    pub fn direction(&self) -> Option<Direction> {
        lock(&self.shared).config.map(|c| c.direction)
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<RadioCall> {
        lock(&self.shared).calls.clone()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        lock(&self.shared).calls.clear();
    }

    /// Payloads that were accepted for transmission.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        let shared = lock(&self.shared);
        shared
            .calls
            .iter()
            .filter_map(|call| match call {
                RadioCall::Send(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Half-duplex rule violations observed.
    pub fn violations(&self) -> Vec<String> {
        lock(&self.shared).violations.clone()
    }

    /// Fail the next configure in `direction` with `code`.
    pub fn fail_next_configure(&self, direction: Direction, code: i32) {
        lock(&self.shared)
            .configure_failures
            .push_back((direction, code));
    }

    /// Fail the next send with `code`.
    pub fn fail_next_send(&self, code: i32) {
        lock(&self.shared).send_failures.push_back(code);
    }

    /// Fail the next start of receive with `code`.
    pub fn fail_next_start_receive(&self, code: i32) {
        lock(&self.shared).start_receive_failures.push_back(code);
    }

    /// Fail the next cancellation of receive with `code`.
    pub fn fail_next_stop_receive(&self, code: i32) {
        lock(&self.shared).stop_receive_failures.push_back(code);
    }
}
