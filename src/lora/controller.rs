//! Half-duplex radio arbitration.
//!
//! [`RadioController`] owns the single modem and is the only way to drive it.
//! It is moved into exactly one task; there is no internal lock around the
//! state machine, only around the receive listener that the driver context
//! shares.
//!
//! # State machine
//!
//! ```text
//! Idle --configure(rx)+start_receive--> Receiving
//! Receiving --transmit_cycle--> TransmitPending
//! TransmitPending --stop_receive+configure(tx)--> Transmitting
//! Transmitting --send done; configure(rx)+start_receive--> Receiving
//! ```
//!
//! Receive is always cancelled, synchronously, before the direction changes.
//! `configure` enforces this itself: calling it while receive is armed first
//! performs the stop handshake and parks the listener, so a direction change
//! under an armed receiver cannot happen. [`RadioController::resume_receive`]
//! re-arms a parked listener.
//!
//! # Failure policy
//!
//! A failed configure or send inside a transmit cycle is logged and the
//! controller still returns to `Receiving`; one bad transmission never leaves
//! the node deaf.

use super::airtime::time_on_air;
use super::config::{Direction, RadioConfig, MAX_PAYLOAD_LEN};
use super::device::{hex_bytes, RadioDevice, RxCallback, RxEvent};
use super::error::{DeviceOp, RadioError};
use crate::errno;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    /// Not receiving. The boot state, and the state after an explicit stop.
    Idle,
    /// Continuous receive armed.
    Receiving,
    /// Transmit requested; receive is being cancelled.
    TransmitPending,
    /// Payload on the air.
    Transmitting,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Receiving => write!(f, "receiving"),
            Self::TransmitPending => write!(f, "transmit-pending"),
            Self::Transmitting => write!(f, "transmitting"),
        }
    }
}

/// Listener shared between the controller and the driver's receive context.
type ListenerSlot = Arc<Mutex<Option<RxCallback>>>;

fn lock_listener(slot: &Mutex<Option<RxCallback>>) -> MutexGuard<'_, Option<RxCallback>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Receive listener mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Owner of the half-duplex modem.
pub struct RadioController<D: RadioDevice> {
    device: D,
    /// Configuration currently applied to the device.
    applied: Option<RadioConfig>,
    /// Last configuration the device accepted, used to recover receive.
    last_good: Option<RadioConfig>,
    state: RadioState,
    /// Set while a device receive registration is active.
    armed: Option<ListenerSlot>,
    /// Listener waiting to be re-armed.
    parked: Option<RxCallback>,
    state_tx: watch::Sender<RadioState>,
}

impl<D: RadioDevice> RadioController<D> {
    /// Take ownership of a modem.
    ///
    /// Fails with [`RadioError::DeviceNotReady`] if the hardware never came
    /// up; the rest of the node keeps running without a radio.
    pub fn new(device: D) -> Result<Self, RadioError> {
        if !device.is_ready() {
            error!("LoRa device not ready");
            return Err(RadioError::DeviceNotReady);
        }
        let (state_tx, _) = watch::channel(RadioState::Idle);
        Ok(Self {
            device,
            applied: None,
            last_good: None,
            state: RadioState::Idle,
            armed: None,
            parked: None,
            state_tx,
        })
    }

    /// Current state.
    pub fn state(&self) -> RadioState {
        self.state
    }

    /// Whether continuous receive is armed.
    pub fn is_receiving(&self) -> bool {
        self.armed.is_some()
    }

    /// Whether a listener is waiting for [`resume_receive`](Self::resume_receive).
    pub fn is_receive_parked(&self) -> bool {
        self.armed.is_none() && self.parked.is_some()
    }

    /// Configuration currently applied to the device.
    pub fn config(&self) -> Option<&RadioConfig> {
        self.applied.as_ref()
    }

    /// Watch state transitions from another task.
    pub fn subscribe(&self) -> watch::Receiver<RadioState> {
        self.state_tx.subscribe()
    }

    fn set_state(&mut self, state: RadioState) {
        if self.state != state {
            debug!("Radio {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Apply operating parameters.
    ///
    /// If receive is armed it is cancelled first and its listener parked;
    /// call [`resume_receive`](Self::resume_receive) to re-arm it.
    pub fn configure(&mut self, config: RadioConfig) -> Result<(), RadioError> {
        config.validate()?;

        if self.armed.is_some() {
            debug!("Cancelling receive before reconfiguring");
            self.park_listener()?;
            self.set_state(RadioState::Idle);
        }

        if let Err(code) = self.device.configure(&config) {
            // The device may hold a partial configuration now.
            self.applied = None;
            let err = RadioError::from_code(DeviceOp::Configure, code);
            error!("LoRa device configuration ({}) failed: {}", config.direction, err);
            return Err(err);
        }

        debug!(
            "LoRa configured for {}: {} Hz, SF{}, {} kHz, CR 4/{}, {} dBm",
            config.direction,
            config.frequency_hz,
            config.spreading_factor.value(),
            config.bandwidth.hz() / 1000,
            config.coding_rate.denominator(),
            config.tx_power
        );
        self.applied = Some(config);
        self.last_good = Some(config);
        Ok(())
    }

    /// Arm continuous receive.
    ///
    /// `callback` runs on the driver's receive context, concurrently with the
    /// owner of this controller, and must not block. It sees one
    /// [`RxEvent::Cancelled`] when the registration ends. Any listener that
    /// was armed or parked is replaced.
    pub fn start_receive<F>(&mut self, callback: F) -> Result<(), RadioError>
    where
        F: FnMut(RxEvent<'_>) + Send + 'static,
    {
        if self.armed.is_some() {
            self.stop_receive()?;
        }
        self.parked = None;
        self.arm(Box::new(callback))
    }

    /// Cancel continuous receive and drop the listener.
    ///
    /// Idempotent. When this returns `Ok` the listener has received its
    /// cancellation notice and will not be invoked again.
    pub fn stop_receive(&mut self) -> Result<(), RadioError> {
        self.parked = None;
        if let Some(listener) = self.disarm()? {
            drop(listener);
        }
        self.set_state(RadioState::Idle);
        Ok(())
    }

    /// Re-arm a parked listener, reconfiguring for receive if needed.
    ///
    /// Does nothing if receive is already armed or no listener is parked.
    pub fn resume_receive(&mut self) -> Result<(), RadioError> {
        if self.armed.is_some() {
            return Ok(());
        }
        let base = self.last_good.ok_or(RadioError::NotConfigured)?;
        let rx = base.with_direction(Direction::Receive);
        if self.applied != Some(rx) {
            self.configure(rx)?;
        }
        match self.parked.take() {
            Some(listener) => self.arm(listener),
            None => {
                debug!("No receive listener to resume");
                Ok(())
            }
        }
    }

    /// Blocking transmit under the applied transmit configuration.
    ///
    /// Never partially transmits: a short write from the device is reported
    /// as [`RadioError::TransmitFailed`].
    pub fn send(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        check_payload(data)?;
        let config = self.applied.ok_or(RadioError::NotConfigured)?;
        if config.direction != Direction::Transmit {
            return Err(RadioError::WrongDirection {
                required: Direction::Transmit,
            });
        }
        debug_assert!(self.armed.is_none(), "transmit config with receive armed");

        self.set_state(RadioState::Transmitting);
        debug!(
            "LoRa TX: {} bytes, ~{} ms on air",
            data.len(),
            time_on_air(data.len(), &config).as_millis()
        );
        let result = match self.device.send(data) {
            Ok(sent) if sent == data.len() => Ok(sent),
            Ok(sent) => {
                warn!("LoRa send was short: {} of {} bytes", sent, data.len());
                Err(RadioError::TransmitFailed(-errno::EIO))
            }
            Err(code) => Err(RadioError::from_code(DeviceOp::Send, code)),
        };
        self.set_state(RadioState::Idle);
        result
    }

    /// Run one complete transmission:
    /// `stop_receive -> configure(tx) -> send -> configure(rx) -> start_receive`.
    ///
    /// Returns the first failure, but always attempts to get back to
    /// `Receiving` with the previous listener re-armed.
    pub fn transmit_cycle(&mut self, payload: &[u8]) -> Result<usize, RadioError> {
        check_payload(payload)?;
        let base = self.last_good.ok_or(RadioError::NotConfigured)?;

        self.set_state(RadioState::TransmitPending);
        if let Err(e) = self.park_listener() {
            error!("Failed to cancel reception, transmission skipped: {}", e);
            let state = if self.armed.is_some() {
                RadioState::Receiving
            } else {
                RadioState::Idle
            };
            self.set_state(state);
            return Err(e);
        }

        let result = match self.configure(base.with_direction(Direction::Transmit)) {
            Ok(()) => self.send(payload),
            Err(e) => {
                error!("Failed to configure radio for transmission");
                Err(e)
            }
        };

        match &result {
            Ok(sent) => info!("Transmitted bytes = {}: {}", sent, hex_bytes(payload)),
            Err(e) => error!("LoRa send failed: {}", e),
        }

        if let Err(e) = self.resume_receive() {
            error!("Failed to restart reception: {}", e);
        }
        if self.armed.is_none() {
            self.set_state(RadioState::Idle);
        }
        result
    }

    /// Arm the device with `listener`. On failure the listener is parked.
    fn arm(&mut self, listener: RxCallback) -> Result<(), RadioError> {
        let direction = self.applied.map(|c| c.direction);
        match direction {
            Some(Direction::Receive) => {}
            Some(Direction::Transmit) => {
                self.parked = Some(listener);
                return Err(RadioError::WrongDirection {
                    required: Direction::Receive,
                });
            }
            None => {
                self.parked = Some(listener);
                return Err(RadioError::NotConfigured);
            }
        }

        let slot: ListenerSlot = Arc::new(Mutex::new(Some(listener)));
        let shared = slot.clone();
        let trampoline: RxCallback = Box::new(move |event: RxEvent<'_>| {
            // The controller delivers the cancellation notice itself.
            if event == RxEvent::Cancelled {
                return;
            }
            if let Some(listener) = lock_listener(&shared).as_mut() {
                listener(event);
            }
        });

        if let Err(code) = self.device.start_receive(trampoline) {
            self.parked = lock_listener(&slot).take();
            let err = RadioError::from_code(DeviceOp::Receive, code);
            error!("LoRa recv_async failed: {}", err);
            return Err(err);
        }

        self.armed = Some(slot);
        self.set_state(RadioState::Receiving);
        Ok(())
    }

    /// Stop handshake. Returns the listener once the device has let go of it
    /// and it has seen its cancellation notice. On failure receive stays armed.
    fn disarm(&mut self) -> Result<Option<RxCallback>, RadioError> {
        let Some(slot) = self.armed.take() else {
            return Ok(None);
        };

        if let Err(code) = self.device.stop_receive() {
            self.armed = Some(slot);
            let err = RadioError::from_code(DeviceOp::Receive, code);
            error!("LoRa recv_async failed to stop reception: {}", err);
            return Err(err);
        }

        // Taking the lock waits out a delivery already in progress; after
        // this the trampoline finds the slot empty.
        let mut listener = lock_listener(&slot).take();
        if let Some(listener) = listener.as_mut() {
            listener(RxEvent::Cancelled);
        }
        Ok(listener)
    }

    fn park_listener(&mut self) -> Result<(), RadioError> {
        if let Some(listener) = self.disarm()? {
            self.parked = Some(listener);
        }
        Ok(())
    }
}

fn check_payload(data: &[u8]) -> Result<(), RadioError> {
    if data.is_empty() {
        return Err(RadioError::EmptyPayload);
    }
    if data.len() > MAX_PAYLOAD_LEN {
        return Err(RadioError::PayloadTooLarge {
            size: data.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::loopback::{LoopbackHandle, LoopbackRadio, RadioCall};
    use crate::lora::sink::frame_queue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAYLOAD: &[u8] = b"Chevy LS1 5.7L";

    fn receiving_controller() -> (RadioController<LoopbackRadio>, LoopbackHandle) {
        let (radio, handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        controller.configure(RadioConfig::default()).unwrap();
        controller.start_receive(|_: RxEvent<'_>| {}).unwrap();
        handle.clear_calls();
        (controller, handle)
    }

    #[test]
    fn test_not_ready_device_is_fatal() {
        let (radio, _handle) = LoopbackRadio::not_ready();
        assert!(matches!(
            RadioController::new(radio),
            Err(RadioError::DeviceNotReady)
        ));
    }

    #[test]
    fn test_boot_state_is_idle() {
        let (radio, _handle) = LoopbackRadio::new();
        let controller = RadioController::new(radio).unwrap();
        assert_eq!(controller.state(), RadioState::Idle);
        assert!(controller.config().is_none());
    }

    #[test]
    fn test_receive_requires_receive_config() {
        let (radio, _handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        assert_eq!(
            controller.start_receive(|_: RxEvent<'_>| {}),
            Err(RadioError::NotConfigured)
        );

        let tx = RadioConfig::default().with_direction(Direction::Transmit);
        controller.configure(tx).unwrap();
        assert_eq!(
            controller.start_receive(|_: RxEvent<'_>| {}),
            Err(RadioError::WrongDirection {
                required: Direction::Receive
            })
        );
        assert_eq!(controller.state(), RadioState::Idle);
    }

    #[test]
    fn test_configure_receive_then_start() {
        let (controller, handle) = receiving_controller();
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.is_receiving());
    }

    #[test]
    fn test_transmit_cycle_call_order() {
        let (mut controller, handle) = receiving_controller();

        assert_eq!(controller.transmit_cycle(PAYLOAD), Ok(PAYLOAD.len()));

        assert_eq!(
            handle.calls(),
            vec![
                RadioCall::StopReceive,
                RadioCall::Configure(Direction::Transmit),
                RadioCall::Send(PAYLOAD.to_vec()),
                RadioCall::Configure(Direction::Receive),
                RadioCall::StartReceive,
            ]
        );
        assert!(handle.violations().is_empty());
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.is_receiving());
    }

    #[test]
    fn test_send_failure_still_rearms_receive() {
        let (mut controller, handle) = receiving_controller();
        handle.fail_next_send(-errno::EIO);

        assert_eq!(
            controller.transmit_cycle(PAYLOAD),
            Err(RadioError::TransmitFailed(-errno::EIO))
        );
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.is_receiving());
        assert_eq!(handle.calls().last(), Some(&RadioCall::StartReceive));
    }

    #[test]
    fn test_tx_config_failure_skips_send_and_rearms() {
        let (mut controller, handle) = receiving_controller();
        handle.fail_next_configure(Direction::Transmit, -errno::EBUSY);

        assert_eq!(
            controller.transmit_cycle(PAYLOAD),
            Err(RadioError::ConfigRejected(-errno::EBUSY))
        );
        assert!(handle.sent().is_empty());
        assert_eq!(controller.state(), RadioState::Receiving);
        assert_eq!(
            handle.calls(),
            vec![
                RadioCall::StopReceive,
                RadioCall::Configure(Direction::Transmit),
                RadioCall::Configure(Direction::Receive),
                RadioCall::StartReceive,
            ]
        );
    }

    #[test]
    fn test_failed_stop_skips_transmission() {
        let (mut controller, handle) = receiving_controller();
        handle.fail_next_stop_receive(-errno::EIO);

        assert_eq!(
            controller.transmit_cycle(PAYLOAD),
            Err(RadioError::ReceiveFailed(-errno::EIO))
        );
        assert_eq!(handle.calls(), vec![RadioCall::StopReceive]);
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.violations().is_empty());
    }

    #[test]
    fn test_rx_config_failure_parks_listener_until_resume() {
        let (mut controller, handle) = receiving_controller();
        handle.fail_next_configure(Direction::Receive, -errno::EIO);

        assert_eq!(controller.transmit_cycle(PAYLOAD), Ok(PAYLOAD.len()));
        assert_eq!(controller.state(), RadioState::Idle);
        assert!(!handle.is_receiving());

        controller.resume_receive().unwrap();
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(handle.is_receiving());
    }

    #[test]
    fn test_start_receive_failure_reports_receive_failed() {
        let (radio, handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        controller.configure(RadioConfig::default()).unwrap();
        handle.fail_next_start_receive(-errno::EIO);

        assert_eq!(
            controller.start_receive(|_: RxEvent<'_>| {}),
            Err(RadioError::ReceiveFailed(-errno::EIO))
        );
        assert_eq!(controller.state(), RadioState::Idle);
        assert!(!controller.is_receiving());
        assert!(controller.is_receive_parked());
        assert!(!handle.is_receiving());
    }

    #[test]
    fn test_rearm_failure_after_send_parks_listener_until_resume() {
        let (radio, handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        controller.configure(RadioConfig::default()).unwrap();
        let (sink, mut queue) = frame_queue(4);
        controller.start_receive(sink.into_callback()).unwrap();
        handle.fail_next_start_receive(-errno::EBUSY);

        assert_eq!(controller.transmit_cycle(PAYLOAD), Ok(PAYLOAD.len()));
        assert_eq!(controller.state(), RadioState::Idle);
        assert!(controller.is_receive_parked());
        assert!(!handle.is_receiving());
        assert_eq!(handle.calls().last(), Some(&RadioCall::StartReceive));

        controller.resume_receive().unwrap();
        assert_eq!(controller.state(), RadioState::Receiving);
        assert!(!controller.is_receive_parked());

        // The parked listener is the one that comes back.
        assert!(handle.inject(b"back", -75, 6));
        assert_eq!(queue.try_recv().unwrap().data, b"back");
    }

    #[test]
    fn test_payload_checked_before_touching_radio() {
        let (mut controller, handle) = receiving_controller();
        let big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            controller.transmit_cycle(&big),
            Err(RadioError::PayloadTooLarge {
                size: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN
            })
        );
        assert_eq!(controller.transmit_cycle(&[]), Err(RadioError::EmptyPayload));
        assert!(handle.calls().is_empty());
        assert_eq!(controller.state(), RadioState::Receiving);
    }

    #[test]
    fn test_send_requires_transmit_config() {
        let (mut controller, handle) = receiving_controller();
        assert_eq!(
            controller.send(PAYLOAD),
            Err(RadioError::WrongDirection {
                required: Direction::Transmit
            })
        );
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_configure_while_receiving_cancels_first() {
        let (mut controller, handle) = receiving_controller();
        let tx = RadioConfig::default().with_direction(Direction::Transmit);
        controller.configure(tx).unwrap();

        assert_eq!(
            handle.calls(),
            vec![
                RadioCall::StopReceive,
                RadioCall::Configure(Direction::Transmit)
            ]
        );
        assert!(handle.violations().is_empty());
        assert_eq!(controller.state(), RadioState::Idle);

        controller.resume_receive().unwrap();
        assert!(handle.is_receiving());
    }

    #[test]
    fn test_stop_receive_is_idempotent_and_notifies_once() {
        let (radio, handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        controller.configure(RadioConfig::default()).unwrap();

        let cancels = Arc::new(AtomicUsize::new(0));
        let c = cancels.clone();
        controller
            .start_receive(move |event: RxEvent<'_>| {
                if event == RxEvent::Cancelled {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        controller.stop_receive().unwrap();
        controller.stop_receive().unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(!handle.inject(b"late", -50, 3));
        assert_eq!(controller.state(), RadioState::Idle);

        // Nothing parked after an explicit stop.
        controller.resume_receive().unwrap();
        assert!(!controller.is_receiving());
    }

    #[test]
    fn test_frames_flow_across_a_transmit_cycle() {
        let (radio, handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        controller.configure(RadioConfig::default()).unwrap();

        let (sink, mut queue) = frame_queue(8);
        controller.start_receive(sink.into_callback()).unwrap();

        assert!(handle.inject(b"before", -90, 2));
        controller.transmit_cycle(PAYLOAD).unwrap();
        assert!(handle.inject(b"after", -91, 1));

        assert_eq!(queue.try_recv().unwrap().data, b"before");
        assert_eq!(queue.try_recv().unwrap().data, b"after");
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_no_frames_delivered_after_stop_under_concurrent_rx() {
        let (radio, handle) = LoopbackRadio::new();
        let mut controller = RadioController::new(radio).unwrap();
        controller.configure(RadioConfig::default()).unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        controller
            .start_receive(move |event: RxEvent<'_>| {
                if let RxEvent::Frame(_) = event {
                    d.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let air = handle.clone();
        let injector = std::thread::spawn(move || {
            for i in 0..500u16 {
                air.inject(&i.to_le_bytes(), -80, 4);
            }
        });

        for _ in 0..20 {
            let _ = controller.transmit_cycle(PAYLOAD);
        }
        injector.join().unwrap();

        controller.stop_receive().unwrap();
        let settled = delivered.load(Ordering::SeqCst);
        assert!(!handle.inject(b"late", -80, 4));
        assert_eq!(delivered.load(Ordering::SeqCst), settled);
        assert!(handle.violations().is_empty());
        assert_eq!(handle.sent().len(), 20);
    }

    #[test]
    fn test_state_watch_sees_final_state() {
        let (mut controller, _handle) = receiving_controller();
        let watch = controller.subscribe();
        controller.transmit_cycle(PAYLOAD).unwrap();
        assert_eq!(*watch.borrow(), RadioState::Receiving);
    }
}
