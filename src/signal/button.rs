//! Button handlers called from GPIO interrupt context.
//!
//! Handlers only touch atomics, the [`SignalGate`] and (for the transmit
//! button) the activity indicator. All real work happens in the worker task
//! waiting on the gate.

use super::debounce::{ButtonEvent, Edge, EdgeDebouncer};
use super::gate::SignalGate;
use embedded_hal::digital::{ErrorType, OutputPin, StatefulOutputPin};
use log::debug;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

/// Rising-edge handler for the send button.
///
/// Each press toggles the indicator and signals the transmit gate. Presses
/// while a transmission is already pending collapse into it.
pub struct TransmitButton<P> {
    gate: Arc<SignalGate>,
    indicator: Mutex<Option<P>>,
    indicator_failed: AtomicBool,
}

impl<P: StatefulOutputPin + Send> TransmitButton<P> {
    pub fn new(gate: Arc<SignalGate>, indicator: Option<P>) -> Self {
        Self {
            gate,
            indicator: Mutex::new(indicator),
            indicator_failed: AtomicBool::new(false),
        }
    }

    /// Interrupt handler body.
    pub fn on_press(&self) {
        self.toggle_indicator();
        self.gate.signal();
    }

    fn toggle_indicator(&self) {
        // Never wait on the lock from an interrupt.
        let mut guard = match self.indicator.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if let Some(pin) = guard.as_mut() {
            if pin.toggle().is_err() {
                // A broken indicator must not affect transmission.
                *guard = None;
                self.indicator_failed.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Whether the indicator was dropped after a failed toggle.
    pub fn indicator_failed(&self) -> bool {
        self.indicator_failed.load(Ordering::Relaxed)
    }

    pub fn gate(&self) -> &Arc<SignalGate> {
        &self.gate
    }
}

/// Both-edges handler for the record button.
///
/// A debounced press signals the record gate; the debounced held state tells
/// the record worker when to stop.
pub struct RecordButton {
    gate: Arc<SignalGate>,
    debouncer: EdgeDebouncer,
    epoch: Instant,
}

impl RecordButton {
    pub fn new(gate: Arc<SignalGate>, debouncer: EdgeDebouncer) -> Self {
        Self {
            gate,
            debouncer,
            epoch: Instant::now(),
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn publish(&self, event: Option<ButtonEvent>) -> Option<ButtonEvent> {
        if event == Some(ButtonEvent::Pressed) {
            self.gate.signal();
        }
        event
    }

    /// Interrupt handler body, with a caller-supplied timestamp.
    pub fn on_edge_at(&self, edge: Edge, now_us: u64) -> Option<ButtonEvent> {
        self.publish(self.debouncer.on_edge(edge, now_us))
    }

    /// Interrupt handler body, timestamped from a monotonic clock.
    pub fn on_edge(&self, edge: Edge) -> Option<ButtonEvent> {
        self.on_edge_at(edge, self.now_us())
    }

    /// Commit an edge that arrived inside the debounce window.
    pub fn settle_at(&self, now_us: u64) -> Option<ButtonEvent> {
        self.publish(self.debouncer.settle(now_us))
    }

    /// [`settle_at`](Self::settle_at) against the monotonic clock.
    pub fn settle(&self) -> Option<ButtonEvent> {
        self.settle_at(self.now_us())
    }

    /// Debounced held state.
    pub fn is_held(&self) -> bool {
        self.debouncer.is_pressed()
    }

    /// Level implied by the last edge. Decides which edge to wait for next.
    pub fn raw_held(&self) -> bool {
        self.debouncer.raw_pressed()
    }

    /// Whether an edge is waiting for [`settle`](Self::settle).
    pub fn is_settling(&self) -> bool {
        self.debouncer.is_settling()
    }

    pub fn debounce_window(&self) -> Duration {
        self.debouncer.window()
    }

    pub fn gate(&self) -> &Arc<SignalGate> {
        &self.gate
    }
}

/// Output pin backed by an atomic, for host runs without GPIO.
#[derive(Clone, Default)]
pub struct VirtualPin {
    level: Arc<AtomicBool>,
}

impl VirtualPin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level, observable through any clone.
    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::Relaxed)
    }
}

impl ErrorType for VirtualPin {
    type Error = Infallible;
}

impl OutputPin for VirtualPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        debug!("Indicator on");
        self.level.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl StatefulOutputPin for VirtualPin {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level.load(Ordering::Relaxed))
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.level.load(Ordering::Relaxed))
    }
}
