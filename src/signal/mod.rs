//! Interrupt-to-task signalling: wakeup gates, debouncing and the button
//! handlers that drive them.

pub mod button;
pub mod debounce;
pub mod gate;

pub use button::{RecordButton, TransmitButton, VirtualPin};
pub use debounce::{ButtonEvent, Edge, EdgeDebouncer, DEFAULT_DEBOUNCE};
pub use gate::SignalGate;
