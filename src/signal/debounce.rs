//! Time-based debouncing for push buttons.
//!
//! Edges are classified by their direction as reported by the interrupt, not
//! by reading the pin level afterwards, so a press shorter than interrupt
//! latency is still seen as a press followed by a release. A release that
//! lands inside the window is held back, not lost.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(20);

/// Sentinel for "no edge accepted yet".
const NEVER: u64 = u64::MAX;

/// Edge direction reported by the GPIO interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Debounced button transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Pressed,
    Released,
}

/// Lock-free debouncer usable from interrupt context.
///
/// Every edge updates the raw level. A raw level that differs from the
/// debounced state is committed once `window` has passed since the previously
/// committed edge: immediately by the edge itself when it lands outside the
/// window, otherwise by a later [`settle`](Self::settle). Bounces that return
/// to the debounced state inside the window leave nothing to commit.
pub struct EdgeDebouncer {
    window_us: u64,
    last_accepted_us: AtomicU64,
    pressed: AtomicBool,
    raw: AtomicBool,
}

impl EdgeDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window_us: window.as_micros() as u64,
            last_accepted_us: AtomicU64::new(NEVER),
            pressed: AtomicBool::new(false),
            raw: AtomicBool::new(false),
        }
    }

    /// Feed one edge with a monotonic timestamp in microseconds.
    pub fn on_edge(&self, edge: Edge, now_us: u64) -> Option<ButtonEvent> {
        self.raw.store(edge == Edge::Rising, Ordering::Release);
        self.settle(now_us)
    }

    /// Commit a raw level that has outlived the window.
    ///
    /// Call this after the window has elapsed when no further edge is
    /// expected, e.g. after a release that landed inside the window.
    pub fn settle(&self, now_us: u64) -> Option<ButtonEvent> {
        let target = self.raw.load(Ordering::Acquire);
        if self.pressed.load(Ordering::Acquire) == target {
            return None;
        }

        let last = self.last_accepted_us.load(Ordering::Acquire);
        if last != NEVER && now_us.saturating_sub(last) < self.window_us {
            return None;
        }
        if self
            .last_accepted_us
            .compare_exchange(last, now_us, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another edge won the race.
            return None;
        }

        self.pressed.store(target, Ordering::Release);
        Some(if target {
            ButtonEvent::Pressed
        } else {
            ButtonEvent::Released
        })
    }

    /// Debounced held state.
    pub fn is_pressed(&self) -> bool {
        self.pressed.load(Ordering::Acquire)
    }

    /// Level implied by the most recent edge, debounced or not.
    pub fn raw_pressed(&self) -> bool {
        self.raw.load(Ordering::Acquire)
    }

    /// Whether a change is waiting for the window to pass.
    pub fn is_settling(&self) -> bool {
        self.raw_pressed() != self.is_pressed()
    }

    pub fn window(&self) -> Duration {
        Duration::from_micros(self.window_us)
    }
}

impl Default for EdgeDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_and_release() {
        let d = EdgeDebouncer::default();
        assert_eq!(d.on_edge(Edge::Rising, 0), Some(ButtonEvent::Pressed));
        assert!(d.is_pressed());
        assert_eq!(d.on_edge(Edge::Falling, 500_000), Some(ButtonEvent::Released));
        assert!(!d.is_pressed());
    }

    #[test]
    fn test_bounce_inside_window_is_ignored() {
        let d = EdgeDebouncer::new(Duration::from_millis(20));
        assert_eq!(d.on_edge(Edge::Rising, 1_000), Some(ButtonEvent::Pressed));
        assert_eq!(d.on_edge(Edge::Falling, 3_000), None);
        assert_eq!(d.on_edge(Edge::Rising, 4_000), None);
        assert!(d.is_pressed());
        assert_eq!(d.on_edge(Edge::Falling, 40_000), Some(ButtonEvent::Released));
    }

    #[test]
    fn test_repeated_edge_direction_is_ignored() {
        let d = EdgeDebouncer::default();
        assert_eq!(d.on_edge(Edge::Falling, 0), None);
        assert_eq!(d.on_edge(Edge::Rising, 100_000), Some(ButtonEvent::Pressed));
        assert_eq!(d.on_edge(Edge::Rising, 200_000), None);
    }

    #[test]
    fn test_short_press_is_not_lost() {
        // Both edges arrive before anything could read the pin level.
        let d = EdgeDebouncer::new(Duration::from_millis(5));
        assert_eq!(d.on_edge(Edge::Rising, 0), Some(ButtonEvent::Pressed));
        assert_eq!(d.on_edge(Edge::Falling, 6_000), Some(ButtonEvent::Released));
    }

    #[test]
    fn test_release_inside_window_settles_later() {
        let d = EdgeDebouncer::new(Duration::from_millis(20));
        assert_eq!(d.on_edge(Edge::Rising, 0), Some(ButtonEvent::Pressed));
        assert_eq!(d.on_edge(Edge::Falling, 10_000), None);
        assert!(d.is_pressed());
        assert!(d.is_settling());

        // No further edge arrives.
        assert_eq!(d.settle(15_000), None);
        assert_eq!(d.settle(20_000), Some(ButtonEvent::Released));
        assert!(!d.is_pressed());
        assert!(!d.is_settling());
        assert_eq!(d.settle(40_000), None);
    }

    #[test]
    fn test_bounce_back_leaves_nothing_to_settle() {
        let d = EdgeDebouncer::new(Duration::from_millis(20));
        assert_eq!(d.on_edge(Edge::Rising, 0), Some(ButtonEvent::Pressed));
        assert_eq!(d.on_edge(Edge::Falling, 2_000), None);
        assert_eq!(d.on_edge(Edge::Rising, 4_000), None);
        assert!(!d.is_settling());
        assert_eq!(d.settle(100_000), None);
        assert!(d.is_pressed());
    }

    #[test]
    fn test_zero_window_accepts_every_change() {
        let d = EdgeDebouncer::new(Duration::ZERO);
        assert_eq!(d.on_edge(Edge::Rising, 10), Some(ButtonEvent::Pressed));
        assert_eq!(d.on_edge(Edge::Falling, 10), Some(ButtonEvent::Released));
    }
}
