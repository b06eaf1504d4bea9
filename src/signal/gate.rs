//! Single-slot wakeup from interrupt context to a task.
//!
//! A [`SignalGate`] behaves like a binary semaphore with initial count 0 and
//! limit 1: any number of `signal()` calls before a `wait()` collapse into one
//! wakeup.

use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Saturating wakeup flag.
pub struct SignalGate {
    name: &'static str,
    pending: AtomicBool,
    notify: Notify,
    signals: AtomicU64,
    wakeups: AtomicU64,
}

impl SignalGate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: AtomicBool::new(false),
            notify: Notify::new(),
            signals: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Raise the signal. Never blocks; a signal that is already pending is
    /// absorbed.
    pub fn signal(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Consume a pending signal without waiting.
    pub fn try_take(&self) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Wait until a signal is pending and consume it.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.try_take() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait`](Self::wait), but gives up when `cancel` fires. Returns
    /// `true` if a signal was consumed.
    pub async fn wait_cancellable(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{} gate wait cancelled", self.name);
                false
            }
            _ = self.wait() => true,
        }
    }

    /// Wait at most `timeout`. Returns `true` if a signal was consumed.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Whether a signal is pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Total `signal()` calls.
    pub fn signal_count(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }

    /// Total consumed wakeups.
    pub fn wakeup_count(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}
