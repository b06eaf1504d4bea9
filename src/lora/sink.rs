//! Bounded hand-off of received frames out of the receive callback.
//!
//! The receive callback runs on a driver context that must not block, so it
//! gets a [`FrameSink`]: a capability that can only attempt a non-blocking
//! push. Frames that do not fit are dropped and counted.

use super::device::{hex_bytes, RxEvent, RxFrame};
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default depth of the received-frame queue.
pub const DEFAULT_FRAME_QUEUE_DEPTH: usize = 8;

/// A received LoRa frame, copied out of the driver buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Frame payload.
    pub data: Vec<u8>,
    /// RSSI in dBm.
    pub rssi: i16,
    /// SNR in dB.
    pub snr: i8,
}

impl From<RxFrame<'_>> for ReceivedFrame {
    fn from(frame: RxFrame<'_>) -> Self {
        Self {
            data: frame.data.to_vec(),
            rssi: frame.rssi,
            snr: frame.snr,
        }
    }
}

/// Producer half of the frame queue, handed to receive callbacks.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<ReceivedFrame>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half of the frame queue.
pub struct FrameQueue {
    rx: mpsc::Receiver<ReceivedFrame>,
    dropped: Arc<AtomicU64>,
}

/// Create a frame queue holding at most `depth` frames.
pub fn frame_queue(depth: usize) -> (FrameSink, FrameQueue) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FrameSink {
            tx,
            dropped: dropped.clone(),
        },
        FrameQueue { rx, dropped },
    )
}

impl FrameSink {
    /// Try to enqueue a frame without blocking. Returns `false` if it was
    /// dropped because the queue is full or closed.
    pub fn try_push(&self, frame: RxFrame<'_>) -> bool {
        match self.tx.try_send(frame.into()) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Build a receive callback that logs each frame and pushes it here.
    pub fn into_callback(self) -> super::RxCallback {
        Box::new(move |event: RxEvent<'_>| match event {
            RxEvent::Frame(frame) => {
                info!(
                    "RECV {} bytes: {} RSSI = {}dBm, SNR = {}dB",
                    frame.data.len(),
                    hex_bytes(frame.data),
                    frame.rssi,
                    frame.snr
                );
                self.try_push(frame);
            }
            RxEvent::Cancelled => debug!("Reception cancelled"),
        })
    }
}

impl FrameQueue {
    /// Wait for the next frame. Returns `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<ReceivedFrame> {
        self.rx.recv().await
    }

    /// Take a frame if one is queued.
    pub fn try_recv(&mut self) -> Option<ReceivedFrame> {
        self.rx.try_recv().ok()
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
