//! Push-to-record worker.
//!
//! Waits on the record button's gate, captures blocks while the button is
//! held and hands them downstream (or echoes them to playback), then stops
//! capture until the next press.

use super::pool::{AudioBlock, Timeout};
use super::stream::{AudioStream, Lane, StreamDevice, StreamDirection, StreamError};
use crate::signal::RecordButton;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Where captured blocks go.
#[derive(Clone)]
pub enum RecordTarget {
    /// Forward over a bounded channel. The receiver owns each block until it
    /// drops it.
    Downstream(mpsc::Sender<AudioBlock>),
    /// Play each block straight back out.
    Echo,
}

impl RecordTarget {
    fn direction(&self) -> StreamDirection {
        match self {
            Self::Downstream(_) => StreamDirection::Capture,
            Self::Echo => StreamDirection::Both,
        }
    }
}

/// Totals across a recorder's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordSummary {
    pub sessions: u64,
    pub blocks: u64,
    pub timeouts: u64,
}

impl RecordSummary {
    fn add(&mut self, other: RecordSummary) {
        self.sessions += other.sessions;
        self.blocks += other.blocks;
        self.timeouts += other.timeouts;
    }
}

/// Capture one press worth of audio.
///
/// At least one block is captured per press so a press released before the
/// worker woke still records something. Capture ends on release, after
/// `max_blocks`, on cancellation, or when the downstream receiver is gone.
pub fn record_session<S: StreamDevice>(
    stream: &mut AudioStream<S>,
    button: &RecordButton,
    target: &RecordTarget,
    max_blocks: usize,
    cancel: &CancellationToken,
) -> RecordSummary {
    let mut summary = RecordSummary {
        sessions: 1,
        ..Default::default()
    };

    if let Err(e) = stream.start() {
        error!("Failed to start capture: {}", e);
        return summary;
    }
    info!("Recording started");

    let wait = Timeout::After(stream.block_timeout());
    loop {
        match stream.next_block(wait) {
            Ok(block) => {
                summary.blocks += 1;
                debug!("Captured block {} ({} bytes)", block.slot(), block.filled());
                match target {
                    RecordTarget::Downstream(tx) => {
                        if tx.blocking_send(block).is_err() {
                            warn!("Audio consumer gone, stopping capture");
                            break;
                        }
                    }
                    RecordTarget::Echo => {
                        if let Err(e) = stream.submit_block(block) {
                            warn!("Echo playback failed: {}", e);
                        }
                    }
                }
            }
            Err(StreamError::Timeout) => summary.timeouts += 1,
            Err(e) if e.is_recoverable() => warn!("Capture stalled: {}", e),
            Err(e) => {
                error!("Capture failed: {}", e);
                break;
            }
        }

        // A release inside the debounce window gets no further edge.
        button.settle();
        if !button.is_held() || cancel.is_cancelled() {
            break;
        }
        if summary.blocks >= max_blocks as u64 {
            warn!("Record limit of {} blocks reached", max_blocks);
            break;
        }
    }

    if let Err(e) = stream.stop() {
        error!("Failed to stop capture: {}", e);
    }
    info!(
        "Recording stopped: {} blocks, {} timeouts",
        summary.blocks, summary.timeouts
    );
    summary
}

/// Run the record worker until `cancel` fires.
///
/// The stream is configured once for `target`. If the capture hardware is
/// missing the worker logs it and returns straight away; the rest of the node
/// keeps running. Blocking stream calls run on the blocking pool.
pub async fn run_record_loop<S: StreamDevice + 'static>(
    mut stream: AudioStream<S>,
    button: Arc<RecordButton>,
    target: RecordTarget,
    max_blocks: usize,
    cancel: CancellationToken,
) -> Result<(AudioStream<S>, RecordSummary), JoinError> {
    let mut total = RecordSummary::default();
    let direction = target.direction();

    let (returned, configured) = tokio::task::spawn_blocking(move || {
        let block_size = stream.pool().block_size();
        let timeout = stream.block_timeout();
        let result = stream.configure(direction, block_size, timeout);
        (stream, result)
    })
    .await?;
    stream = returned;
    if let Err(e) = configured {
        match e {
            StreamError::DeviceNotReady(Lane::Capture) => {
                error!("Audio capture unavailable, recording disabled: {}", e);
                return Ok((stream, total));
            }
            _ => warn!("Audio stream partially configured: {}", e),
        }
    }
    info!("Record worker ready");

    while button.gate().wait_cancellable(&cancel).await {
        let session_button = button.clone();
        let session_target = target.clone();
        let session_cancel = cancel.clone();
        let (returned, summary) = tokio::task::spawn_blocking(move || {
            let summary = record_session(
                &mut stream,
                &session_button,
                &session_target,
                max_blocks,
                &session_cancel,
            );
            (stream, summary)
        })
        .await?;
        stream = returned;
        total.add(summary);
    }

    debug!("Record worker exiting");
    Ok((stream, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::config::AudioConfig;
    use crate::audio::loopback::{LoopbackStream, LoopbackStreamHandle};
    use crate::audio::pool::BlockPool;
    use crate::signal::{Edge, EdgeDebouncer, SignalGate};
    use std::time::Duration;

    fn setup(synthetic: bool) -> (AudioStream<LoopbackStream>, LoopbackStreamHandle, Arc<RecordButton>) {
        let audio = AudioConfig {
            block_duration_ms: 1,
            block_timeout_ms: 20,
            ..Default::default()
        };
        let pool = BlockPool::new(audio.block_size(), audio.block_count());
        let (device, handle) = if synthetic {
            LoopbackStream::synthetic()
        } else {
            LoopbackStream::new()
        };
        let button = Arc::new(RecordButton::new(
            Arc::new(SignalGate::new("record")),
            EdgeDebouncer::new(Duration::ZERO),
        ));
        (AudioStream::new(device, pool, audio), handle, button)
    }

    fn configured(
        target: &RecordTarget,
    ) -> (AudioStream<LoopbackStream>, LoopbackStreamHandle, Arc<RecordButton>) {
        let (mut stream, handle, button) = setup(true);
        let size = stream.pool().block_size();
        stream
            .configure(target.direction(), size, Duration::from_millis(20))
            .unwrap();
        (stream, handle, button)
    }

    #[test]
    fn test_echo_session_respects_block_limit() {
        let target = RecordTarget::Echo;
        let (mut stream, handle, button) = configured(&target);
        button.on_edge_at(Edge::Rising, 0);

        let summary = record_session(&mut stream, &button, &target, 4, &CancellationToken::new());
        assert_eq!(summary.blocks, 4);
        assert_eq!(handle.played().len(), 4);
        assert!(!handle.is_running(Lane::Capture));
        assert_eq!(stream.pool().free_count(), stream.pool().capacity());
    }

    #[test]
    fn test_released_press_still_records_one_block() {
        let target = RecordTarget::Echo;
        let (mut stream, handle, button) = configured(&target);
        button.on_edge_at(Edge::Rising, 0);
        button.on_edge_at(Edge::Falling, 10);
        assert!(!button.is_held());

        let summary = record_session(&mut stream, &button, &target, 100, &CancellationToken::new());
        assert_eq!(summary.blocks, 1);
        assert_eq!(handle.played().len(), 1);
    }

    #[test]
    fn test_tap_inside_debounce_window_ends_session() {
        let target = RecordTarget::Echo;
        let (mut stream, handle, _) = configured(&target);
        let button = RecordButton::new(
            Arc::new(SignalGate::new("record")),
            EdgeDebouncer::new(Duration::from_millis(20)),
        );
        button.on_edge(Edge::Rising);
        button.on_edge(Edge::Falling);

        let summary = record_session(
            &mut stream,
            &button,
            &target,
            usize::MAX,
            &CancellationToken::new(),
        );
        assert!(summary.blocks >= 1);
        assert!(!button.is_held());
        assert!(!handle.is_running(Lane::Capture));
    }

    #[test]
    fn test_session_counts_timeouts_until_release() {
        let target = RecordTarget::Echo;
        let (mut stream, handle, button) = setup(false);
        let size = stream.pool().block_size();
        stream
            .configure(StreamDirection::Both, size, Duration::from_millis(5))
            .unwrap();
        button.on_edge_at(Edge::Rising, 0);
        handle.push_capture(vec![1; size]);

        let releaser = {
            let button = button.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(40));
                button.on_edge_at(Edge::Falling, 1_000_000);
            })
        };
        let summary = record_session(&mut stream, &button, &target, 100, &CancellationToken::new());
        releaser.join().unwrap();

        assert_eq!(summary.blocks, 1);
        assert!(summary.timeouts >= 1);
        assert_eq!(stream.stats().timeouts, summary.timeouts);
    }

    #[tokio::test]
    async fn test_record_loop_forwards_downstream_until_release() {
        let (stream, handle, button) = setup(true);
        let (tx, mut rx) = mpsc::channel(2);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_record_loop(
            stream,
            button.clone(),
            RecordTarget::Downstream(tx),
            1000,
            cancel.clone(),
        ));

        button.on_edge_at(Edge::Rising, 0);
        for _ in 0..3 {
            let block = rx.recv().await.unwrap();
            assert!(block.filled() > 0);
        }
        button.on_edge_at(Edge::Falling, 1_000_000);
        drop(rx);
        cancel.cancel();

        let (stream, summary) = worker.await.unwrap().unwrap();
        assert_eq!(summary.sessions, 1);
        assert!(summary.blocks >= 3);
        assert!(!handle.is_running(Lane::Capture));
        assert_eq!(stream.pool().free_count(), stream.pool().capacity());
    }

    #[tokio::test]
    async fn test_missing_capture_disables_recording() {
        let (stream, handle, button) = setup(true);
        handle.set_ready(Lane::Capture, false);

        let (tx, _rx) = mpsc::channel(1);
        let (_, summary) = run_record_loop(
            stream,
            button,
            RecordTarget::Downstream(tx),
            10,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary, RecordSummary::default());
    }
}
