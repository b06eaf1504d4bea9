//! Block-oriented audio streaming over a [`StreamDevice`].
//!
//! [`AudioStream`] pairs a capture and a playback lane with a [`BlockPool`].
//! Captured data lands in pool blocks handed to the caller; played blocks go
//! back to the pool once the device has taken them.

use super::config::AudioConfig;
use super::pool::{AudioBlock, BlockPool, PoolError, Timeout};
use crate::errno::{self, DeviceResult};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One half of a bidirectional audio interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Capture,
    Playback,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => write!(f, "capture"),
            Self::Playback => write!(f, "playback"),
        }
    }
}

/// Lanes a call applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Capture,
    Playback,
    Both,
}

impl StreamDirection {
    fn lanes(self) -> &'static [Lane] {
        match self {
            Self::Capture => &[Lane::Capture],
            Self::Playback => &[Lane::Playback],
            Self::Both => &[Lane::Capture, Lane::Playback],
        }
    }
}

/// Stream control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    /// Stop once queued data has been played.
    Drain,
    /// Stop now, discarding queued data.
    Drop,
}

/// Per-lane parameters handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub word_size_bits: u8,
    pub channels: u8,
    pub frame_rate: u32,
    pub block_size: usize,
    pub timeout: Duration,
}

/// A block-oriented audio interface (I2S or similar).
pub trait StreamDevice: Send {
    fn is_ready(&self, lane: Lane) -> bool;

    fn configure(&mut self, lane: Lane, config: &StreamConfig) -> DeviceResult<()>;

    fn trigger(&mut self, lane: Lane, cmd: Trigger) -> DeviceResult<()>;

    /// Read one block of captured data into `buf`. Returns bytes read.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> DeviceResult<usize>;

    /// Queue one block for playback. Returns bytes accepted.
    fn write(&mut self, data: &[u8], timeout: Duration) -> DeviceResult<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The lane's hardware is absent. Fatal for that lane only.
    DeviceNotReady(Lane),
    NotConfigured(Lane),
    NotRunning(Lane),
    BlockTooLarge { size: usize, max: usize },
    /// The device produced or accepted nothing in time. Recoverable.
    Timeout,
    Pool(PoolError),
    Io(i32),
}

impl StreamError {
    /// Map a negative errno from the device boundary.
    pub(crate) fn from_code(lane: Lane, code: i32) -> Self {
        match -code {
            errno::ENODEV => Self::DeviceNotReady(lane),
            errno::ETIMEDOUT | errno::EAGAIN => Self::Timeout,
            _ => Self::Io(code),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Pool(_))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotReady(lane) => write!(f, "{} device not ready", lane),
            Self::NotConfigured(lane) => write!(f, "{} lane not configured", lane),
            Self::NotRunning(lane) => write!(f, "{} lane not running", lane),
            Self::BlockTooLarge { size, max } => {
                write!(f, "block size {} exceeds pool block size {}", size, max)
            }
            Self::Timeout => write!(f, "stream timed out"),
            Self::Pool(e) => write!(f, "pool: {}", e),
            Self::Io(code) => write!(f, "stream I/O error: {}", code),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PoolError> for StreamError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

/// Lifecycle of one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneStatus {
    Unconfigured,
    /// Hardware missing; the lane stays unusable.
    Unavailable,
    Ready,
    Running,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub captured: u64,
    pub played: u64,
    pub timeouts: u64,
}

/// Audio stream bound to a block pool.
pub struct AudioStream<S: StreamDevice> {
    device: S,
    pool: Arc<BlockPool>,
    audio: AudioConfig,
    block_size: usize,
    timeout: Duration,
    capture: LaneStatus,
    playback: LaneStatus,
    stats: StreamStats,
}

impl<S: StreamDevice> AudioStream<S> {
    pub fn new(device: S, pool: Arc<BlockPool>, audio: AudioConfig) -> Self {
        Self {
            device,
            block_size: pool.block_size(),
            pool,
            timeout: audio.block_timeout(),
            audio,
            capture: LaneStatus::Unconfigured,
            playback: LaneStatus::Unconfigured,
            stats: StreamStats::default(),
        }
    }

    fn status_mut(&mut self, lane: Lane) -> &mut LaneStatus {
        match lane {
            Lane::Capture => &mut self.capture,
            Lane::Playback => &mut self.playback,
        }
    }

    pub fn status(&self, lane: Lane) -> LaneStatus {
        match lane {
            Lane::Capture => self.capture,
            Lane::Playback => self.playback,
        }
    }

    /// Configure the lanes in `direction`.
    ///
    /// Each lane is configured independently: a lane whose hardware is
    /// missing is marked unavailable and the first such failure is returned,
    /// but the other lane is still configured.
    pub fn configure(
        &mut self,
        direction: StreamDirection,
        block_size: usize,
        timeout: Duration,
    ) -> Result<(), StreamError> {
        if block_size > self.pool.block_size() {
            return Err(StreamError::BlockTooLarge {
                size: block_size,
                max: self.pool.block_size(),
            });
        }
        let config = StreamConfig {
            word_size_bits: self.audio.word_size_bits,
            channels: self.audio.channels,
            frame_rate: self.audio.sample_rate,
            block_size,
            timeout,
        };

        let mut first_err = None;
        for &lane in direction.lanes() {
            if self.status(lane) == LaneStatus::Running {
                warn!("Reconfiguring running {} lane, stopping it first", lane);
                self.stop_lane(lane)?;
            }
            if !self.device.is_ready(lane) {
                error!("{} device is not ready", lane);
                *self.status_mut(lane) = LaneStatus::Unavailable;
                first_err.get_or_insert(StreamError::DeviceNotReady(lane));
                continue;
            }
            match self.device.configure(lane, &config) {
                Ok(()) => {
                    debug!(
                        "Configured {} stream: {} Hz, {} ch, {}-bit, {} byte blocks",
                        lane, config.frame_rate, config.channels, config.word_size_bits, block_size
                    );
                    *self.status_mut(lane) = LaneStatus::Ready;
                }
                Err(code) => {
                    let err = StreamError::from_code(lane, code);
                    error!("Failed to configure {} stream: {}", lane, err);
                    *self.status_mut(lane) = match err {
                        StreamError::DeviceNotReady(_) => LaneStatus::Unavailable,
                        _ => LaneStatus::Unconfigured,
                    };
                    first_err.get_or_insert(err);
                }
            }
        }

        self.block_size = block_size;
        self.timeout = timeout;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Start every configured lane.
    pub fn start(&mut self) -> Result<(), StreamError> {
        let mut started = false;
        for lane in [Lane::Capture, Lane::Playback] {
            match self.status(lane) {
                LaneStatus::Ready => {
                    self.device
                        .trigger(lane, Trigger::Start)
                        .map_err(|code| StreamError::from_code(lane, code))?;
                    *self.status_mut(lane) = LaneStatus::Running;
                    started = true;
                }
                LaneStatus::Running => started = true,
                _ => {}
            }
        }
        if !started {
            return Err(StreamError::NotConfigured(Lane::Capture));
        }
        info!("Streams started");
        Ok(())
    }

    /// Capture the next block.
    ///
    /// `timeout` bounds the wait for a free pool block; the device read is
    /// bounded by the configured stream timeout. A device timeout is counted
    /// and reported as [`StreamError::Timeout`].
    pub fn next_block(&mut self, timeout: Timeout) -> Result<AudioBlock, StreamError> {
        if self.capture != LaneStatus::Running {
            return Err(StreamError::NotRunning(Lane::Capture));
        }
        let mut block = self.pool.acquire(timeout)?;
        let len = self.block_size;
        match self.device.read(&mut block.buffer_mut()[..len], self.timeout) {
            Ok(read) => {
                block.set_filled(read);
                self.stats.captured += 1;
                Ok(block)
            }
            Err(code) => {
                let err = StreamError::from_code(Lane::Capture, code);
                if err == StreamError::Timeout {
                    self.stats.timeouts += 1;
                    warn!("Capture read timed out ({} so far)", self.stats.timeouts);
                } else {
                    error!("Capture read failed: {}", err);
                }
                Err(err)
            }
        }
    }

    /// Queue a filled block for playback. The block returns to the pool
    /// whether or not the write succeeds.
    pub fn submit_block(&mut self, block: AudioBlock) -> Result<(), StreamError> {
        if !matches!(self.playback, LaneStatus::Ready | LaneStatus::Running) {
            return Err(StreamError::NotConfigured(Lane::Playback));
        }
        let result = match self.device.write(block.data(), self.timeout) {
            Ok(_) => {
                self.stats.played += 1;
                Ok(())
            }
            Err(code) => {
                let err = StreamError::from_code(Lane::Playback, code);
                if err == StreamError::Timeout {
                    self.stats.timeouts += 1;
                }
                error!("Playback write failed: {}", err);
                Err(err)
            }
        };
        self.pool.release(block);
        result
    }

    /// Stop running lanes: capture drops pending data, playback drains.
    pub fn stop(&mut self) -> Result<(), StreamError> {
        let mut first_err = None;
        for lane in [Lane::Capture, Lane::Playback] {
            if self.status(lane) == LaneStatus::Running {
                if let Err(e) = self.stop_lane(lane) {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => {
                info!("Streams stopped");
                Ok(())
            }
        }
    }

    fn stop_lane(&mut self, lane: Lane) -> Result<(), StreamError> {
        let cmd = match lane {
            Lane::Capture => Trigger::Drop,
            Lane::Playback => Trigger::Drain,
        };
        // The lane is treated as stopped either way; the hardware is reset on
        // the next configure.
        *self.status_mut(lane) = LaneStatus::Ready;
        self.device.trigger(lane, cmd).map_err(|code| {
            let err = StreamError::from_code(lane, code);
            error!("Failed to stop {} stream: {}", lane, err);
            err
        })
    }

    /// Per-block device timeout.
    pub fn block_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }
}
