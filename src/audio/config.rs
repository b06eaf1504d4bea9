//! Audio stream parameters.

use super::pool::MAX_POOL_BYTES;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_CHANNELS: u8 = 2;
pub const DEFAULT_WORD_SIZE_BITS: u8 = 16;
/// Each block holds this much audio.
pub const DEFAULT_BLOCK_DURATION_MS: u32 = 100;
pub const DEFAULT_INITIAL_BLOCKS: usize = 2;
pub const DEFAULT_SPARE_BLOCKS: usize = 4;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 1000;
/// Upper bound on blocks captured per record press.
pub const DEFAULT_MAX_RECORD_BLOCKS: usize = 600;

/// Capture/playback parameters and pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub word_size_bits: u8,
    pub block_duration_ms: u32,
    /// Base pool capacity; also the depth of the downstream block channel.
    pub initial_blocks: usize,
    /// Blocks added to the pool on top of `initial_blocks`.
    pub spare_blocks: usize,
    pub block_timeout_ms: u64,
    pub max_record_blocks: usize,
    /// Play captured blocks straight back out instead of forwarding them.
    pub echo: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            word_size_bits: DEFAULT_WORD_SIZE_BITS,
            block_duration_ms: DEFAULT_BLOCK_DURATION_MS,
            initial_blocks: DEFAULT_INITIAL_BLOCKS,
            spare_blocks: DEFAULT_SPARE_BLOCKS,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
            max_record_blocks: DEFAULT_MAX_RECORD_BLOCKS,
            echo: false,
        }
    }
}

impl AudioConfig {
    pub fn bytes_per_sample(&self) -> usize {
        self.word_size_bits as usize / 8
    }

    /// Frames in one block.
    pub fn samples_per_block(&self) -> usize {
        let frames = self.sample_rate as u64 * self.block_duration_ms as u64 / 1000;
        usize::try_from(frames).unwrap_or(usize::MAX)
    }

    fn checked_block_size(&self) -> Option<usize> {
        (self.bytes_per_sample() * self.channels as usize).checked_mul(self.samples_per_block())
    }

    /// Size of one block in bytes. Saturates; [`validate`](Self::validate)
    /// rejects sizes that do not fit.
    pub fn block_size(&self) -> usize {
        self.checked_block_size().unwrap_or(usize::MAX)
    }

    /// Pool capacity. Saturates like [`block_size`](Self::block_size).
    pub fn block_count(&self) -> usize {
        self.initial_blocks.saturating_add(self.spare_blocks)
    }

    /// Bytes the pool reserves, or `None` on overflow.
    pub fn pool_bytes(&self) -> Option<usize> {
        self.checked_block_size()?
            .checked_mul(self.initial_blocks.checked_add(self.spare_blocks)?)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), AudioConfigError> {
        if self.sample_rate == 0 {
            return Err(AudioConfigError::ZeroSampleRate);
        }
        if !matches!(self.word_size_bits, 8 | 16 | 24 | 32) {
            return Err(AudioConfigError::UnsupportedWordSize(self.word_size_bits));
        }
        if self.channels == 0 {
            return Err(AudioConfigError::ZeroChannels);
        }
        if self.block_size() == 0 {
            return Err(AudioConfigError::EmptyBlock);
        }
        if self.block_count() == 0 {
            return Err(AudioConfigError::NoBlocks);
        }
        match self.pool_bytes() {
            Some(bytes) if bytes <= MAX_POOL_BYTES => Ok(()),
            bytes => Err(AudioConfigError::PoolTooLarge { bytes }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioConfigError {
    ZeroSampleRate,
    UnsupportedWordSize(u8),
    ZeroChannels,
    EmptyBlock,
    NoBlocks,
    /// Block size times block count exceeds [`MAX_POOL_BYTES`]. `None` when
    /// the product overflows.
    PoolTooLarge { bytes: Option<usize> },
}

impl fmt::Display for AudioConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSampleRate => write!(f, "sample rate must be non-zero"),
            Self::UnsupportedWordSize(bits) => write!(f, "unsupported word size: {} bits", bits),
            Self::ZeroChannels => write!(f, "at least one channel required"),
            Self::EmptyBlock => write!(f, "block duration too short for one frame"),
            Self::NoBlocks => write!(f, "pool needs at least one block"),
            Self::PoolTooLarge { bytes: Some(bytes) } => write!(
                f,
                "block pool of {} bytes exceeds {} bytes",
                bytes, MAX_POOL_BYTES
            ),
            Self::PoolTooLarge { bytes: None } => {
                write!(f, "block pool size overflows (max {} bytes)", MAX_POOL_BYTES)
            }
        }
    }
}

impl std::error::Error for AudioConfigError {}
