//! Audio capture and playback over a fixed block pool.

pub mod config;
#[cfg(feature = "esp32")]
pub mod i2s;
pub mod loopback;
pub mod pool;
pub mod recorder;
pub mod stream;

pub use config::{AudioConfig, AudioConfigError};
pub use loopback::{LoopbackStream, LoopbackStreamHandle};
pub use pool::{AudioBlock, BlockPool, BlockState, PoolError, Timeout, MAX_POOL_BYTES};
pub use recorder::{record_session, run_record_loop, RecordSummary, RecordTarget};
pub use stream::{
    AudioStream, Lane, LaneStatus, StreamConfig, StreamDevice, StreamDirection, StreamError,
    StreamStats, Trigger,
};

#[cfg(feature = "esp32")]
pub use i2s::I2sStream;
