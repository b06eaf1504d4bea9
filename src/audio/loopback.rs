//! In-memory audio interface for host runs and tests.

use super::stream::{Lane, StreamConfig, StreamDevice, Trigger};
use crate::errno::{self, DeviceResult};
use log::warn;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCall {
    Configure(Lane),
    Trigger(Lane, Trigger),
    Read,
    Write(usize),
}

struct Shared {
    ready: [bool; 2],
    configs: [Option<StreamConfig>; 2],
    running: [bool; 2],
    capture: VecDeque<Vec<u8>>,
    /// Generate a ramp when no capture data is queued.
    synthetic: bool,
    ramp: u8,
    played: Vec<Vec<u8>>,
    calls: Vec<StreamCall>,
    read_failures: VecDeque<i32>,
    write_failures: VecDeque<i32>,
}

fn index(lane: Lane) -> usize {
    match lane {
        Lane::Capture => 0,
        Lane::Playback => 1,
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Loopback stream mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Simulated I2S-style interface.
///
/// Capture returns queued buffers (or a ramp in synthetic mode); when nothing
/// is available a read waits out its timeout and fails with `-EAGAIN`, as the
/// hardware does when no block completes in time.
pub struct LoopbackStream {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Clone)]
pub struct LoopbackStreamHandle {
    shared: Arc<Mutex<Shared>>,
}

impl LoopbackStream {
    pub fn new() -> (Self, LoopbackStreamHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            ready: [true; 2],
            configs: [None; 2],
            running: [false; 2],
            capture: VecDeque::new(),
            synthetic: false,
            ramp: 0,
            played: Vec::new(),
            calls: Vec::new(),
            read_failures: VecDeque::new(),
            write_failures: VecDeque::new(),
        }));
        (
            Self {
                shared: shared.clone(),
            },
            LoopbackStreamHandle { shared },
        )
    }

    /// A device whose capture lane always produces data.
    pub fn synthetic() -> (Self, LoopbackStreamHandle) {
        let (device, handle) = Self::new();
        lock(&handle.shared).synthetic = true;
        (device, handle)
    }
}

impl StreamDevice for LoopbackStream {
    fn is_ready(&self, lane: Lane) -> bool {
        lock(&self.shared).ready[index(lane)]
    }

    fn configure(&mut self, lane: Lane, config: &StreamConfig) -> DeviceResult<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(StreamCall::Configure(lane));
        if !shared.ready[index(lane)] {
            return Err(-errno::ENODEV);
        }
        if shared.running[index(lane)] {
            return Err(-errno::EBUSY);
        }
        shared.configs[index(lane)] = Some(*config);
        Ok(())
    }

    fn trigger(&mut self, lane: Lane, cmd: Trigger) -> DeviceResult<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(StreamCall::Trigger(lane, cmd));
        let i = index(lane);
        if shared.configs[i].is_none() {
            return Err(-errno::EIO);
        }
        match cmd {
            Trigger::Start => shared.running[i] = true,
            Trigger::Drain | Trigger::Drop => {
                shared.running[i] = false;
                if lane == Lane::Capture && cmd == Trigger::Drop {
                    shared.capture.clear();
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> DeviceResult<usize> {
        let mut shared = lock(&self.shared);
        shared.calls.push(StreamCall::Read);
        if !shared.running[index(Lane::Capture)] {
            return Err(-errno::EIO);
        }
        if let Some(code) = shared.read_failures.pop_front() {
            return Err(code);
        }
        if let Some(data) = shared.capture.pop_front() {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            return Ok(len);
        }
        if shared.synthetic {
            for byte in buf.iter_mut() {
                *byte = shared.ramp;
                shared.ramp = shared.ramp.wrapping_add(1);
            }
            return Ok(buf.len());
        }
        drop(shared);
        std::thread::sleep(timeout);
        Err(-errno::EAGAIN)
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> DeviceResult<usize> {
        let mut shared = lock(&self.shared);
        shared.calls.push(StreamCall::Write(data.len()));
        if shared.configs[index(Lane::Playback)].is_none() {
            return Err(-errno::EIO);
        }
        if let Some(code) = shared.write_failures.pop_front() {
            return Err(code);
        }
        shared.played.push(data.to_vec());
        Ok(data.len())
    }
}

impl LoopbackStreamHandle {
    /// Queue one buffer for the next capture read.
    pub fn push_capture(&self, data: Vec<u8>) {
        lock(&self.shared).capture.push_back(data);
    }

    pub fn set_ready(&self, lane: Lane, ready: bool) {
        lock(&self.shared).ready[index(lane)] = ready;
    }

    pub fn is_running(&self, lane: Lane) -> bool {
        lock(&self.shared).running[index(lane)]
    }

    /// Buffers written to the playback lane.
    pub fn played(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).played.clone()
    }

    pub fn calls(&self) -> Vec<StreamCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn fail_next_read(&self, code: i32) {
        lock(&self.shared).read_failures.push_back(code);
    }

    pub fn fail_next_write(&self, code: i32) {
        lock(&self.shared).write_failures.push_back(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        StreamConfig {
            word_size_bits: 16,
            channels: 2,
            frame_rate: 44_100,
            block_size: 8,
            timeout: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_read_requires_running_capture() {
        let (mut device, _handle) = LoopbackStream::new();
        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf, Duration::ZERO), Err(-errno::EIO));

        device.configure(Lane::Capture, &config()).unwrap();
        device.trigger(Lane::Capture, Trigger::Start).unwrap();
        assert_eq!(
            device.read(&mut buf, Duration::from_millis(1)),
            Err(-errno::EAGAIN)
        );
    }

    #[test]
    fn test_synthetic_capture_ramps() {
        let (mut device, _handle) = LoopbackStream::synthetic();
        device.configure(Lane::Capture, &config()).unwrap();
        device.trigger(Lane::Capture, Trigger::Start).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(device.read(&mut buf, Duration::ZERO), Ok(4));
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(device.read(&mut buf, Duration::ZERO), Ok(4));
        assert_eq!(buf, [4, 5, 6, 7]);
    }

    #[test]
    fn test_drop_discards_queued_capture() {
        let (mut device, handle) = LoopbackStream::new();
        device.configure(Lane::Capture, &config()).unwrap();
        device.trigger(Lane::Capture, Trigger::Start).unwrap();
        handle.push_capture(vec![1, 2]);
        device.trigger(Lane::Capture, Trigger::Drop).unwrap();
        assert!(!handle.is_running(Lane::Capture));

        device.trigger(Lane::Capture, Trigger::Start).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(
            device.read(&mut buf, Duration::from_millis(1)),
            Err(-errno::EAGAIN)
        );
    }

    #[test]
    fn test_not_ready_lane() {
        let (mut device, handle) = LoopbackStream::new();
        handle.set_ready(Lane::Playback, false);
        assert!(!device.is_ready(Lane::Playback));
        assert_eq!(
            device.configure(Lane::Playback, &config()),
            Err(-errno::ENODEV)
        );
    }
}
