//! Fixed-capacity pool of audio blocks.
//!
//! All block memory is reserved in one allocation when the pool is built and
//! never grows. A block is handed out as an owning [`AudioBlock`] handle; the
//! slot returns to the free list when the handle is dropped, so a block can
//! neither leak nor be released twice.

use log::warn;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately.
    NoWait,
    /// Wait at most this long. A zero duration behaves like `NoWait`.
    After(Duration),
    /// Wait until the resource becomes available.
    Forever,
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    /// Owned by a caller, contents not yet valid.
    InFlight,
    /// Owned by a caller, holding valid data.
    Filled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// No free block and the caller would not wait.
    Exhausted,
    /// No block was released within the timeout.
    Timeout,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "block pool exhausted"),
            Self::Timeout => write!(f, "timed out waiting for a free block"),
        }
    }
}

impl std::error::Error for PoolError {}

struct PoolState {
    free: Vec<usize>,
    states: Vec<BlockState>,
}

/// Largest slab a pool will reserve.
pub const MAX_POOL_BYTES: usize = 1 << 20;

/// Slab of `capacity` blocks of `block_size` bytes each.
pub struct BlockPool {
    storage: Box<[UnsafeCell<u8>]>,
    block_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
    freed: Condvar,
}

// SAFETY: slot memory is only reached through an `AudioBlock`, and the free
// list (behind the mutex) guarantees at most one handle per slot.
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Reserve the slab. Capacity is clamped so the slab stays within
    /// [`MAX_POOL_BYTES`].
    pub fn new(block_size: usize, capacity: usize) -> Arc<Self> {
        let fits = MAX_POOL_BYTES / block_size.max(1);
        if capacity > fits {
            warn!(
                "Block pool of {} x {} bytes exceeds {} bytes, clamping to {} blocks",
                capacity, block_size, MAX_POOL_BYTES, fits
            );
        }
        let capacity = capacity.min(fits);
        let storage = (0..block_size * capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Pop order hands out slot 0 first.
        let free = (0..capacity).rev().collect();
        Arc::new(Self {
            storage,
            block_size,
            capacity,
            state: Mutex::new(PoolState {
                free,
                states: vec![BlockState::Free; capacity],
            }),
            freed: Condvar::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Block pool mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Take exclusive ownership of a free block.
    pub fn acquire(self: &Arc<Self>, timeout: Timeout) -> Result<AudioBlock, PoolError> {
        let deadline = match timeout {
            Timeout::After(d) if !d.is_zero() => Some(Instant::now() + d),
            _ => None,
        };

        let mut state = self.lock_state();
        loop {
            if let Some(slot) = state.free.pop() {
                state.states[slot] = BlockState::InFlight;
                return Ok(AudioBlock {
                    pool: self.clone(),
                    slot,
                    filled: 0,
                });
            }

            state = match (timeout, deadline) {
                (Timeout::Forever, _) => match self.freed.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
                (Timeout::After(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout);
                    }
                    match self.freed.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                _ => return Err(PoolError::Exhausted),
            };
        }
    }

    /// Return a block to the pool. Equivalent to dropping it.
    pub fn release(&self, block: AudioBlock) {
        drop(block);
    }

    fn put_back(&self, slot: usize) {
        {
            let mut state = self.lock_state();
            state.states[slot] = BlockState::Free;
            state.free.push(slot);
        }
        self.freed.notify_one();
    }

    fn set_state(&self, slot: usize, block_state: BlockState) {
        self.lock_state().states[slot] = block_state;
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        // SAFETY: slot < capacity, so the offset stays inside `storage`.
        unsafe { UnsafeCell::raw_get(self.storage.as_ptr().add(slot * self.block_size)) }
    }

    pub fn free_count(&self) -> usize {
        self.lock_state().free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// State of `slot`, or `None` if it is out of range.
    pub fn state(&self, slot: usize) -> Option<BlockState> {
        self.lock_state().states.get(slot).copied()
    }
}

/// Exclusive handle to one pool block.
pub struct AudioBlock {
    pool: Arc<BlockPool>,
    slot: usize,
    filled: usize,
}

impl AudioBlock {
    /// Slot index; the block's identity.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Block capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.pool.block_size
    }

    /// Valid bytes.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// The valid portion of the block.
    pub fn data(&self) -> &[u8] {
        &self.buffer()[..self.filled]
    }

    /// The whole block.
    pub fn buffer(&self) -> &[u8] {
        // SAFETY: this handle is the only one for `slot`.
        unsafe { std::slice::from_raw_parts(self.pool.slot_ptr(self.slot), self.pool.block_size) }
    }

    /// The whole block, for a producer to write into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: this handle is the only one for `slot`, and `&mut self`
        // rules out other borrows through it.
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.slot), self.pool.block_size)
        }
    }

    /// Mark the first `len` bytes as valid data.
    pub fn set_filled(&mut self, len: usize) {
        self.filled = len.min(self.pool.block_size);
        self.pool.set_state(self.slot, BlockState::Filled);
    }
}

impl Drop for AudioBlock {
    fn drop(&mut self) {
        self.pool.put_back(self.slot);
    }
}

impl fmt::Debug for AudioBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBlock")
            .field("slot", &self.slot)
            .field("filled", &self.filled)
            .finish()
    }
}
