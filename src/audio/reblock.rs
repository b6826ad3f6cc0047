//! Reblocking buffer
//!
//! Accepts pushes of any length (the host block size) and hands out pops of
//! one fixed length (the codec block size), or the other way round. Samples
//! are interleaved; sizes and timestamps are counted in frames.
//!
//! Producer and consumer may live on different threads. Every method takes
//! the same reentrant lock, so a push and a pop never overlap.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;

use crate::audio::block::TimeIndex;
use crate::error::BufferError;

struct ReblockState {
    data: Vec<f32>,
    read: usize,
    write: usize,
    len: usize,
    channels: usize,
    output_block_size: usize,
    capacity_frames: usize,
    /// Timestamp of the frame at the read cursor; unset until the first push
    read_timestamp: Option<TimeIndex>,
}

impl ReblockState {
    fn pop_len(&self) -> usize {
        self.output_block_size * self.channels
    }

    fn reset(&mut self, timestamp: TimeIndex) {
        self.read = 0;
        self.write = 0;
        self.len = 0;
        self.read_timestamp = Some(timestamp);
    }

    /// Move the unread region to the start of the backing store.
    ///
    /// The unread region is always `[read, write)`: pushes compact instead of
    /// wrapping, so it never straddles the end of the store.
    fn compact(&mut self) {
        self.data.copy_within(self.read..self.write, 0);
        self.read = 0;
        self.write = self.len;
    }
}

/// Single-producer/single-consumer reblocking ring buffer
pub struct ReblockingBuffer {
    state: ReentrantMutex<RefCell<ReblockState>>,
}

impl ReblockingBuffer {
    /// Create a buffer holding up to `capacity_frames` frames of `channels`
    /// interleaved channels, popping `output_block_size` frames at a time
    pub fn new(
        capacity_frames: usize,
        channels: u16,
        output_block_size: usize,
    ) -> Result<Self, BufferError> {
        if channels == 0 || output_block_size == 0 || capacity_frames < output_block_size {
            return Err(BufferError::InvalidLayout {
                channels,
                block_size: output_block_size,
            });
        }
        let channels = channels as usize;
        Ok(Self {
            state: ReentrantMutex::new(RefCell::new(ReblockState {
                data: vec![0.0; capacity_frames * channels],
                read: 0,
                write: 0,
                len: 0,
                channels,
                output_block_size,
                capacity_frames,
                read_timestamp: None,
            })),
        })
    }

    /// Append interleaved samples stamped with the frame position of their first frame.
    ///
    /// A timestamp at or before the current read timestamp is treated as a
    /// seek: unread data is discarded and `timestamp` becomes the new base.
    pub fn push(&self, samples: &[f32], timestamp: TimeIndex) -> Result<(), BufferError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        match state.read_timestamp {
            Some(read_ts) if timestamp <= read_ts => {
                if state.len > 0 {
                    tracing::debug!(
                        timestamp,
                        read_ts,
                        discarded = state.len,
                        "reblocking buffer reset on seek"
                    );
                }
                state.reset(timestamp);
            }
            None => state.read_timestamp = Some(timestamp),
            Some(_) => {}
        }

        let capacity = state.data.len();
        let free = capacity - state.len;
        if samples.len() > free {
            return Err(BufferError::Overflow {
                requested: samples.len(),
                free,
            });
        }

        if state.write + samples.len() > capacity {
            state.compact();
        }

        let start = state.write;
        state.data[start..start + samples.len()].copy_from_slice(samples);
        state.write += samples.len();
        state.len += samples.len();
        Ok(())
    }

    /// Copy one output block into `out` and return its timestamp.
    ///
    /// Callers check [`data_ready`](Self::data_ready) first; popping without
    /// a full block buffered returns [`BufferError::Underrun`] and leaves the
    /// buffer untouched.
    pub fn pop(&self, out: &mut [f32]) -> Result<TimeIndex, BufferError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        let need = state.pop_len();
        if out.len() < need {
            return Err(BufferError::OutputTooSmall(out.len()));
        }
        if state.len < need {
            return Err(BufferError::Underrun {
                needed: need,
                available: state.len,
            });
        }

        let read = state.read;
        out[..need].copy_from_slice(&state.data[read..read + need]);

        state.len -= need;
        if state.len == 0 {
            state.read = 0;
            state.write = 0;
        } else {
            state.read = read + need;
        }

        let timestamp = state.read_timestamp.unwrap_or(0);
        state.read_timestamp = Some(timestamp + state.output_block_size as TimeIndex);
        Ok(timestamp)
    }

    /// Whether a full output block is buffered
    pub fn data_ready(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.len >= state.pop_len()
    }

    /// Reconfigure the pop granularity.
    ///
    /// Only meaningful between sessions: buffered data is kept when the
    /// channel count is unchanged, so later pops may straddle old block
    /// boundaries. Changing the channel count discards buffered data.
    pub fn set_channels_and_output_block_size(
        &self,
        channels: u16,
        output_block_size: usize,
    ) -> Result<(), BufferError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        if channels == 0 || output_block_size == 0 || output_block_size > state.capacity_frames {
            return Err(BufferError::InvalidLayout {
                channels,
                block_size: output_block_size,
            });
        }

        let channels = channels as usize;
        if channels != state.channels {
            state.data = vec![0.0; state.capacity_frames * channels];
            state.read = 0;
            state.write = 0;
            state.len = 0;
            state.channels = channels;
        }
        state.output_block_size = output_block_size;
        Ok(())
    }

    /// Drop all buffered samples and forget the timestamp base
    pub fn clear(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.read = 0;
        state.write = 0;
        state.len = 0;
        state.read_timestamp = None;
    }

    /// Unread samples (all channels)
    pub fn len(&self) -> usize {
        self.state.lock().borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backing store size in samples
    pub fn capacity(&self) -> usize {
        self.state.lock().borrow().data.len()
    }

    /// Samples per pop (all channels)
    pub fn output_len(&self) -> usize {
        self.state.lock().borrow().pop_len()
    }

    /// Timestamp the next pop will report
    pub fn read_timestamp(&self) -> Option<TimeIndex> {
        self.state.lock().borrow().read_timestamp
    }
}
