//! Bounded, latest-wins frame buffer shared with HTTP consumers

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::error::FrameError;
use crate::stats::Statistics;

/// An encoded frame ready to serve
#[derive(Debug, Clone)]
pub struct Frame {
    /// JPEG bytes; cloning shares the allocation
    pub data: Bytes,
    /// Strictly increasing within one generation
    pub sequence: u64,
    /// Restart epoch the frame belongs to
    pub generation: u64,
    /// Moment the device read returned
    pub captured_at: Instant,
    pub captured_wall: SystemTime,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    /// Stale once its age reaches `max_age`; `None` disables the check
    pub fn is_stale(&self, max_age: Option<Duration>, now: Instant) -> bool {
        max_age.is_some_and(|max| self.age(now) >= max)
    }
}

/// Holds at most `capacity` frames, evicting the oldest on overflow.
///
/// Every frame that leaves without being handed to a consumer is counted
/// as dropped on the shared [`Statistics`].
#[derive(Debug)]
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    stats: Arc<Statistics>,
}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize, stats: Arc<Statistics>) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                capacity,
            }),
            stats,
        }
    }

    /// Stores `frame`, returning how many older frames were evicted
    pub fn publish(&self, frame: Frame) -> usize {
        let mut inner = self.inner.lock();
        inner.frames.push_back(frame);

        let evicted = inner.frames.len().saturating_sub(inner.capacity);
        inner.frames.drain(..evicted);
        drop(inner);

        self.stats.record_dropped(evicted as u64);
        evicted
    }

    pub fn take(&self, max_age: Option<Duration>) -> Result<Frame, FrameError> {
        self.take_at(max_age, Instant::now())
    }

    /// Removes and returns the newest frame.
    ///
    /// Older frames still queued are discarded as dropped. A stale newest
    /// frame empties the buffer, since everything behind it is older.
    pub fn take_at(&self, max_age: Option<Duration>, now: Instant) -> Result<Frame, FrameError> {
        let mut inner = self.inner.lock();
        let newest = inner.frames.pop_back().ok_or(FrameError::BufferEmpty)?;

        let mut discarded = inner.frames.len() as u64;
        inner.frames.clear();
        drop(inner);

        let result = if newest.is_stale(max_age, now) {
            discarded += 1;
            Err(FrameError::StaleFrame {
                age: newest.age(now),
            })
        } else {
            Ok(newest)
        };

        self.stats.record_dropped(discarded);
        result
    }

    pub fn peek(&self, max_age: Option<Duration>) -> Result<Frame, FrameError> {
        self.peek_at(max_age, Instant::now())
    }

    /// Returns a copy of the newest frame without removing anything
    pub fn peek_at(&self, max_age: Option<Duration>, now: Instant) -> Result<Frame, FrameError> {
        let newest = self
            .inner
            .lock()
            .frames
            .back()
            .cloned()
            .ok_or(FrameError::BufferEmpty)?;

        if newest.is_stale(max_age, now) {
            return Err(FrameError::StaleFrame {
                age: newest.age(now),
            });
        }

        Ok(newest)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Resizes the buffer; shrinking evicts the oldest frames as dropped
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut inner = self.inner.lock();
        inner.capacity = capacity;

        let evicted = inner.frames.len().saturating_sub(capacity);
        inner.frames.drain(..evicted);
        drop(inner);

        self.stats.record_dropped(evicted as u64);
    }

    /// Empties the buffer without counting drops
    pub fn clear(&self) {
        self.inner.lock().frames.clear();
    }
}
