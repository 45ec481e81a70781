//! Capture statistics

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Counters shared between the capture loop and readers.
///
/// Counters are lock-free; the timestamps sit behind a mutex that is only
/// held for a copy, never across device I/O.
#[derive(Debug)]
pub struct Statistics {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    encode_errors: AtomicU64,
    consecutive_errors: AtomicU64,
    connection_errors: AtomicU64,
    times: Mutex<Times>,
}

#[derive(Debug, Clone, Copy)]
struct Times {
    started_at: Instant,
    last_frame: Option<Instant>,
    last_frame_wall: Option<SystemTime>,
    last_reconnect: Option<SystemTime>,
}

impl Times {
    fn fresh() -> Self {
        Self {
            started_at: Instant::now(),
            last_frame: None,
            last_frame_wall: None,
            last_reconnect: None,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            times: Mutex::new(Times::fresh()),
        }
    }

    /// Records a successful read; the timestamp is the moment of the read
    pub fn record_frame(&self, captured_at: Instant, wall: SystemTime) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);

        let mut times = self.times.lock();
        times.last_frame = Some(captured_at);
        times.last_frame_wall = Some(wall);
    }

    pub fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.frames_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// A frame that failed to encode counts as dropped
    pub fn record_encode_failure(&self) {
        self.encode_errors.fetch_add(1, Ordering::Relaxed);
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the consecutive error count after this failure
    pub fn record_connection_error(&self) -> u64 {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reconnect(&self) {
        self.times.lock().last_reconnect = Some(SystemTime::now());
    }

    /// Starts a new epoch: every counter back to zero, uptime restarts
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.encode_errors.store(0, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
        *self.times.lock() = Times::fresh();
    }

    pub fn last_frame_age(&self, now: Instant) -> Option<Duration> {
        self.times
            .lock()
            .last_frame
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        let times = *self.times.lock();

        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            uptime_secs: now.saturating_duration_since(times.started_at).as_secs_f64(),
            last_frame_age_secs: times
                .last_frame
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            last_frame_time: times.last_frame_wall.map(unix_secs),
            last_reconnect: times.last_reconnect.map(unix_secs),
        }
    }
}

fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Frames read and published since the last restart
    pub frames_captured: u64,

    /// Frames evicted unread, rejected as stale, or lost to encode failures
    pub frames_dropped: u64,

    pub encode_errors: u64,

    /// Failures since the last successful frame
    pub consecutive_errors: u64,

    /// Failed reads and failed opens since the last restart
    pub connection_errors: u64,

    pub uptime_secs: f64,

    pub last_frame_age_secs: Option<f64>,

    /// Unix seconds
    pub last_frame_time: Option<f64>,

    /// Unix seconds of the last successful reopen
    pub last_reconnect: Option<f64>,
}

impl StatsSnapshot {
    /// Capture rate between two snapshots
    pub fn capture_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_captured.saturating_sub(previous.frames_captured);
        frames_delta as f64 / elapsed_secs
    }

    /// Share of captured frames that never reached a consumer
    pub fn drop_rate(&self) -> f64 {
        if self.frames_captured == 0 {
            return 0.0;
        }

        self.frames_dropped as f64 / self.frames_captured as f64
    }
}
