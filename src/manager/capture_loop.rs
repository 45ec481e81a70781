//! The capture thread's state machine

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, error, info, warn};

use super::{ManagerState, Request, Shared};
use crate::buffer::Frame;
use crate::capture::{CaptureBackend, DeviceSession, RawFrame};
use crate::encode::FrameEncoder;
use crate::error::{ErrorReport, ManagerError, ReadError};

/// What the loop does on its next turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Open the device; `retry` is set when coming out of a backoff wait
    Open { retry: bool },
    Stream,
    /// Wait out `reconnect_interval`, then open again
    Backoff,
    /// Fatal stop; only restart or shutdown leave this
    Halted,
}

struct CaptureLoop {
    shared: Arc<Shared>,
    backend: Box<dyn CaptureBackend>,
    encoder: Arc<dyn FrameEncoder>,
    session: Option<Box<dyn DeviceSession>>,
    sequence: u64,
}

pub(super) fn run(
    shared: Arc<Shared>,
    backend: Box<dyn CaptureBackend>,
    encoder: Arc<dyn FrameEncoder>,
) {
    let mut capture = CaptureLoop {
        shared,
        backend,
        encoder,
        session: None,
        sequence: 0,
    };

    capture.run();
}

impl CaptureLoop {
    fn run(&mut self) {
        info!(device = %self.shared.config.load().device, "Capture loop started");
        let mut step = Step::Open { retry: false };

        loop {
            match self.shared.next_request() {
                Some(Request::Shutdown) => break,
                Some(Request::Restart) => {
                    self.new_epoch();
                    step = Step::Open { retry: false };
                }
                Some(Request::Reopen) => {
                    self.close_session();
                    if step == Step::Halted {
                        self.clear_failure();
                    }
                    self.shared.set_state(ManagerState::Connecting);
                    step = Step::Open { retry: false };
                }
                None => {}
            }

            step = match step {
                Step::Open { retry } => self.open(retry),
                Step::Stream => self.read(),
                Step::Backoff => {
                    let interval = self.shared.config.load().reconnect_interval();
                    debug!(interval_secs = interval.as_secs_f64(), "Waiting before reconnect");
                    self.shared.wait_for(interval);
                    Step::Open { retry: true }
                }
                Step::Halted => {
                    self.shared.wait_for_request();
                    Step::Halted
                }
            };
        }

        self.shared.set_state(ManagerState::ShuttingDown);
        self.close_session();
        self.shared.set_state(ManagerState::Stopped);

        let stats = self.shared.stats.snapshot();
        info!(
            frames = stats.frames_captured,
            dropped = stats.frames_dropped,
            "Capture loop stopped"
        );
    }

    fn open(&mut self, retry: bool) -> Step {
        let config = self.shared.config.load_full();

        match self.backend.open(&config) {
            Ok(session) => {
                *self.shared.session.lock() = Some(session.close_handle());
                self.session = Some(session);

                self.shared.reconnect_attempts.store(0, Ordering::Release);
                self.shared.set_error(None);
                if retry {
                    self.shared.stats.record_reconnect();
                    info!(device = %config.device, "Camera reconnected");
                }
                self.shared.set_state(ManagerState::Streaming);
                Step::Stream
            }
            Err(e) => {
                let attempts = self.shared.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                self.shared.stats.record_connection_error();
                self.shared.set_error(Some(ErrorReport::from(&e)));

                let max = config.max_reconnect_attempts;
                warn!(
                    device = %config.device,
                    attempt = attempts,
                    max_attempts = max,
                    error = %e,
                    "Failed to open camera"
                );

                if !config.auto_reconnect {
                    error!(device = %config.device, "Auto-reconnect disabled, capture stopped");
                    return self.halt(None);
                }

                if max > 0 && attempts >= max {
                    error!(
                        device = %config.device,
                        attempts,
                        "Reconnect budget exhausted, capture stopped"
                    );
                    let exhausted = ManagerError::ReconnectBudgetExhausted { attempts };
                    let report = exhausted.kind().map(|kind| {
                        ErrorReport::new(kind, format!("{}; last error: {}", exhausted, e))
                    });
                    return self.halt(report);
                }

                self.shared.set_state(ManagerState::Reconnecting);
                Step::Backoff
            }
        }
    }

    fn read(&mut self) -> Step {
        let Some(session) = self.session.as_mut() else {
            return Step::Open { retry: true };
        };

        // Closed through its handle; the pending request is handled next turn
        let result = if session.is_open() {
            session.read_frame()
        } else {
            Err(ReadError::Closed)
        };
        // Timestamp the moment the read returned, before any encoding
        let captured_at = Instant::now();
        let captured_wall = SystemTime::now();

        match result {
            Ok(raw) => {
                self.publish(raw, captured_at, captured_wall);
                Step::Stream
            }
            // Closed by restart, reopen or shutdown: not a device failure
            Err(_) if self.shared.has_request() => Step::Stream,
            Err(e) => self.read_failed(e),
        }
    }

    fn publish(&mut self, raw: RawFrame, captured_at: Instant, captured_wall: SystemTime) {
        let quality = self.shared.config.load().jpeg_quality;

        let data = match self.encoder.encode(&raw, quality) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame, dropping it");
                self.shared.stats.record_encode_failure();
                self.shared.set_error(Some(ErrorReport::from(&e)));
                return;
            }
        };

        self.sequence += 1;
        let frame = Frame {
            data,
            sequence: self.sequence,
            generation: self.shared.generation.load(Ordering::Acquire),
            captured_at,
            captured_wall,
            width: raw.width,
            height: raw.height,
        };

        // Buffer first so a counted frame is always visible to readers
        let evicted = self.shared.buffer.publish(frame);
        self.shared.stats.record_frame(captured_at, captured_wall);
        if evicted > 0 {
            debug!(sequence = self.sequence, evicted, "Buffer full, evicted oldest frames");
        }
    }

    fn read_failed(&mut self, e: ReadError) -> Step {
        self.close_session();

        let consecutive = self.shared.stats.record_connection_error();
        self.shared.set_error(Some(ErrorReport::from(&e)));

        let config = self.shared.config.load_full();
        warn!(
            device = %config.device,
            consecutive_errors = consecutive,
            error = %e,
            "Frame read failed, closing device"
        );

        if !config.auto_reconnect {
            error!(device = %config.device, "Auto-reconnect disabled, capture stopped");
            return self.halt(None);
        }

        self.shared.set_state(ManagerState::Reconnecting);
        Step::Backoff
    }

    /// Freezes in `Stopped` with the failure flag raised.
    ///
    /// `report` replaces the last recorded error when given.
    fn halt(&mut self, report: Option<ErrorReport>) -> Step {
        self.close_session();
        if report.is_some() {
            self.shared.set_error(report);
        }
        self.shared.failed.store(true, Ordering::Release);
        self.shared.set_state(ManagerState::Stopped);
        Step::Halted
    }

    fn clear_failure(&mut self) {
        self.shared.failed.store(false, Ordering::Release);
        self.shared.reconnect_attempts.store(0, Ordering::Release);
    }

    /// Restart: drop the session, zero every counter, and bump the generation
    fn new_epoch(&mut self) {
        self.close_session();
        self.clear_failure();
        self.shared.set_error(None);

        self.shared.buffer.clear();
        self.shared.stats.reset();
        self.sequence = 0;
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;

        self.shared.set_state(ManagerState::Connecting);
        info!(generation, "Camera restarted");
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        *self.shared.session.lock() = None;
    }
}
