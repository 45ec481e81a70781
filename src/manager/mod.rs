//! Camera manager: owns the capture thread and exposes the control surface

mod capture_loop;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::buffer::{Frame, FrameBuffer};
use crate::capture::{CaptureBackend, CloseHandle};
use crate::config::CameraConfig;
use crate::encode::{FrameEncoder, JpegEncoder};
use crate::error::{ErrorReport, FrameError, ManagerError};
use crate::stats::{Statistics, StatsSnapshot};

/// Capture loop state; exactly one holds at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Stopped,
    Connecting,
    Streaming,
    Reconnecting,
    ShuttingDown,
}

impl ManagerState {
    fn as_u8(self) -> u8 {
        match self {
            ManagerState::Stopped => 0,
            ManagerState::Connecting => 1,
            ManagerState::Streaming => 2,
            ManagerState::Reconnecting => 3,
            ManagerState::ShuttingDown => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ManagerState::Connecting,
            2 => ManagerState::Streaming,
            3 => ManagerState::Reconnecting,
            4 => ManagerState::ShuttingDown,
            _ => ManagerState::Stopped,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Stopped => "stopped",
            ManagerState::Connecting => "connecting",
            ManagerState::Streaming => "streaming",
            ManagerState::Reconnecting => "reconnecting",
            ManagerState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// Copied view of the manager, safe to take from any thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: ManagerState,
    /// Capture thread is alive and not stopped
    pub is_running: bool,
    pub is_connected: bool,
    /// Stopped after a fatal error; cleared by restart
    pub failed: bool,
    pub last_error: Option<ErrorReport>,
    pub queue_size: usize,
    pub reconnect_attempts: u32,
    pub generation: u64,
    pub started: bool,
    pub stats: StatsSnapshot,
    pub config: CameraConfig,
}

#[derive(Debug, Default)]
struct Control {
    restart: bool,
    reopen: bool,
    shutdown: bool,
}

/// Request observed by the capture loop at its next check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Shutdown,
    Restart,
    Reopen,
}

/// State shared between the capture thread and everyone else
struct Shared {
    config: ArcSwap<CameraConfig>,
    stats: Arc<Statistics>,
    buffer: FrameBuffer,
    state: AtomicU8,
    failed: AtomicBool,
    last_error: Mutex<Option<ErrorReport>>,
    reconnect_attempts: AtomicU32,
    generation: AtomicU64,
    started: AtomicBool,
    control: Mutex<Control>,
    wake: Condvar,
    session: Mutex<Option<CloseHandle>>,
}

impl Shared {
    fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ManagerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn set_error(&self, report: Option<ErrorReport>) {
        *self.last_error.lock() = report;
    }

    /// Pops the most urgent pending request
    fn next_request(&self) -> Option<Request> {
        let mut control = self.control.lock();
        if control.shutdown {
            return Some(Request::Shutdown);
        }
        if control.restart {
            control.restart = false;
            control.reopen = false;
            return Some(Request::Restart);
        }
        if control.reopen {
            control.reopen = false;
            return Some(Request::Reopen);
        }
        None
    }

    fn has_request(&self) -> bool {
        let control = self.control.lock();
        control.shutdown || control.restart || control.reopen
    }

    /// Sleeps up to `timeout`, returning early when a request arrives
    fn wait_for(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut control = self.control.lock();
        while !(control.shutdown || control.restart || control.reopen) {
            if self.wake.wait_until(&mut control, deadline).timed_out() {
                break;
            }
        }
    }

    /// Sleeps until any request arrives
    fn wait_for_request(&self) {
        let mut control = self.control.lock();
        while !(control.shutdown || control.restart || control.reopen) {
            self.wake.wait(&mut control);
        }
    }

    /// Records a request and aborts the current session's pending read.
    ///
    /// The session is closed under the control lock: the loop cannot pop the
    /// request, and so cannot open a replacement session, until it is released.
    fn post(&self, apply: impl FnOnce(&mut Control)) {
        let mut control = self.control.lock();
        apply(&mut control);
        self.close_session();
        drop(control);
        self.wake.notify_all();
    }

    /// Aborts a pending read on the current session, if any
    fn close_session(&self) {
        if let Some(handle) = self.session.lock().as_ref() {
            handle.close();
        }
    }
}

/// Single camera, single capture thread.
///
/// Constructed once at startup and shared by reference with the HTTP and
/// signal layers. Device errors never leave the capture thread; callers
/// observe them through [`CameraManager::snapshot`].
pub struct CameraManager {
    shared: Arc<Shared>,
    backend: Mutex<Option<Box<dyn CaptureBackend>>>,
    encoder: Arc<dyn FrameEncoder>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CameraManager {
    /// Creates a manager that encodes with [`JpegEncoder`]
    pub fn new(
        config: CameraConfig,
        backend: Box<dyn CaptureBackend>,
    ) -> Result<Self, ManagerError> {
        Self::with_encoder(config, backend, Arc::new(JpegEncoder::new()))
    }

    pub fn with_encoder(
        config: CameraConfig,
        backend: Box<dyn CaptureBackend>,
        encoder: Arc<dyn FrameEncoder>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;

        let stats = Arc::new(Statistics::new());
        let shared = Shared {
            buffer: FrameBuffer::new(config.buffer_size, Arc::clone(&stats)),
            config: ArcSwap::from_pointee(config),
            stats,
            state: AtomicU8::new(ManagerState::Stopped.as_u8()),
            failed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            generation: AtomicU64::new(1),
            started: AtomicBool::new(false),
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            session: Mutex::new(None),
        };

        Ok(Self {
            shared: Arc::new(shared),
            backend: Mutex::new(Some(backend)),
            encoder,
            thread: Mutex::new(None),
        })
    }

    /// Spawns the capture thread; the loop enters `Connecting` immediately
    pub fn start(&self) -> Result<(), ManagerError> {
        if self.shared.control.lock().shutdown {
            return Err(ManagerError::ShutDown);
        }

        let backend = self
            .backend
            .lock()
            .take()
            .ok_or(ManagerError::AlreadyStarted)?;

        let shared = Arc::clone(&self.shared);
        let encoder = Arc::clone(&self.encoder);

        shared.started.store(true, Ordering::Release);
        shared.set_state(ManagerState::Connecting);

        let handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || capture_loop::run(shared, backend, encoder));

        match handle {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                info!("Camera manager started");
                Ok(())
            }
            Err(e) => {
                self.shared.started.store(false, Ordering::Release);
                self.shared.set_state(ManagerState::Stopped);
                Err(ManagerError::Spawn(e))
            }
        }
    }

    /// Abandons the current session or backoff wait and starts a new epoch.
    ///
    /// Only requests the transition; the capture thread performs it.
    pub fn restart(&self) -> Result<(), ManagerError> {
        if self.shared.control.lock().shutdown {
            return Err(ManagerError::ShutDown);
        }

        info!("Camera restart requested");
        self.shared.post(|control| control.restart = true);
        Ok(())
    }

    /// Swaps in a new configuration.
    ///
    /// Returns whether the change touches the device or its capture mode;
    /// in that case the session is reopened without starting a new epoch.
    /// Other fields apply from the next frame.
    pub fn reconfigure(&self, config: CameraConfig) -> Result<bool, ManagerError> {
        config.validate()?;

        let previous = self.shared.config.load_full();
        let reopen = previous.requires_reopen(&config);
        let buffer_size = config.buffer_size;

        self.shared.config.store(Arc::new(config));
        self.shared.buffer.set_capacity(buffer_size);

        if reopen && self.shared.started.load(Ordering::Acquire) {
            info!("Capture mode changed, reopening device");
            self.shared.post(|control| control.reopen = true);
        } else {
            info!("Camera configuration updated");
        }

        Ok(reopen)
    }

    /// Stops the capture thread. Idempotent.
    pub fn request_shutdown(&self) {
        let shared = &self.shared;
        let mut first = false;
        shared.post(|control| {
            first = !control.shutdown;
            control.shutdown = true;
            // Before the wake-up, so the loop's final `Stopped` always lands last
            if first && shared.started.load(Ordering::Acquire) {
                shared.set_state(ManagerState::ShuttingDown);
            }
        });

        if first {
            info!("Camera shutdown requested");
        }
    }

    /// Waits for the capture thread to exit
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Capture thread panicked");
                self.shared.set_state(ManagerState::Stopped);
            }
        }
    }

    pub fn state(&self) -> ManagerState {
        self.shared.state()
    }

    pub fn config(&self) -> CameraConfig {
        self.shared.config.load().as_ref().clone()
    }

    pub fn snapshot(&self) -> Status {
        let shared = &self.shared;
        let state = shared.state();
        let started = shared.started.load(Ordering::Acquire);

        Status {
            state,
            is_running: started && state != ManagerState::Stopped,
            is_connected: state == ManagerState::Streaming,
            failed: shared.failed.load(Ordering::Acquire),
            last_error: shared.last_error.lock().clone(),
            queue_size: shared.buffer.len(),
            reconnect_attempts: shared.reconnect_attempts.load(Ordering::Acquire),
            generation: shared.generation.load(Ordering::Acquire),
            started,
            stats: shared.stats.snapshot(),
            config: self.config(),
        }
    }

    /// Removes and returns the freshest frame under the active `max_frame_age`
    pub fn take(&self) -> Result<Frame, FrameError> {
        let max_age = self.shared.config.load().max_frame_age();
        self.shared.buffer.take(max_age)
    }

    /// Returns the freshest frame without consuming it
    pub fn peek(&self) -> Result<Frame, FrameError> {
        let max_age = self.shared.config.load().max_frame_age();
        self.shared.buffer.peek(max_age)
    }

    /// Freshest frame for fan-out consumers; same as [`CameraManager::peek`]
    pub fn latest_frame(&self) -> Result<Frame, FrameError> {
        self.peek()
    }

    /// Streaming, with a last frame younger than `max_frame_age`
    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    pub fn is_healthy_at(&self, now: Instant) -> bool {
        if self.shared.state() != ManagerState::Streaming {
            return false;
        }

        match self.shared.stats.last_frame_age(now) {
            None => false,
            Some(age) => self
                .shared
                .config
                .load()
                .max_frame_age()
                .map_or(true, |max| age < max),
        }
    }

    pub fn last_frame_age(&self) -> Option<Duration> {
        self.shared.stats.last_frame_age(Instant::now())
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;
    use crate::config::DeviceId;
    use assert_matches::assert_matches;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: DeviceId::Path("stub://unit".into()),
            width: 8,
            height: 8,
            fps: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ManagerState::Stopped,
            ManagerState::Connecting,
            ManagerState::Streaming,
            ManagerState::Reconnecting,
            ManagerState::ShuttingDown,
        ] {
            assert_eq!(ManagerState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ManagerState::ShuttingDown.to_string(), "shutting_down");
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = CameraConfig {
            fps: 0,
            ..stub_config()
        };
        let result = CameraManager::new(config, Box::new(SyntheticBackend::new()));
        assert_matches!(result.err(), Some(ManagerError::InvalidConfig(_)));
    }

    #[test]
    fn test_snapshot_before_start() {
        let manager = CameraManager::new(stub_config(), Box::new(SyntheticBackend::new())).unwrap();
        let status = manager.snapshot();

        assert_eq!(status.state, ManagerState::Stopped);
        assert!(!status.is_running);
        assert!(!status.started);
        assert_eq!(status.generation, 1);
        assert!(!manager.is_healthy());
        assert_matches!(manager.peek(), Err(FrameError::BufferEmpty));
    }

    #[test]
    fn test_start_twice() {
        let manager = CameraManager::new(stub_config(), Box::new(SyntheticBackend::new())).unwrap();
        manager.start().unwrap();
        assert_matches!(manager.start(), Err(ManagerError::AlreadyStarted));

        manager.request_shutdown();
        manager.join();
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let manager = CameraManager::new(stub_config(), Box::new(SyntheticBackend::new())).unwrap();
        manager.start().unwrap();

        manager.request_shutdown();
        manager.request_shutdown();
        manager.join();

        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_matches!(manager.restart(), Err(ManagerError::ShutDown));
        assert_matches!(manager.start(), Err(ManagerError::ShutDown));
    }

    #[test]
    fn test_reconfigure_reports_reopen() {
        let manager = CameraManager::new(stub_config(), Box::new(SyntheticBackend::new())).unwrap();

        let quality = CameraConfig {
            jpeg_quality: 20,
            ..stub_config()
        };
        assert!(!manager.reconfigure(quality).unwrap());
        assert_eq!(manager.config().jpeg_quality, 20);

        let resized = CameraConfig {
            width: 16,
            ..stub_config()
        };
        assert!(manager.reconfigure(resized).unwrap());

        let invalid = CameraConfig {
            buffer_size: 0,
            ..stub_config()
        };
        assert!(manager.reconfigure(invalid).is_err());
        assert_eq!(manager.config().width, 16);
    }
}
