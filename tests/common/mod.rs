//! Scripted capture backend and helpers shared by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use usb_mjpeg_streamer::{
    CameraConfig, CaptureBackend, CloseHandle, DeviceId, DeviceSession, EncodeError, FrameEncoder,
    OpenError, PixelFormat, RawFrame, ReadError,
};

/// One scripted result of `read_frame`
#[derive(Debug, Clone)]
pub enum Read {
    /// A valid 2x2 grayscale frame
    Frame,
    /// An MJPEG buffer without markers; the JPEG encoder rejects it
    Corrupt,
    Fail(ReadError),
    /// Blocks until the session is closed
    Block,
}

/// What happens once a script runs dry
#[derive(Debug, Clone)]
pub enum Then {
    Block,
    /// Waits for reads pushed later, until the session is closed
    Await,
    /// Endless frames at this interval
    Stream(Duration),
}

#[derive(Debug)]
struct Script {
    opens: VecDeque<Result<(), OpenError>>,
    /// Used once `opens` is empty; `None` means every open succeeds
    open_failure: Option<OpenError>,
    reads: VecDeque<Read>,
    then: Then,
    open_count: usize,
    close_count: usize,
}

/// Backend driven by a shared script; clones observe the same state
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new(reads: Vec<Read>, then: Then) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                opens: VecDeque::new(),
                open_failure: None,
                reads: reads.into(),
                then,
                open_count: 0,
                close_count: 0,
            })),
        }
    }

    /// `count` scripted frames, then blocks
    pub fn frames(count: usize) -> Self {
        Self::new(vec![Read::Frame; count], Then::Block)
    }

    /// No frames until `push_reads`
    pub fn idle() -> Self {
        Self::new(Vec::new(), Then::Await)
    }

    pub fn streaming(interval: Duration) -> Self {
        Self::new(Vec::new(), Then::Stream(interval))
    }

    /// Every open fails as unavailable
    pub fn unplugged() -> Self {
        let backend = Self::new(Vec::new(), Then::Block);
        backend.script.lock().open_failure =
            Some(OpenError::DeviceUnavailable("no such device".into()));
        backend
    }

    pub fn with_opens(self, opens: Vec<Result<(), OpenError>>) -> Self {
        self.script.lock().opens = opens.into();
        self
    }

    pub fn push_reads(&self, reads: Vec<Read>) {
        self.script.lock().reads.extend(reads);
    }

    pub fn open_count(&self) -> usize {
        self.script.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.script.lock().close_count
    }

    pub fn boxed(&self) -> Box<dyn CaptureBackend> {
        Box::new(self.clone())
    }
}

impl CaptureBackend for ScriptedBackend {
    fn open(&mut self, _config: &CameraConfig) -> Result<Box<dyn DeviceSession>, OpenError> {
        let mut script = self.script.lock();
        script.open_count += 1;

        let outcome = match script.opens.pop_front() {
            Some(outcome) => outcome,
            None => match &script.open_failure {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
        };
        outcome?;

        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            close: CloseHandle::new(),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    close: CloseHandle,
    closed: bool,
}

impl ScriptedSession {
    fn block(&self) -> Result<RawFrame, ReadError> {
        while !self.close.is_closed() {
            std::thread::sleep(Duration::from_millis(2));
        }
        Err(ReadError::Closed)
    }
}

fn gray_frame() -> RawFrame {
    RawFrame {
        data: Bytes::from_static(&[10, 20, 30, 40]),
        width: 2,
        height: 2,
        format: PixelFormat::Gray8,
    }
}

impl DeviceSession for ScriptedSession {
    fn read_frame(&mut self) -> Result<RawFrame, ReadError> {
        if self.close.is_closed() {
            return Err(ReadError::Closed);
        }

        let (next, then) = loop {
            let (next, then) = {
                let mut script = self.script.lock();
                (script.reads.pop_front(), script.then.clone())
            };
            if next.is_some() || !matches!(then, Then::Await) {
                break (next, then);
            }
            if self.close.is_closed() {
                return Err(ReadError::Closed);
            }
            std::thread::sleep(Duration::from_millis(2));
        };

        match next {
            Some(Read::Frame) => Ok(gray_frame()),
            Some(Read::Corrupt) => Ok(RawFrame {
                data: Bytes::from_static(&[0, 1, 2, 3, 4, 5]),
                width: 2,
                height: 2,
                format: PixelFormat::Mjpeg,
            }),
            Some(Read::Fail(err)) => Err(err),
            Some(Read::Block) => self.block(),
            None => match then {
                Then::Block | Then::Await => self.block(),
                Then::Stream(interval) => {
                    std::thread::sleep(interval);
                    if self.close.is_closed() {
                        return Err(ReadError::Closed);
                    }
                    Ok(gray_frame())
                }
            },
        }
    }

    fn close(&mut self) {
        self.close.close();
        if !self.closed {
            self.closed = true;
            self.script.lock().close_count += 1;
        }
    }

    fn is_open(&self) -> bool {
        !self.close.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

/// Passes frame bytes through and records the quality of every call
#[derive(Debug, Clone, Default)]
pub struct RecordingEncoder {
    qualities: Arc<Mutex<Vec<u8>>>,
}

impl RecordingEncoder {
    pub fn qualities(&self) -> Vec<u8> {
        self.qualities.lock().clone()
    }
}

impl FrameEncoder for RecordingEncoder {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, EncodeError> {
        self.qualities.lock().push(quality);
        Ok(frame.data.clone())
    }
}

/// Small, fast-reconnecting config for scripted runs
pub fn test_config() -> CameraConfig {
    CameraConfig {
        device: DeviceId::Path("/dev/video-test".into()),
        width: 2,
        height: 2,
        fps: 30,
        buffer_size: 16,
        reconnect_interval_secs: 0.01,
        max_reconnect_attempts: 0,
        ..Default::default()
    }
}

/// Polls `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub const TIMEOUT: Duration = Duration::from_secs(5);
