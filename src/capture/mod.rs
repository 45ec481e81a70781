//! Camera device binding
//!
//! The capture loop only talks to the [`CaptureBackend`] and
//! [`DeviceSession`] traits; the V4L2 and synthetic sources are the
//! two implementations shipped with the service.

mod synthetic;
#[cfg(target_os = "linux")]
mod v4l2;

pub use synthetic::SyntheticBackend;
#[cfg(target_os = "linux")]
pub use v4l2::V4l2Backend;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::CameraConfig;
use crate::error::{OpenError, ReadError};

/// Pixel layout of a raw frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, the format almost every UVC camera offers
    #[default]
    Yuyv,
    /// Camera-side JPEG
    Mjpeg,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    /// V4L2 fourcc code
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Gray8 => *b"GREY",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"GREY" => Some(PixelFormat::Gray8),
            _ => None,
        }
    }

    /// Bytes per frame for uncompressed formats
    pub fn frame_len(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Rgb24 => Some(pixels * 3),
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Mjpeg => None,
        }
    }
}

/// One frame as delivered by the device, before JPEG encoding
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Thread-safe switch that aborts a session's pending read.
///
/// The capture loop hands a clone to the control surface so shutdown and
/// restart never have to touch the session itself.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Factory for device sessions
pub trait CaptureBackend: Send {
    /// Acquires the device and applies the requested capture mode
    fn open(&mut self, config: &CameraConfig) -> Result<Box<dyn DeviceSession>, OpenError>;
}

/// One open camera handle, owned by the capture loop
pub trait DeviceSession {
    /// Blocks until a frame arrives, the read times out, or the session is closed
    fn read_frame(&mut self) -> Result<RawFrame, ReadError>;

    /// Releases the device. Safe to call more than once.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn close_handle(&self) -> CloseHandle;
}

/// Picks the backend for the configured device id
pub fn backend_for(config: &CameraConfig) -> Box<dyn CaptureBackend> {
    if config.device.is_synthetic() {
        info!(device = %config.device, "Using synthetic test-pattern source");
        return Box::new(SyntheticBackend::new());
    }

    platform_backend()
}

#[cfg(target_os = "linux")]
fn platform_backend() -> Box<dyn CaptureBackend> {
    Box::new(V4l2Backend::new())
}

#[cfg(not(target_os = "linux"))]
fn platform_backend() -> Box<dyn CaptureBackend> {
    Box::new(Unsupported)
}

/// Stand-in on platforms without V4L2; every open fails as unavailable
#[cfg(not(target_os = "linux"))]
struct Unsupported;

#[cfg(not(target_os = "linux"))]
impl CaptureBackend for Unsupported {
    fn open(&mut self, config: &CameraConfig) -> Result<Box<dyn DeviceSession>, OpenError> {
        Err(OpenError::DeviceUnavailable(format!(
            "{}: V4L2 capture is only available on Linux",
            config.device
        )))
    }
}
