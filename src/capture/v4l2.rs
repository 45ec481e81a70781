//! V4L2 device binding over memory-mapped buffers

use bytes::Bytes;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{CaptureBackend, CloseHandle, DeviceSession, PixelFormat, RawFrame};
use crate::config::CameraConfig;
use crate::error::{OpenError, ReadError};

const EBUSY: i32 = 16;

/// Driver buffers queued for capture
const BUFFER_COUNT: u32 = 4;

/// Upper bound on a single poll so a closed session is noticed promptly
const POLL_SLICE: Duration = Duration::from_millis(250);

/// Opens `/dev/videoN` (or an explicit path) through V4L2
#[derive(Debug, Default)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

fn unavailable(path: &str, stage: &str, err: io::Error) -> OpenError {
    let reason = match err.kind() {
        io::ErrorKind::NotFound => "no such device".to_string(),
        io::ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ if err.raw_os_error() == Some(EBUSY) => "device busy".to_string(),
        _ => err.to_string(),
    };
    OpenError::DeviceUnavailable(format!("{}: {}: {}", path, stage, reason))
}

impl CaptureBackend for V4l2Backend {
    fn open(&mut self, config: &CameraConfig) -> Result<Box<dyn DeviceSession>, OpenError> {
        let path = config.device.path();

        let device = Device::with_path(&path).map_err(|e| unavailable(&path, "open", e))?;

        let caps = device
            .query_caps()
            .map_err(|e| unavailable(&path, "query capabilities", e))?;
        debug!(device = %path, card = %caps.card, driver = %caps.driver, "Queried device");

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(OpenError::ConfigurationRejected(format!(
                "{} ({}) does not support video capture",
                path, caps.card
            )));
        }

        let mut format = device
            .format()
            .map_err(|e| unavailable(&path, "read format", e))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = FourCC::new(&config.pixel_format.fourcc());

        let format = device.set_format(&format).map_err(|e| {
            if e.raw_os_error() == Some(EBUSY) {
                unavailable(&path, "set format", e)
            } else {
                OpenError::ConfigurationRejected(format!("{}: set format: {}", path, e))
            }
        })?;

        let format_kind = PixelFormat::from_fourcc(&format.fourcc.repr);
        if format_kind != Some(config.pixel_format) {
            return Err(OpenError::ConfigurationRejected(format!(
                "{} refused {:?}, driver offered {}",
                path, config.pixel_format, format.fourcc
            )));
        }

        if format.width != config.width || format.height != config.height {
            warn!(
                device = %path,
                requested = %format!("{}x{}", config.width, config.height),
                actual = %format!("{}x{}", format.width, format.height),
                "Driver adjusted resolution"
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!(device = %path, fps = config.fps, error = %e, "Failed to set frame rate");
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| unavailable(&path, "map buffers", e))?;
        stream.set_timeout(POLL_SLICE);

        info!(
            device = %path,
            card = %caps.card,
            resolution = %format!("{}x{}", format.width, format.height),
            format = %format.fourcc,
            fps = config.fps,
            "Camera opened"
        );

        Ok(Box::new(V4l2Session {
            stream: Some(stream),
            _device: device,
            path,
            width: format.width,
            height: format.height,
            format: config.pixel_format,
            read_timeout: config.read_timeout(),
            close: CloseHandle::new(),
        }))
    }
}

struct V4l2Session {
    // Dropped before the device so STREAMOFF runs on an open fd
    stream: Option<MmapStream<'static>>,
    _device: Device,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Zero waits until a frame arrives or the session is closed
    read_timeout: Duration,
    close: CloseHandle,
}

impl DeviceSession for V4l2Session {
    fn read_frame(&mut self) -> Result<RawFrame, ReadError> {
        let started = Instant::now();

        loop {
            if self.close.is_closed() {
                return Err(ReadError::Closed);
            }

            let stream = self.stream.as_mut().ok_or(ReadError::Closed)?;

            match stream.next() {
                Ok((buf, meta)) => {
                    let used = match meta.bytesused as usize {
                        0 => buf.len(),
                        n => n.min(buf.len()),
                    };

                    return Ok(RawFrame {
                        data: Bytes::copy_from_slice(&buf[..used]),
                        width: self.width,
                        height: self.height,
                        format: self.format,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if !self.read_timeout.is_zero() && started.elapsed() >= self.read_timeout {
                        return Err(ReadError::Timeout(self.read_timeout));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.close.is_closed() {
                        return Err(ReadError::Closed);
                    }
                    return Err(ReadError::DeviceLost(format!("{}: {}", self.path, e)));
                }
            }
        }
    }

    fn close(&mut self) {
        self.close.close();
        if self.stream.take().is_some() {
            debug!(device = %self.path, "Camera stream released");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some() && !self.close.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceId;
    use assert_matches::assert_matches;

    #[test]
    fn test_missing_device_is_unavailable() {
        let config = CameraConfig {
            device: DeviceId::Path("/dev/video-does-not-exist".into()),
            ..Default::default()
        };

        let result = V4l2Backend::new().open(&config);
        assert_matches!(result.err(), Some(OpenError::DeviceUnavailable(msg)) if msg.contains("no such device"));
    }

    #[test]
    fn test_busy_error_is_classified() {
        let err = unavailable("/dev/video0", "open", io::Error::from_raw_os_error(EBUSY));
        assert_eq!(
            err,
            OpenError::DeviceUnavailable("/dev/video0: open: device busy".into())
        );
    }
}
