//! Synthetic test-pattern source for `stub://` device ids

use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::info;

use super::{CaptureBackend, CloseHandle, DeviceSession, PixelFormat, RawFrame};
use crate::config::CameraConfig;
use crate::error::{OpenError, ReadError};

/// Generates moving RGB bars at the configured frame rate
#[derive(Debug, Default)]
pub struct SyntheticBackend;

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn open(&mut self, config: &CameraConfig) -> Result<Box<dyn DeviceSession>, OpenError> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(OpenError::ConfigurationRejected(format!(
                "{}x{}@{} is not a valid mode",
                config.width, config.height, config.fps
            )));
        }

        info!(
            device = %config.device,
            resolution = %format!("{}x{}", config.width, config.height),
            fps = config.fps,
            "Synthetic source opened"
        );

        Ok(Box::new(SyntheticSession {
            width: config.width,
            height: config.height,
            frame_interval: Duration::from_secs_f64(1.0 / config.fps as f64),
            next_due: None,
            frame_count: 0,
            close: CloseHandle::new(),
        }))
    }
}

struct SyntheticSession {
    width: u32,
    height: u32,
    frame_interval: Duration,
    next_due: Option<Instant>,
    frame_count: u64,
    close: CloseHandle,
}

impl SyntheticSession {
    /// Sleeps until the next frame is due, waking early when closed
    fn pace(&mut self) -> Result<(), ReadError> {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);

        let mut remaining = due.saturating_duration_since(now);
        while !remaining.is_zero() {
            if self.close.is_closed() {
                return Err(ReadError::Closed);
            }
            let slice = remaining.min(Duration::from_millis(50));
            std::thread::sleep(slice);
            remaining -= slice;
        }

        self.next_due = Some(due.max(now) + self.frame_interval);
        Ok(())
    }

    fn render(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let shift = (self.frame_count * 4) as usize;

        let mut pixels = vec![0u8; width * height * 3];
        for y in 0..height {
            for x in 0..width {
                let band = ((x + shift) * 8 / width.max(1)) % 8;
                let offset = (y * width + x) * 3;
                pixels[offset] = if band & 1 != 0 { 0xff } else { 0x20 };
                pixels[offset + 1] = if band & 2 != 0 { 0xff } else { 0x20 };
                pixels[offset + 2] = if band & 4 != 0 { 0xff } else { 0x20 };
            }
        }
        pixels
    }
}

impl DeviceSession for SyntheticSession {
    fn read_frame(&mut self) -> Result<RawFrame, ReadError> {
        if self.close.is_closed() {
            return Err(ReadError::Closed);
        }

        self.pace()?;
        self.frame_count += 1;

        Ok(RawFrame {
            data: Bytes::from(self.render()),
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgb24,
        })
    }

    fn close(&mut self) {
        self.close.close();
    }

    fn is_open(&self) -> bool {
        !self.close.is_closed()
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

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: DeviceId::Path("stub://bars".into()),
            width: 16,
            height: 8,
            fps: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_produces_rgb_frames() {
        let mut backend = SyntheticBackend::new();
        let mut session = backend.open(&stub_config()).unwrap();

        let frame = session.read_frame().unwrap();
        assert_eq!(frame.format, PixelFormat::Rgb24);
        assert_eq!(frame.data.len(), 16 * 8 * 3);
    }

    #[test]
    fn test_frames_change_over_time() {
        let mut backend = SyntheticBackend::new();
        let mut session = backend.open(&stub_config()).unwrap();

        let first = session.read_frame().unwrap();
        let second = session.read_frame().unwrap();
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut backend = SyntheticBackend::new();
        let mut session = backend.open(&stub_config()).unwrap();

        session.close();
        session.close();
        assert!(!session.is_open());
        assert_matches!(session.read_frame(), Err(ReadError::Closed));
    }

    #[test]
    fn test_close_handle_interrupts_pacing() {
        let mut backend = SyntheticBackend::new();
        let config = CameraConfig {
            fps: 1,
            ..stub_config()
        };
        let mut session = backend.open(&config).unwrap();
        session.read_frame().unwrap();

        let handle = session.close_handle();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handle.close();
        });

        let started = Instant::now();
        assert_matches!(session.read_frame(), Err(ReadError::Closed));
        assert!(started.elapsed() < Duration::from_millis(900));
        closer.join().unwrap();
    }
}
