//! Resilient USB camera MJPEG-over-HTTP streaming
//!
//! The capture engine runs on its own thread and survives unplugged,
//! busy, or misbehaving devices:
//! - [`capture`] binds a V4L2 device (or a synthetic `stub://` source)
//! - [`manager`] drives the open/read/reconnect state machine
//! - [`buffer`] holds the freshest frames with overwrite-on-full semantics
//! - [`web`] serves them as `multipart/x-mixed-replace` MJPEG over axum
//!
//! # Example
//!
//! ```no_run
//! use usb_mjpeg_streamer::{backend_for, CameraConfig, CameraManager};
//!
//! let config = CameraConfig::default();
//! let camera = CameraManager::new(config.clone(), backend_for(&config))?;
//! camera.start()?;
//! // ... serve camera.peek() to clients
//! camera.request_shutdown();
//! camera.join();
//! # Ok::<(), usb_mjpeg_streamer::ManagerError>(())
//! ```

pub mod app_state;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod encode;
pub mod error;
pub mod logging;
pub mod manager;
pub mod signals;
pub mod stats;
pub mod web;

// Re-exports for convenience
pub use app_state::{AppState, StatsReport};
pub use buffer::{Frame, FrameBuffer};
pub use capture::{backend_for, CaptureBackend, CloseHandle, DeviceSession, PixelFormat, RawFrame};
pub use config::{CameraConfig, Config, ConfigStore, DeviceId, ServerConfig};
pub use encode::{FrameEncoder, JpegEncoder};
pub use error::{EncodeError, ErrorKind, FrameError, ManagerError, OpenError, ReadError};
pub use manager::{CameraManager, ManagerState, Status};
pub use stats::{Statistics, StatsSnapshot};
