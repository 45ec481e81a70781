//! Control operations shared by the HTTP and signal layers

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, ConfigStore};
use crate::error::ManagerError;
use crate::manager::{CameraManager, Status};
use crate::stats::StatsSnapshot;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Camera(#[from] ManagerError),
}

/// Outcome of a reload or config update
#[derive(Debug, Clone, Serialize)]
pub struct ConfigChange {
    pub changed: bool,
    /// The device was reopened because its capture mode changed
    pub camera_reopened: bool,
    /// Host/port/logging changes only apply after a process restart
    pub server_restart_required: bool,
}

/// Status plus rates derived from the previous report
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub status: Status,
    /// Frames per second since the previous report
    pub capture_fps: f64,
    pub drop_rate: f64,
}

pub struct AppState {
    pub camera: Arc<CameraManager>,
    pub config: Arc<ConfigStore>,
    shutdown: watch::Sender<bool>,
    last_report: Mutex<Option<(Instant, StatsSnapshot)>>,
}

impl AppState {
    pub fn new(camera: Arc<CameraManager>, config: Arc<ConfigStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            camera,
            config,
            shutdown,
            last_report: Mutex::new(None),
        }
    }

    /// Resolves once shutdown has been requested
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops the camera and tells the HTTP server to drain. Idempotent.
    pub fn request_shutdown(&self) {
        let first = self.shutdown.send_if_modified(|stopping| {
            let was = *stopping;
            *stopping = true;
            !was
        });

        if first {
            info!("Graceful shutdown initiated");
        }
        self.camera.request_shutdown();
    }

    pub fn restart_camera(&self) -> Result<(), ControlError> {
        self.camera.restart()?;
        Ok(())
    }

    /// Re-reads the config file and hands camera changes to the manager
    pub fn reload_config(&self) -> Result<ConfigChange, ControlError> {
        let previous = self.config.current();
        let outcome = self.config.reload()?;

        let camera_reopened = if outcome.config.camera != previous.camera {
            self.camera.reconfigure(outcome.config.camera.clone())?
        } else {
            false
        };

        Ok(describe(&previous, &outcome.config, outcome.changed, camera_reopened))
    }

    /// Deep-merges a JSON patch, persists it, and applies the camera part
    pub fn update_config(
        &self,
        patch: &serde_json::Value,
    ) -> Result<(Config, ConfigChange), ControlError> {
        let previous = self.config.current();
        let updated = self.config.update(patch)?;

        let camera_reopened = if updated.camera != previous.camera {
            self.camera.reconfigure(updated.camera.clone())?
        } else {
            false
        };

        let change = describe(&previous, &updated, updated != previous, camera_reopened);
        Ok((updated, change))
    }

    /// Snapshot with the capture rate since the previous call.
    ///
    /// The first call measures from manager start. A restart in between
    /// resets the counters, which reads as zero fps for that interval.
    pub fn stats_report(&self) -> StatsReport {
        let now = Instant::now();
        let status = self.camera.snapshot();

        let previous = self.last_report.lock().replace((now, status.stats.clone()));
        let capture_fps = match previous {
            Some((at, stats)) => status
                .stats
                .capture_fps(&stats, now.saturating_duration_since(at).as_secs_f64()),
            None => status
                .stats
                .capture_fps(&StatsSnapshot::default(), status.stats.uptime_secs),
        };
        let drop_rate = status.stats.drop_rate();

        StatsReport {
            status,
            capture_fps,
            drop_rate,
        }
    }

    /// Writes the stats report to the log
    pub fn log_stats(&self) {
        let report = self.stats_report();
        match serde_json::to_string(&report) {
            Ok(json) => info!(
                fps = report.capture_fps,
                drop_rate = report.drop_rate,
                status = %json,
                "Camera statistics"
            ),
            Err(e) => warn!(error = %e, "Failed to serialize statistics"),
        }
    }
}

fn describe(previous: &Config, current: &Config, changed: bool, camera_reopened: bool) -> ConfigChange {
    let server_restart_required = previous.server != current.server;
    if server_restart_required {
        warn!("Server settings changed; restart the process to apply them");
    }

    ConfigChange {
        changed,
        camera_reopened,
        server_restart_required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;
    use crate::config::{CameraConfig, DeviceId};
    use std::time::Duration;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let config = Config {
            camera: CameraConfig {
                device: DeviceId::Path("stub://stats".into()),
                width: 8,
                height: 8,
                fps: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        let camera = CameraManager::new(config.camera.clone(), Box::new(SyntheticBackend::new())).unwrap();
        let store = ConfigStore::with_config(dir.path().join("config.toml"), config);
        AppState::new(Arc::new(camera), Arc::new(store))
    }

    #[test]
    fn test_stats_report_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let report = state.stats_report();
        assert_eq!(report.capture_fps, 0.0);
        assert_eq!(report.drop_rate, 0.0);
        assert_eq!(report.status.stats.frames_captured, 0);
    }

    #[test]
    fn test_stats_report_measures_capture_rate() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        state.camera.start().unwrap();

        state.stats_report();
        std::thread::sleep(Duration::from_millis(300));
        let report = state.stats_report();

        assert!(report.status.stats.frames_captured > 0);
        assert!(report.capture_fps > 0.0);
        // Buffer of 2 at 100 fps with nobody reading
        assert!(report.drop_rate > 0.0);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["capture_fps"].is_number());
        assert_eq!(json["state"], "streaming");

        state.request_shutdown();
        state.camera.join();
    }
}
