//! Process signal wiring
//!
//! Signals only call into [`AppState`]; nothing in the capture engine
//! depends on them.

use std::sync::Arc;
use tracing::{error, info};

use crate::app_state::AppState;

/// What a received signal asks the service to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    ReloadConfig,
    LogStats,
    RestartCamera,
}

/// Applies `action`; returns true when the handler loop should exit
pub fn dispatch(state: &AppState, action: SignalAction) -> bool {
    match action {
        SignalAction::Shutdown => {
            state.request_shutdown();
            return true;
        }
        SignalAction::ReloadConfig => match state.reload_config() {
            Ok(change) => info!(
                changed = change.changed,
                camera_reopened = change.camera_reopened,
                "Configuration reloaded"
            ),
            Err(e) => error!(error = %e, "Configuration reload failed"),
        },
        SignalAction::LogStats => state.log_stats(),
        SignalAction::RestartCamera => {
            if let Err(e) = state.restart_camera() {
                error!(error = %e, "Camera restart failed");
            }
        }
    }
    false
}

/// Spawns the signal listener task
pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listen(state).await {
            error!(error = %e, "Signal handling failed");
        }
    })
}

#[cfg(unix)]
async fn listen(state: Arc<AppState>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut stopping = state.shutdown_signal();

    info!("Signal handlers installed (INT/TERM shutdown, HUP reload, USR1 stats, USR2 restart)");

    loop {
        let action = tokio::select! {
            _ = interrupt.recv() => {
                info!(signal = "SIGINT", "Received signal");
                SignalAction::Shutdown
            }
            _ = terminate.recv() => {
                info!(signal = "SIGTERM", "Received signal");
                SignalAction::Shutdown
            }
            _ = hangup.recv() => {
                info!(signal = "SIGHUP", "Received signal");
                SignalAction::ReloadConfig
            }
            _ = usr1.recv() => SignalAction::LogStats,
            _ = usr2.recv() => {
                info!(signal = "SIGUSR2", "Received signal");
                SignalAction::RestartCamera
            }
            // Shut down through another path (HTTP); nothing left to listen for
            _ = stopping.wait_for(|stopping| *stopping) => return Ok(()),
        };

        if dispatch(&state, action) {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn listen(state: Arc<AppState>) -> std::io::Result<()> {
    let mut stopping = state.shutdown_signal();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!(signal = "Ctrl+C", "Received signal");
            dispatch(&state, SignalAction::Shutdown);
        }
        _ = stopping.wait_for(|stopping| *stopping) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;
    use crate::config::{Config, ConfigStore};
    use crate::manager::CameraManager;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let config = Config::default();
        let camera = CameraManager::new(config.camera.clone(), Box::new(SyntheticBackend::new())).unwrap();
        let store = ConfigStore::with_config(dir.path().join("config.toml"), config);
        AppState::new(Arc::new(camera), Arc::new(store))
    }

    #[test]
    fn test_only_shutdown_ends_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        assert!(!dispatch(&state, SignalAction::LogStats));
        assert!(!dispatch(&state, SignalAction::RestartCamera));
        assert!(!state.is_shutting_down());

        assert!(dispatch(&state, SignalAction::Shutdown));
        assert!(state.is_shutting_down());
    }

    #[test]
    fn test_reload_failure_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        std::fs::write(dir.path().join("config.toml"), "camera = 3").unwrap();

        assert!(!dispatch(&state, SignalAction::ReloadConfig));
        assert_eq!(state.config.current(), Config::default());
    }
}
