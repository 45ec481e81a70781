//! USB camera MJPEG streaming server

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use usb_mjpeg_streamer::{backend_for, logging, signals, web, AppState, CameraManager, ConfigStore};

#[derive(Parser, Debug)]
#[command(name = "mjpeg-streamer")]
#[command(about = "Resilient USB camera MJPEG-over-HTTP streaming server")]
#[command(version)]
struct Cli {
    /// Path to configuration file (created with defaults when missing)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the configured bind address
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = Arc::new(ConfigStore::open(&cli.config));
    let config = store.current();

    let mut server = config.server.clone();
    if let Some(host) = cli.host {
        server.host = host;
    }
    if let Some(port) = cli.port {
        server.port = port;
    }

    let level = server.tracing_level().unwrap_or("info");
    let _log_guard = logging::init(level, server.log_file.as_deref(), cli.verbose)?;

    info!("MJPEG streamer starting");
    info!(
        config_path = %store.path().display(),
        device = %config.camera.device,
        resolution = %format!("{}x{}", config.camera.width, config.camera.height),
        fps = config.camera.fps,
        "Configuration loaded"
    );

    let camera = Arc::new(CameraManager::new(
        config.camera.clone(),
        backend_for(&config.camera),
    )?);
    camera.start()?;

    let state = Arc::new(AppState::new(Arc::clone(&camera), store));
    let signal_task = signals::spawn(Arc::clone(&state));

    let served = web::serve(Arc::clone(&state), &server).await;
    if let Err(e) = &served {
        error!(error = %e, "Web server failed");
    }

    // Covers the server exiting on its own as well as a requested shutdown
    state.request_shutdown();
    signal_task.abort();

    let join = tokio::task::spawn_blocking(move || camera.join());
    if let Err(e) = join.await {
        error!(error = %e, "Failed to join capture thread");
    }

    info!("Shutdown complete");
    served
}
