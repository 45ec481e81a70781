//! HTTP handlers

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

use super::mjpeg;
use crate::app_state::{AppState, ConfigChange, ControlError};
use crate::config::{Config, ConfigError};
use crate::error::{FrameError, ManagerError};
use crate::manager::{ManagerState, Status};

/// Error response rendered as `{ "detail": ... }`
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    detail: String,
}

impl AppError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, detail)
    }
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        let status = match &err {
            ControlError::Config(ConfigError::Parse(_))
            | ControlError::Config(ConfigError::Patch(_))
            | ControlError::Config(ConfigError::Invalid(_))
            | ControlError::Camera(ManagerError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
            ControlError::Camera(ManagerError::ShutDown) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>USB Camera Stream</title>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body { font-family: sans-serif; margin: 0; padding: 20px; background: #f0f0f0; text-align: center; }
        .container { max-width: 1000px; margin: 0 auto; background: white; padding: 20px; border-radius: 10px; }
        img { max-width: 100%; border-radius: 5px; background: #000; }
        pre { text-align: left; background: #f5f5f5; padding: 10px; border-radius: 5px; }
        button { margin: 5px; padding: 8px 16px; }
    </style>
</head>
<body>
    <div class="container">
        <h1>USB Camera Stream</h1>
        <img src="/video_feed" alt="live stream">
        <div>
            <button onclick="post('/camera/restart')">Restart camera</button>
            <button onclick="post('/server/reload-config')">Reload config</button>
        </div>
        <pre id="status">loading...</pre>
    </div>
    <script>
        async function refresh() {
            try {
                const res = await fetch('/status');
                document.getElementById('status').textContent = JSON.stringify(await res.json(), null, 2);
            } catch (e) {
                document.getElementById('status').textContent = 'status unavailable';
            }
        }
        async function post(path) {
            await fetch(path, { method: 'POST' });
            refresh();
        }
        refresh();
        setInterval(refresh, 2000);
    </script>
</body>
</html>"#;

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn video_feed(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    if state.is_shutting_down() || state.camera.state() == ManagerState::ShuttingDown {
        return Err(AppError::unavailable("Camera service not running"));
    }

    let poll = state.config.current().server.stream_poll_interval();
    info!("MJPEG client connected");
    Ok(mjpeg::stream_response(state, poll))
}

pub async fn snapshot(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let frame = state.camera.latest_frame().map_err(|e| match e {
        FrameError::BufferEmpty => AppError::unavailable("No frame available yet"),
        FrameError::StaleFrame { .. } => AppError::unavailable(e.to_string()),
    })?;

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))],
        frame.data,
    )
        .into_response())
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    Json(state.camera.snapshot())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    state: ManagerState,
    last_frame_age_secs: Option<f64>,
    /// Unix seconds
    timestamp: f64,
}

/// Always 200; the body carries the verdict
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let healthy = state.camera.is_healthy();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        state: state.camera.state(),
        last_frame_age_secs: state.camera.last_frame_age().map(|age| age.as_secs_f64()),
        timestamp,
    })
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    change: Option<ConfigChange>,
}

pub async fn restart_camera(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActionResponse>, AppError> {
    info!("API camera restart requested");
    state.restart_camera().map_err(|e| {
        error!(error = %e, "Camera restart failed");
        AppError::from(e)
    })?;

    Ok(Json(ActionResponse {
        success: true,
        message: "Camera restart requested".to_string(),
        change: None,
    }))
}

pub async fn reload_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActionResponse>, AppError> {
    info!("Configuration reload requested");
    let change = state.reload_config().map_err(|e| {
        error!(error = %e, "Configuration reload failed");
        match e {
            // The file on disk is broken, not the request
            ControlError::Config(_) => AppError::internal(format!("Configuration reload failed: {}", e)),
            other => AppError::from(other),
        }
    })?;

    Ok(Json(ActionResponse {
        success: true,
        message: "Configuration reloaded".to_string(),
        change: Some(change),
    }))
}

pub async fn shutdown(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    info!("Graceful shutdown requested via API");
    state.request_shutdown();
    Json(json!({ "message": "Graceful shutdown initiated" }))
}

pub async fn process_info() -> Json<serde_json::Value> {
    let signals = if cfg!(unix) {
        json!({
            "SIGINT": "Graceful shutdown (Ctrl+C)",
            "SIGTERM": "Graceful shutdown (kill)",
            "SIGHUP": "Reload configuration (kill -HUP)",
            "SIGUSR1": "Log statistics (kill -USR1)",
            "SIGUSR2": "Restart camera (kill -USR2)",
        })
    } else {
        json!({ "SIGINT": "Graceful shutdown (Ctrl+C)" })
    };

    Json(json!({ "pid": std::process::id(), "signals": signals }))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json(state.config.current())
}

#[derive(Debug, Serialize)]
pub struct ConfigUpdateResponse {
    success: bool,
    message: String,
    config: Config,
    change: ConfigChange,
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<ConfigUpdateResponse>, AppError> {
    let (config, change) = state.update_config(&patch).map_err(|e| {
        error!(error = %e, "Configuration update failed");
        AppError::from(e)
    })?;

    info!(camera_reopened = change.camera_reopened, "Configuration updated via API");
    Ok(Json(ConfigUpdateResponse {
        success: true,
        message: "Configuration updated".to_string(),
        config,
        change,
    }))
}
