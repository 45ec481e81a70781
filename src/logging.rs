//! Tracing subscriber setup

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs console logging plus an optional log file.
///
/// `RUST_LOG` overrides `level`; `verbose` forces debug. Keep the returned
/// guard alive for as long as the file should receive output.
pub fn init(
    level: &str,
    log_file: Option<&str>,
    verbose: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let directive = if verbose { "debug" } else { level };
    let filter = || {
        if verbose {
            EnvFilter::new(directive)
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
        }
    };

    let console = fmt::layer().with_target(false).with_filter(filter());

    let (file, guard) = match log_file {
        Some(path) => {
            let path = Path::new(path);
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log_file has no file name: {}", path.display()))?;

            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()?;

    Ok(guard)
}
