//! Logging initialization: env-filtered console output, or a rolling file
//! writer when `log.path` is configured.

use std::path::Path;

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use arado_config::LogSettings;

const SECONDS_PER_DAY: u64 = 86_400;

/// Keeps the non-blocking file writer alive for the process lifetime.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_telemetry(settings: &LogSettings) -> anyhow::Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let Some(path) = &settings.path else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(TelemetryGuard { _file: None });
    };

    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "arado.log".to_string());
    let rotation = if settings.rotation_time < SECONDS_PER_DAY {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    };

    let appender = RollingFileAppender::new(rotation, directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();

    if settings.max_size.is_some() {
        warn!("log.max_size is ignored: the rolling writer rotates by time only");
    }

    Ok(TelemetryGuard {
        _file: Some(guard),
    })
}
