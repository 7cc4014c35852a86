//! Tracing subscriber setup.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

const LOG_FILE_PREFIX: &str = "kiln.log";
const FILTER_ENV: &str = "KILN_LOG";

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub verbose: bool,
    pub json: bool,
    /// Daily-rolling log files are written here when set
    pub log_dir: Option<PathBuf>,
}

/// Keeps the non-blocking file writer flushing. Hold it until exit.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "kiln=debug" } else { "kiln=info" }
}

/// Install the global subscriber: `KILN_LOG` filter, a human or JSON layer
/// on stderr and an optional file layer. A second call is a no-op.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(build_stderr_layer(config.json));

    let mut file_setup_error = None;
    if let Some(dir) = &config.log_dir {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                let (layer, guard) = build_file_layer(dir, config.json);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error = Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }
    layers.push(Box::new(filter));

    if Registry::default().with(layers).try_init().is_err() {
        return TelemetryGuard { _guards: guards };
    }
    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }
    TelemetryGuard { _guards: guards }
}

fn build_stderr_layer(json: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    if json {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
    }
}

fn build_file_layer(
    dir: &Path,
    json: bool,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
    };
    (layer, guard)
}
