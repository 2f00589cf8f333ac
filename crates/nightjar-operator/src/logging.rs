//! Logging initialization.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const MAX_LOG_FILES: usize = 6;

/// Sets up `tracing` for the process.
///
/// The filter is read from `env_var` (`NIGHTJAR_OPERATOR_LOG`); an unset or
/// unparsable variable falls back to INFO. Setting `{env_var}_DIRECTORY`
/// additionally mirrors all output into hourly-rotated JSON files in that
/// directory, for clusters that ship logs from disk.
pub fn initialize_logging(env_var: &str, app_name: &str) {
    let filter = EnvFilter::try_from_env(env_var).unwrap_or_else(|_| EnvFilter::new("info"));

    let json_dir = std::env::var(format!("{env_var}_DIRECTORY")).ok();
    let json_layer = json_dir.as_ref().map(|dir| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(rolling_writer(dir.as_ref(), app_name))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(json_layer)
        .init();

    if let Some(dir) = json_dir {
        tracing::info!(directory = %dir, "mirroring logs into rotated json files");
    }
}

fn rolling_writer(directory: &Path, app_name: &str) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(app_name)
        .filename_suffix("log.json")
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
        .expect("log directory must exist and be writable")
}
