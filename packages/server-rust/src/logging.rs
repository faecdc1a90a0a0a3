//! Tracing setup and the receiving end of cluster log relay.
//!
//! The level comes from the `logging_level` tunable unless `PULSEHA_LOG`
//! overrides it. With `log_to_file` set, output is appended to
//! `log_file_location` instead of stderr.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use pulseha_core::messages::LogsPayload;
use pulseha_core::LogLevel;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive that overrides the
/// configured level.
pub const LOG_ENV: &str = "PULSEHA_LOG";

/// Target under which relayed cluster log lines are emitted.
pub const CLUSTER_TARGET: &str = "cluster";

#[must_use]
pub fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init_tracing(level: LogLevel, file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let (writer, ansi) = match file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(true)
        .with_writer(writer);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.with_ansi(ansi).compact().try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

/// Re-emits a line relayed by another member.
pub fn emit_relayed(payload: &LogsPayload) {
    let node = payload.node.as_str();
    let message = payload.message.as_str();
    match payload.level {
        LogLevel::Debug => tracing::debug!(target: CLUSTER_TARGET, node, "{message}"),
        LogLevel::Info => tracing::info!(target: CLUSTER_TARGET, node, "{message}"),
        LogLevel::Warn => tracing::warn!(target: CLUSTER_TARGET, node, "{message}"),
        LogLevel::Error => tracing::error!(target: CLUSTER_TARGET, node, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_follows_configured_level() {
        // Only meaningful when the override is unset, which is the case under cargo test.
        if std::env::var(LOG_ENV).is_err() {
            assert!(filter_for(LogLevel::Warn).to_string().contains("warn"));
        }
    }

    #[test]
    fn relayed_lines_do_not_panic_without_a_subscriber() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            emit_relayed(&LogsPayload {
                node: "node-2".to_string(),
                level,
                message: "promoted".to_string(),
            });
        }
    }
}
