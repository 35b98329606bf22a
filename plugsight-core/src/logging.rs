//! Logging setup
//!
//! plugsight-core is a library, so it never installs a subscriber on its
//! own; the embedding process opts in through one of the presets here.
//! Component logs flow through `tracing` with the engine operation attached
//! as a span, so one search or ingest can be followed across the indexer,
//! store, and cache.

use crate::config::{Config, LoggingConfig};
use crate::error::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Name of the rolled log file inside the state directory.
const LOG_FILE: &str = "plugsight.log";

/// Keeps the background log writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Preset for long-running embeddings: daily-rolled files under the XDG
/// state directory, ANSI off.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let dir = Config::state_dir();
    std::fs::create_dir_all(&dir)?;

    let (writer, worker) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE));
    tracing_subscriber::registry()
        .with(filter(&config.level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!(
        log_file = %dir.join(LOG_FILE).display(),
        level = %config.level,
        "File logging ready"
    );
    Ok(LoggingGuard { _worker: worker })
}

/// Preset for tests and one-off tooling: stderr, best-effort (repeat calls
/// are no-ops instead of panics).
pub fn init_stderr(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` wins outright; otherwise other crates are quieted to `warn`
/// while plugsight's own targets run at the configured level.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,plugsight_core={}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_stderr_is_reentrant() {
        init_stderr("debug");
        init_stderr("info");
    }
}
