//! Tracing subscriber setup for binaries.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV_VAR: &str = "TROUPE_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Builds the filter: `TROUPE_LOG`, else the configured level, else `warn`.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directive = std::env::var(LOG_ENV_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| config.level.clone())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());
    EnvFilter::try_new(&directive).with_context(|| format!("invalid log filter '{directive}'"))
}

/// Installs the global subscriber.
///
/// Logs go to a daily rolling file when `config.dir` is set (keep the
/// returned guard alive until exit so buffered lines are flushed), otherwise
/// to stderr. Stdout stays reserved for conversation output.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;
    match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "troupe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_is_used() {
        let config = LoggingConfig {
            level: Some("troupe_core=debug".into()),
            dir: None,
        };
        // TROUPE_LOG is not set in the test environment.
        if std::env::var(LOG_ENV_VAR).is_err() {
            let filter = build_filter(&config).unwrap();
            assert!(filter.to_string().contains("troupe_core=debug"));
        }
    }

    #[test]
    fn test_invalid_level_errors() {
        let config = LoggingConfig {
            level: Some("troupe=verbose".into()),
            dir: None,
        };
        if std::env::var(LOG_ENV_VAR).is_err() {
            assert!(build_filter(&config).is_err());
        }
    }
}
