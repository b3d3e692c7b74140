// src/logging.rs

//! `tracing` subscriber setup for the binary.
//!
//! The filter comes from, in order:
//! 1. the `--log-level` flag, applied to every target;
//! 2. `FLOTILLA_LOG`, which takes full directives such as
//!    `"info,flotilla::amm=debug"`;
//! 3. `info`.
//!
//! Logs go to stderr; stdout carries task results.

use anyhow::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "FLOTILLA_LOG";

/// Initialise the global logging subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = build_filter(cli_level, std::env::var(LOG_ENV_VAR).ok().as_deref());

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install log subscriber: {err}"))?;

    Ok(())
}

fn build_filter(cli_level: Option<LogLevel>, env_value: Option<&str>) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::default().add_directive(LevelFilter::from(level).into());
    }
    env_value
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_beats_environment() {
        let hint = |cli, env| build_filter(cli, env).max_level_hint();
        assert_eq!(hint(Some(LogLevel::Debug), Some("error")), Some(LevelFilter::DEBUG));
        assert_eq!(hint(None, Some(" warn ")), Some(LevelFilter::WARN));
        assert_eq!(hint(None, Some("warn,flotilla::amm=trace")), Some(LevelFilter::TRACE));
        assert_eq!(hint(None, Some("")), Some(LevelFilter::INFO));
        assert_eq!(hint(None, None), Some(LevelFilter::INFO));
    }
}
