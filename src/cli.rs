// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `flotilla`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "flotilla",
    version,
    about = "Run a task graph on an in-process cluster of workers.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Flotilla.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Flotilla.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLOTILLA_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the graph and workers, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Gracefully retire this worker once every task has been submitted.
    #[arg(long, value_name = "WORKER")]
    pub retire: Option<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_flags() {
        let args = CliArgs::parse_from(["flotilla"]);
        assert_eq!(args.config, "Flotilla.toml");
        assert!(!args.dry_run);
        assert!(args.retire.is_none());

        let args = CliArgs::parse_from([
            "flotilla",
            "--config",
            "x.toml",
            "--log-level",
            "debug",
            "--retire",
            "beta",
        ]);
        assert_eq!(args.config, "x.toml");
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert_eq!(args.retire.as_deref(), Some("beta"));
    }
}
