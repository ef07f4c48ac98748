//! Command-line interface for daemonhost.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::notify::NotifyState;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for daemonhost.
#[derive(Parser)]
#[command(name = "dhost", version, author)]
#[command(about = "Runs a command as a service with systemd-aware lifecycle handling", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for dhost.
#[derive(Subcommand)]
pub enum Commands {
    /// Host a command as the service until a termination signal arrives or it exits.
    Run {
        /// Path to a YAML host settings file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Service name used in logs (defaults to the program name).
        #[arg(short = 'n', long)]
        service_name: Option<String>,

        /// How long a trigger waits for the service to stop (e.g., "500ms", "30s", "2m").
        #[arg(long, value_name = "DURATION")]
        stop_timeout: Option<String>,

        /// Keep waiting instead of exiting when the stop timeout elapses.
        #[arg(long)]
        no_force_exit: bool,

        /// Command and arguments to host.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Print detected platform facts and the normalized command line.
    Probe,

    /// Send one state notification to the service manager, e.g. `READY=1`.
    Notify {
        /// State assignment to send.
        state: NotifyState,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
