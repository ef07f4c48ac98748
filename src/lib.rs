//! Daemonhost runs a single service in the foreground on Linux and other Unix-like
//! systems. It starts the service, waits for a termination signal, console interrupt,
//! unhandled fault or explicit stop request, and stops it exactly once, reporting the
//! lifecycle to systemd when running as a unit.

/// CLI interface.
pub mod cli;

/// Recovery of the real program's command line under service wrappers.
pub mod command_line;

/// Host settings.
pub mod config;

/// Shared constants.
pub mod constants;

/// Host selection and the POSIX host environment.
pub mod environment;

/// Error handling.
pub mod error;

/// Fault reporting and the unhandled-fault policy.
pub mod fault;

/// The POSIX run host.
pub mod host;

/// Logging setup and teardown.
pub mod logs;

/// systemd state notifications.
pub mod notify;

/// Platform detection.
pub mod platform;

/// Ready-made hosted services.
pub mod service;

/// Termination signals and wait signals.
pub mod signals;

/// Lifecycle states and exit codes.
pub mod state;

#[cfg(test)]
pub(crate) mod test_utils;
