//! Error handling for daemonhost.
use std::path::PathBuf;

use thiserror::Error;

/// Defines the errors that can surface from configuring or running a host.
#[derive(Debug, Error)]
pub enum HostError {
    /// The platform could not be identified.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Error loading host settings.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The hosted service failed a start or stop request.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Error registering or tearing down the termination-signal watcher.
    #[error("Failed to manage termination signals: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// Error spawning the signal watcher thread or touching the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A service wrapper was detected but no external host was registered for it.
    #[error("Running under '{wrapper}' requires a service-control-manager host")]
    NoServiceWrapperHost {
        /// The wrapper executable found in argv[0].
        wrapper: String,
    },

    /// The requested operation is not available on this environment.
    #[error("Operation not supported on this host environment: {0}")]
    Unsupported(&'static str),
}

/// Error type for platform detection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// `uname` did not report a kernel name.
    #[error("Unknown platform: kernel name is empty")]
    Unsupported,
}

/// Error type reported by a hosted service's start or stop callback.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The start callback reported failure.
    #[error("The service failed to start (returned false).")]
    StartDeclined,

    /// The stop callback reported failure.
    #[error("The service failed to stop (returned false).")]
    StopDeclined,

    /// The callback panicked.
    #[error("The service panicked: {0}")]
    Panicked(String),

    /// Error raised by the hosted service itself.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ServiceError {
    /// Wraps an arbitrary error produced by the hosted service.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ServiceError::Other(err.into())
    }
}

/// Error type for host settings files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the settings file.
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML settings.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A duration value could not be parsed.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),

    /// An unknown unhandled-fault policy name.
    #[error("Unknown unhandled fault policy: '{0}'")]
    InvalidPolicy(String),
}
