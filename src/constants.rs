//! Constants shared by the host runtime.
//!
//! Environment variable names, wrapper executable names, and timing defaults live here
//! so the probe, the notifier, and the runner agree on them.

use std::time::Duration;

// ============================================================================
// systemd Environment
// ============================================================================

/// Datagram socket the service manager listens on for state notifications.
/// Units with `Type=notify` receive it.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Set by systemd for every unit invocation.
pub const INVOCATION_ID_ENV: &str = "INVOCATION_ID";

/// PID of the service manager that spawned us (set by `systemd --user` and friends).
pub const MANAGER_PID_ENV: &str = "MANAGERPID";

/// Command name reported by `/proc/<pid>/comm` for the service manager,
/// including the trailing newline the kernel appends.
pub const SYSTEMD_COMM: &str = "systemd\n";

/// Prefix marking an abstract-namespace socket in `NOTIFY_SOCKET`.
pub const ABSTRACT_SOCKET_PREFIX: u8 = b'@';

// ============================================================================
// Service Wrapper
// ============================================================================

/// Executables known to launch the real program while passing themselves as argv[0].
pub const SERVICE_WRAPPER_NAMES: &[&str] = &["mono-service.exe", "mono-service"];

/// Prefix of the wrapper's own flags, which precede the real executable name.
pub const WRAPPER_FLAG_PREFIX: &str = "-";

// ============================================================================
// Host Defaults
// ============================================================================

/// How long a graceful stop may take before shutdown is declared failed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(150);

/// Name given to the thread that receives termination signals.
pub const SIGNAL_WATCHER_THREAD: &str = "signal-watcher";

/// Polling interval used by the command service while waiting on its child.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);
