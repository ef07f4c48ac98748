//! systemd state notifications (`sd_notify` protocol).
//!
//! Each notification is a single datagram carrying `KEY=VALUE` text, sent to the Unix
//! socket named by `NOTIFY_SOCKET`. Delivery is best-effort: failures are logged and
//! never reach the caller.
use std::{
    ffi::{OsStr, OsString},
    fmt, io,
    os::unix::{ffi::OsStrExt, net::UnixDatagram},
    path::Path,
    str::FromStr,
};

use tracing::{debug, warn};

use crate::constants::{ABSTRACT_SOCKET_PREFIX, NOTIFY_SOCKET_ENV};

/// A service state change understood by the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyState {
    /// Service startup is finished.
    Ready,
    /// Service is beginning its shutdown.
    Stopping,
    /// Update the watchdog timestamp.
    Watchdog,
    /// Free-form status line.
    Status(String),
    /// Service failure as an errno-style code.
    Errno(i32),
    /// Service failure as a D-Bus error name.
    BusError(String),
    /// Main PID of the service, when the manager did not fork it itself.
    MainPid(u32),
    /// Any other assignment, sent verbatim.
    Custom(String),
}

impl NotifyState {
    /// Datagram payload for this state.
    pub fn payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyState::Ready => write!(f, "READY=1"),
            NotifyState::Stopping => write!(f, "STOPPING=1"),
            NotifyState::Watchdog => write!(f, "WATCHDOG=1"),
            NotifyState::Status(text) => write!(f, "STATUS={text}"),
            NotifyState::Errno(code) => write!(f, "ERRNO={code}"),
            NotifyState::BusError(text) => write!(f, "BUSERROR={text}"),
            NotifyState::MainPid(pid) => write!(f, "MAINPID={pid}"),
            NotifyState::Custom(raw) => write!(f, "{raw}"),
        }
    }
}

impl FromStr for NotifyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("notification state cannot be empty".into());
        }

        let state = match s.split_once('=') {
            Some(("READY", "1")) => NotifyState::Ready,
            Some(("STOPPING", "1")) => NotifyState::Stopping,
            Some(("WATCHDOG", "1")) => NotifyState::Watchdog,
            Some(("STATUS", text)) => NotifyState::Status(text.to_string()),
            Some(("BUSERROR", text)) => NotifyState::BusError(text.to_string()),
            Some(("ERRNO", code)) => code
                .parse()
                .map(NotifyState::Errno)
                .map_err(|_| format!("invalid ERRNO value '{code}'"))?,
            Some(("MAINPID", pid)) => pid
                .parse()
                .map(NotifyState::MainPid)
                .map_err(|_| format!("invalid MAINPID value '{pid}'"))?,
            _ => NotifyState::Custom(s.to_string()),
        };

        Ok(state)
    }
}

/// Sends [`NotifyState`] datagrams to the service manager.
#[derive(Debug, Clone, Default)]
pub struct SystemdNotifier {
    socket_path: Option<Vec<u8>>,
}

impl SystemdNotifier {
    /// Resolves the socket from `NOTIFY_SOCKET`. Disabled when unset or empty.
    pub fn from_env() -> Self {
        Self::with_socket_path(std::env::var_os(NOTIFY_SOCKET_ENV))
    }

    /// Resolves an explicit socket path; a leading `@` selects the abstract namespace.
    pub fn with_socket_path(raw: Option<OsString>) -> Self {
        let socket_path = raw.filter(|value| !value.is_empty()).map(|value| {
            let mut bytes = value.as_bytes().to_vec();
            if bytes[0] == ABSTRACT_SOCKET_PREFIX {
                bytes[0] = 0;
            }
            bytes
        });

        Self { socket_path }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket_path.is_some()
    }

    /// The resolved path; abstract sockets start with a NUL byte.
    pub fn socket_path(&self) -> Option<&[u8]> {
        self.socket_path.as_deref()
    }

    /// Sends `state`, logging instead of failing.
    pub fn notify(&self, state: &NotifyState) {
        if !self.is_enabled() {
            return;
        }

        match self.try_notify(state) {
            Ok(()) => debug!("Notified service manager: {state}"),
            Err(err) => warn!("Failed to notify service manager ({state}): {err}"),
        }
    }

    /// Sends `state` and reports delivery errors. A disabled notifier succeeds without
    /// doing any I/O.
    pub fn try_notify(&self, state: &NotifyState) -> io::Result<()> {
        let Some(path) = self.socket_path.as_deref() else {
            return Ok(());
        };

        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        connect(&socket, path)?;
        socket.send(&state.payload())?;
        Ok(())
    }
}

fn connect(socket: &UnixDatagram, path: &[u8]) -> io::Result<()> {
    match path.strip_prefix(b"\0") {
        Some(name) => connect_abstract(socket, name),
        None => socket.connect(Path::new(OsStr::from_bytes(path))),
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(socket: &UnixDatagram, name: &[u8]) -> io::Result<()> {
    use std::os::{linux::net::SocketAddrExt, unix::net::SocketAddr};

    let addr = SocketAddr::from_abstract_name(name)?;
    socket.connect_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_socket: &UnixDatagram, _name: &[u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract socket addresses are only available on Linux",
    ))
}
