//! Lifecycle states, exit codes and termination triggers.
use std::{
    fmt,
    sync::atomic::{AtomicI32, AtomicU8, Ordering},
};

use nix::sys::signal::Signal;

/// Lifecycle of the hosted service. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServiceState {
    NotStarted = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ServiceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// [`ServiceState`] cell shared between the hosting thread and trigger threads.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ServiceState::NotStarted as u8))
    }

    pub(crate) fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves to `next` unless the current state is already at or past it.
    pub(crate) fn advance(&self, next: ServiceState) -> bool {
        self.0.fetch_max(next as u8, Ordering::SeqCst) < next as u8
    }
}

/// Process exit codes returned by the host. The numeric values are a contract with
/// calling scripts and supervisors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    SudoRequired = 2,
    NotRunningOnWindows = 11,
    ServiceAlreadyRunning = 1056,
    ServiceNotRunning = 1062,
    ServiceControlRequestFailed = 1064,
    AbnormalExit = 1067,
    ServiceAlreadyInstalled = 1242,
    ServiceNotInstalled = 1243,
}

impl ExitCode {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            Self::Ok,
            Self::SudoRequired,
            Self::NotRunningOnWindows,
            Self::ServiceAlreadyRunning,
            Self::ServiceNotRunning,
            Self::ServiceControlRequestFailed,
            Self::AbnormalExit,
            Self::ServiceAlreadyInstalled,
            Self::ServiceNotInstalled,
        ]
        .into_iter()
        .find(|exit| exit.code() == code)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// [`ExitCode`] cell written by trigger threads and read once by the hosting thread.
#[derive(Debug)]
pub(crate) struct ExitCodeCell(AtomicI32);

impl ExitCodeCell {
    pub(crate) fn new() -> Self {
        Self(AtomicI32::new(ExitCode::Ok.code()))
    }

    pub(crate) fn set(&self, exit_code: ExitCode) {
        self.0.store(exit_code.code(), Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> ExitCode {
        ExitCode::from_code(self.0.load(Ordering::SeqCst)).unwrap_or(ExitCode::AbnormalExit)
    }
}

/// Console interrupt keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleKey {
    /// Ctrl-C.
    CtrlC,
    /// Ctrl-Break; delivered as `SIGQUIT` (Ctrl-\) on POSIX terminals.
    CtrlBreak,
}

impl ConsoleKey {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::CtrlC => "C",
            Self::CtrlBreak => "Break",
        }
    }
}

/// Everything that can ask the host to shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationTrigger {
    Signal(Signal),
    ConsoleInterrupt(ConsoleKey),
    UnhandledFault,
    ExplicitStop(Option<ExitCode>),
}

impl TerminationTrigger {
    /// Exit code the trigger imposes on the run, if any.
    pub fn exit_code(&self) -> Option<ExitCode> {
        match self {
            Self::UnhandledFault => Some(ExitCode::AbnormalExit),
            Self::ExplicitStop(code) => *code,
            Self::Signal(_) | Self::ConsoleInterrupt(_) => None,
        }
    }
}

impl fmt::Display for TerminationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::ConsoleInterrupt(key) => write!(f, "Control+{}", key.label()),
            Self::UnhandledFault => write!(f, "unhandled fault"),
            Self::ExplicitStop(Some(code)) => write!(f, "stop request with exit code {code}"),
            Self::ExplicitStop(None) => write!(f, "stop request"),
        }
    }
}
