//! Platform detection.
//!
//! Facts about the running process (OS family, kernel, privileges, whether a service
//! wrapper or systemd launched us) are probed once and cached for the lifetime of the
//! process. Use [`current`] to read them.
use std::{fs, io, path::Path, sync::OnceLock};

use tracing::debug;

use crate::{
    constants::{
        INVOCATION_ID_ENV, MANAGER_PID_ENV, NOTIFY_SOCKET_ENV, SERVICE_WRAPPER_NAMES,
        SYSTEMD_COMM,
    },
    error::PlatformError,
};

/// Native queries the probe relies on.
///
/// [`SystemProbe`] answers them from the live process; tests substitute their own.
pub trait NativeProbe {
    /// Whether the target OS family is Windows.
    fn is_windows(&self) -> bool;
    /// Kernel name as reported by `uname`.
    fn kernel_name(&self) -> Option<String>;
    /// Effective user id.
    fn effective_uid(&self) -> u32;
    /// PID of the parent process.
    fn parent_pid(&self) -> i32;
    /// Reads an environment variable; `Some` even when the value is empty.
    fn env_var(&self, key: &str) -> Option<String>;
    /// Reads a pseudo-file such as `/proc/<pid>/comm`.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    /// argv[0] of the current process.
    fn first_arg(&self) -> Option<String>;
}

/// Probe backed by libc and the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl NativeProbe for SystemProbe {
    fn is_windows(&self) -> bool {
        cfg!(windows)
    }

    fn kernel_name(&self) -> Option<String> {
        match nix::sys::utsname::uname() {
            Ok(uts) => {
                debug!(
                    "System: {}, {}, {}, {}, {}",
                    uts.sysname().to_string_lossy(),
                    uts.nodename().to_string_lossy(),
                    uts.release().to_string_lossy(),
                    uts.version().to_string_lossy(),
                    uts.machine().to_string_lossy()
                );
                Some(uts.sysname().to_string_lossy().into_owned())
            }
            Err(err) => {
                debug!("uname failed: {err}");
                None
            }
        }
    }

    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn parent_pid(&self) -> i32 {
        nix::unistd::getppid().as_raw()
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn first_arg(&self) -> Option<String> {
        std::env::args_os()
            .next()
            .map(|arg| arg.to_string_lossy().into_owned())
    }
}

/// Kernel family derived from the `uname` sysname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFamily {
    Linux,
    Darwin,
    /// Any other Unix kernel (BSDs, illumos, ...).
    OtherUnix,
}

/// Classifies a kernel name; a missing or empty name means we cannot tell what we run on.
pub fn classify_kernel(kernel_name: Option<&str>) -> Result<KernelFamily, PlatformError> {
    match kernel_name {
        None | Some("") => Err(PlatformError::Unsupported),
        Some("Linux") => Ok(KernelFamily::Linux),
        Some("Darwin") => Ok(KernelFamily::Darwin),
        Some(_) => Ok(KernelFamily::OtherUnix),
    }
}

/// Returns the wrapper name `arg` was launched as, if any.
pub fn service_wrapper_name(arg: &str) -> Option<&'static str> {
    SERVICE_WRAPPER_NAMES
        .iter()
        .copied()
        .find(|wrapper| arg.ends_with(wrapper))
}

/// Immutable snapshot of what the process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformFacts {
    is_windows: bool,
    is_unix: bool,
    is_linux: bool,
    is_macos: bool,
    is_64bit: bool,
    is_under_service_wrapper: bool,
    is_systemd_unit: bool,
    is_root: bool,
}

impl PlatformFacts {
    /// Runs every probe once against `probe`.
    pub fn detect(probe: &impl NativeProbe) -> Result<Self, PlatformError> {
        let mut facts = PlatformFacts {
            is_windows: probe.is_windows(),
            is_64bit: cfg!(target_pointer_width = "64"),
            ..PlatformFacts::default()
        };

        if !facts.is_windows {
            facts.is_unix = true;
            match classify_kernel(probe.kernel_name().as_deref())? {
                KernelFamily::Linux => facts.is_linux = true,
                KernelFamily::Darwin => facts.is_macos = true,
                KernelFamily::OtherUnix => {}
            }
            facts.is_root = probe.effective_uid() == 0;
        }

        facts.is_under_service_wrapper = probe
            .first_arg()
            .is_some_and(|arg| service_wrapper_name(&arg).is_some());
        facts.is_systemd_unit = facts.is_unix && detect_systemd(probe, facts.is_linux);

        Ok(facts)
    }

    /// Builder used to describe a platform without probing, e.g. when a caller already
    /// knows it runs under systemd.
    pub fn with_systemd_unit(mut self, is_systemd_unit: bool) -> Self {
        self.is_systemd_unit = is_systemd_unit;
        self
    }

    /// Marks the snapshot as launched through a service wrapper.
    pub fn with_service_wrapper(mut self, is_under_service_wrapper: bool) -> Self {
        self.is_under_service_wrapper = is_under_service_wrapper;
        self
    }

    pub fn is_windows(&self) -> bool {
        self.is_windows
    }

    pub fn is_unix(&self) -> bool {
        self.is_unix
    }

    pub fn is_linux(&self) -> bool {
        self.is_linux
    }

    pub fn is_macos(&self) -> bool {
        self.is_macos
    }

    pub fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    pub fn is_under_service_wrapper(&self) -> bool {
        self.is_under_service_wrapper
    }

    pub fn is_systemd_unit(&self) -> bool {
        self.is_systemd_unit
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }
}

/// Decides whether systemd is supervising us. Never fails: anything unexpected counts
/// as "not systemd".
fn detect_systemd(probe: &impl NativeProbe, is_linux: bool) -> bool {
    if probe.env_var(INVOCATION_ID_ENV).is_some() {
        return true;
    }

    if probe.env_var(NOTIFY_SOCKET_ENV).is_some() {
        return true;
    }

    if !is_linux {
        return false;
    }

    let ppid = probe.parent_pid();
    let ppid_str = ppid.to_string();
    if ppid != 1 && probe.env_var(MANAGER_PID_ENV).as_deref() != Some(ppid_str.as_str()) {
        return false;
    }

    let comm_path = format!("/proc/{ppid_str}/comm");
    match probe.read_to_string(Path::new(&comm_path)) {
        Ok(comm) => comm == SYSTEMD_COMM,
        Err(err) => {
            debug!("systemd detection failed reading {comm_path}: {err}");
            false
        }
    }
}

static FACTS: OnceLock<Result<PlatformFacts, PlatformError>> = OnceLock::new();

/// Returns the facts for this process, probing on first use.
pub fn current() -> Result<&'static PlatformFacts, PlatformError> {
    FACTS
        .get_or_init(|| PlatformFacts::detect(&SystemProbe))
        .as_ref()
        .map_err(Clone::clone)
}
