//! Host selection and the POSIX host environment.
//!
//! A process launched through a service wrapper must be driven by the wrapper's
//! service-control-manager host; anything else runs on [`PosixRunHost`]. The choice is
//! made once, when the host is built.
use std::time::Duration;

use tracing::debug;

use crate::{
    command_line,
    config::HostSettings,
    error::HostError,
    host::{HostControl, PosixRunHost, ServiceHandle},
    notify::SystemdNotifier,
    platform::{self, PlatformFacts},
    state::ExitCode,
};

/// Operations every host exposes regardless of how it drives the service.
pub trait HostRunner: Send {
    /// Runs the service to completion.
    fn run(self: Box<Self>) -> ExitCode;

    fn request_additional_time(&self, time_remaining: Duration);

    /// Asks the host to stop, optionally with a specific exit code.
    fn stop(&self, exit_code: Option<ExitCode>);
}

impl HostRunner for PosixRunHost {
    fn run(self: Box<Self>) -> ExitCode {
        PosixRunHost::run(*self)
    }

    fn request_additional_time(&self, time_remaining: Duration) {
        self.control().request_additional_time(time_remaining);
    }

    fn stop(&self, exit_code: Option<ExitCode>) {
        let control = self.control();
        match exit_code {
            Some(exit_code) => control.stop_with(exit_code),
            None => control.stop(),
        }
    }
}

/// The host chosen for this process.
pub enum Host {
    Posix(PosixRunHost),
    ServiceWrapper(Box<dyn HostRunner>),
}

impl Host {
    pub fn run(self) -> ExitCode {
        match self {
            Host::Posix(host) => host.run(),
            Host::ServiceWrapper(host) => host.run(),
        }
    }

    pub fn request_additional_time(&self, time_remaining: Duration) {
        match self {
            Host::Posix(host) => HostRunner::request_additional_time(host, time_remaining),
            Host::ServiceWrapper(host) => host.request_additional_time(time_remaining),
        }
    }

    pub fn stop(&self, exit_code: Option<ExitCode>) {
        match self {
            Host::Posix(host) => HostRunner::stop(host, exit_code),
            Host::ServiceWrapper(host) => host.stop(exit_code),
        }
    }

    /// Control handle when the POSIX host was selected.
    pub fn posix_control(&self) -> Option<HostControl> {
        match self {
            Host::Posix(host) => Some(host.control()),
            Host::ServiceWrapper(_) => None,
        }
    }
}

/// Builds the host for a service wrapper's service-control manager.
pub type WrapperHostFactory =
    Box<dyn FnOnce(HostSettings, Box<dyn ServiceHandle>) -> Box<dyn HostRunner>>;

/// Picks the host for `facts`.
pub fn select_host(
    facts: &PlatformFacts,
    settings: HostSettings,
    service: Box<dyn ServiceHandle>,
    wrapper_host: Option<WrapperHostFactory>,
    notifier: SystemdNotifier,
) -> Result<Host, HostError> {
    if facts.is_under_service_wrapper() {
        let Some(factory) = wrapper_host else {
            let wrapper = std::env::args()
                .next()
                .and_then(|arg| platform::service_wrapper_name(&arg))
                .unwrap_or("service wrapper");
            return Err(HostError::NoServiceWrapperHost {
                wrapper: wrapper.to_string(),
            });
        };

        debug!("Running the {} service under a service wrapper", settings.service_name);
        return Ok(Host::ServiceWrapper(factory(settings, service)));
    }

    debug!("Running the {} service as a posix process", settings.service_name);
    Ok(Host::Posix(PosixRunHost::with_platform(settings, service, facts, notifier)))
}

/// Assembles a [`Host`] from settings and a service.
pub struct HostBuilder {
    settings: HostSettings,
    service: Box<dyn ServiceHandle>,
    wrapper_host: Option<WrapperHostFactory>,
    command_line: Option<String>,
}

impl HostBuilder {
    pub fn new(settings: HostSettings, service: impl ServiceHandle + 'static) -> Self {
        Self {
            settings,
            service: Box::new(service),
            wrapper_host: None,
            command_line: None,
        }
    }

    /// Registers the host used when a service wrapper launched the process.
    pub fn with_service_wrapper_host<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(HostSettings, Box<dyn ServiceHandle>) -> Box<dyn HostRunner> + 'static,
    {
        self.wrapper_host = Some(Box::new(factory));
        self
    }

    /// On Linux, replaces the command line with the one the real program was given,
    /// stripping any service-wrapper prefix. The built host exposes it through
    /// [`HostControl::command_line`](crate::host::HostControl::command_line).
    pub fn use_linux_if_available(mut self) -> Result<Self, HostError> {
        if platform::current()?.is_linux() {
            self.command_line = Some(command_line::unparsed_command_line());
        }
        Ok(self)
    }

    /// Command line applied by [`HostBuilder::use_linux_if_available`].
    pub fn command_line(&self) -> Option<&str> {
        self.command_line.as_deref()
    }

    pub fn build(self) -> Result<Host, HostError> {
        let facts = platform::current()?;
        self.build_with(facts, SystemdNotifier::from_env())
    }

    /// Builds against explicit platform facts and notifier.
    pub fn build_with(
        mut self,
        facts: &PlatformFacts,
        notifier: SystemdNotifier,
    ) -> Result<Host, HostError> {
        if let Some(command_line) = self.command_line {
            self.settings.command_line = Some(command_line);
        }
        select_host(
            facts,
            self.settings,
            self.service,
            self.wrapper_host,
            notifier,
        )
    }
}

/// What the POSIX environment can tell about, and do for, a service.
///
/// Installation and service-manager control are not available; such requests return
/// [`HostError::Unsupported`].
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    facts: PlatformFacts,
    command_line: String,
}

impl HostEnvironment {
    pub fn detect() -> Result<Self, HostError> {
        Ok(Self::new(
            *platform::current()?,
            command_line::unparsed_command_line(),
        ))
    }

    pub fn new(facts: PlatformFacts, command_line: String) -> Self {
        Self {
            facts,
            command_line,
        }
    }

    pub fn facts(&self) -> &PlatformFacts {
        &self.facts
    }

    /// The command line as seen by the real program.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn is_administrator(&self) -> bool {
        self.facts.is_root()
    }

    pub fn is_running_as_a_service(&self) -> bool {
        false
    }

    /// Always false, which lets an installed service still be run from a console.
    pub fn is_service_installed(&self, _service_name: &str) -> bool {
        false
    }

    pub fn create_service_host(
        &self,
        _settings: HostSettings,
        _service: Box<dyn ServiceHandle>,
    ) -> Result<Host, HostError> {
        Err(HostError::Unsupported("creating a service-manager host"))
    }

    pub fn install_service(&self, _settings: &HostSettings) -> Result<(), HostError> {
        Err(HostError::Unsupported("installing services"))
    }

    pub fn uninstall_service(&self, _settings: &HostSettings) -> Result<(), HostError> {
        Err(HostError::Unsupported("uninstalling services"))
    }

    pub fn start_service(&self, _service_name: &str) -> Result<(), HostError> {
        Err(HostError::Unsupported("starting installed services"))
    }

    pub fn stop_service(&self, _service_name: &str) -> Result<(), HostError> {
        Err(HostError::Unsupported("stopping installed services"))
    }
}
