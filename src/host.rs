//! POSIX run host: starts the hosted service, waits for a termination trigger, and
//! stops it exactly once.
//!
//! The hosting thread blocks on `waiter` for the whole lifetime of the service. Every
//! trigger (termination signal, console interrupt, unhandled fault, explicit stop)
//! passes through a first-wins guard and then sets `waiter`; the hosting thread wakes,
//! runs the stop sequence and sets `stopper`. Trigger threads other than the hosting
//! thread wait on `stopper` for at most the configured stop timeout.
use std::{
    env,
    io::{self, IsTerminal},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use crossterm::{ExecutableCommand, terminal::SetTitle};
use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::{
    config::HostSettings,
    error::{HostError, ServiceError},
    fault::{self, Fault, FaultAction, PanicHookGuard},
    logs,
    notify::{NotifyState, SystemdNotifier},
    platform::{self, PlatformFacts},
    signals::{self, SignalWatcher, WaitSignal},
    state::{ConsoleKey, ExitCode, ExitCodeCell, ServiceState, StateCell, TerminationTrigger},
};

/// Signals the watcher waits for. `SIGQUIT` is the terminal's Ctrl-\, treated as
/// Ctrl-Break.
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

/// A service the host can start and stop.
///
/// Both callbacks run on the hosting thread. Returning an error or panicking counts as
/// a failure.
pub trait ServiceHandle: Send {
    fn start(&mut self, control: &HostControl) -> Result<(), ServiceError>;

    fn stop(&mut self, control: &HostControl) -> Result<(), ServiceError>;

    /// Releases resources once the service has stopped.
    fn dispose(&mut self) {}
}

struct Shared {
    settings: HostSettings,
    notifier: SystemdNotifier,
    systemd_unit: bool,
    state: StateCell,
    exit_code: ExitCodeCell,
    stopping: AtomicUsize,
    waiter: WaitSignal,
    stopper: WaitSignal,
    host_thread: OnceLock<ThreadId>,
}

impl Shared {
    fn name(&self) -> &str {
        &self.settings.service_name
    }

    fn on_host_thread(&self) -> bool {
        self.host_thread.get() == Some(&thread::current().id())
    }

    /// First-wins guard shared by every trigger.
    fn try_begin_stop(&self, trigger: &TerminationTrigger) -> bool {
        if self.stopping.fetch_add(1, Ordering::SeqCst) != 0
            || self.state.get() >= ServiceState::Stopping
        {
            warn!(
                "{trigger} received while the {} service is already being stopped, ignoring..",
                self.name()
            );
            return false;
        }

        info!("{trigger} received, attempting to stop the {} service.", self.name());
        if let Some(exit_code) = trigger.exit_code() {
            self.exit_code.set(exit_code);
        }
        true
    }

    /// Wakes the hosting thread and waits for the stop sequence to finish. Returns
    /// whether it finished within the stop timeout.
    fn signal_stop_and_wait(&self) -> bool {
        self.waiter.set();

        if self.on_host_thread() {
            return true;
        }

        if self.stopper.wait_timeout(self.settings.stop_timeout) {
            return true;
        }

        error!(
            "Timed out after {:?} while waiting for the {} service to stop gracefully.",
            self.settings.stop_timeout,
            self.name()
        );
        logs::shutdown();

        if self.settings.force_exit_on_stop_timeout {
            std::process::exit(ExitCode::AbnormalExit.code());
        }
        false
    }

    fn handle_signal(&self, signal: Signal) {
        if signal == Signal::SIGQUIT {
            if !self.handle_console_interrupt(ConsoleKey::CtrlBreak) {
                signals::die_by_default(signal);
            }
            return;
        }

        if self.try_begin_stop(&TerminationTrigger::Signal(signal)) {
            self.signal_stop_and_wait();
        }
    }

    fn handle_console_interrupt(&self, key: ConsoleKey) -> bool {
        if key == ConsoleKey::CtrlBreak && !self.settings.can_handle_ctrl_break {
            error!(
                "Control+Break detected, terminating service (not cleanly, use Control+C to exit cleanly)"
            );
            return false;
        }

        if self.try_begin_stop(&TerminationTrigger::ConsoleInterrupt(key)) {
            self.signal_stop_and_wait();
        }
        true
    }

    fn handle_fault(&self, fault: Fault) {
        self.settings.report_fault(&fault);

        match FaultAction::decide(self.settings.unhandled_fault_policy, &fault) {
            FaultAction::Ignore => {}
            FaultAction::Log => {
                error!("The {} service raised an unhandled fault: {fault}", self.name());
            }
            FaultAction::LogAndStop => {
                error!(
                    "The {} service raised a fatal unhandled fault: {fault}",
                    self.name()
                );
                if self.try_begin_stop(&TerminationTrigger::UnhandledFault) {
                    self.signal_stop_and_wait();
                }
            }
        }
    }
}

/// Handle given to the hosted service for controlling its host.
#[derive(Clone)]
pub struct HostControl {
    shared: Arc<Shared>,
}

impl HostControl {
    /// Accepted for compatibility; the POSIX host does not enforce start or stop
    /// deadlines on the service itself.
    pub fn request_additional_time(&self, time_remaining: Duration) {
        debug!(
            "The {} service requested {:?} of additional time",
            self.shared.name(),
            time_remaining
        );
    }

    /// Asks the host to stop the service. Returns immediately.
    pub fn stop(&self) {
        self.request_stop(TerminationTrigger::ExplicitStop(None));
    }

    /// Asks the host to stop the service and exit with `exit_code`.
    pub fn stop_with(&self, exit_code: ExitCode) {
        self.request_stop(TerminationTrigger::ExplicitStop(Some(exit_code)));
    }

    fn request_stop(&self, trigger: TerminationTrigger) {
        if self.shared.try_begin_stop(&trigger) {
            self.shared.waiter.set();
        }
    }

    /// Hands a fault to the host's unhandled-fault policy.
    pub fn report_fault(&self, fault: Fault) {
        self.shared.handle_fault(fault);
    }

    /// Delivers a console interrupt. Returns `false` when the interrupt is not handled
    /// and the process should be allowed to die.
    pub fn console_interrupt(&self, key: ConsoleKey) -> bool {
        self.shared.handle_console_interrupt(key)
    }

    /// Delivers a termination signal as if the watcher had received it.
    pub fn deliver_signal(&self, signal: Signal) {
        self.shared.handle_signal(signal);
    }

    /// Command line applied when the host was built, if any.
    pub fn command_line(&self) -> Option<&str> {
        self.shared.settings.command_line.as_deref()
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state.get()
    }

    /// Exit code the run will return if nothing else changes it.
    pub fn exit_code(&self) -> ExitCode {
        self.shared.exit_code.get()
    }
}

/// Runs one hosted service with POSIX primitives.
pub struct PosixRunHost {
    shared: Arc<Shared>,
    service: Box<dyn ServiceHandle>,
}

impl PosixRunHost {
    /// Creates a host for `service`, notifying systemd when the process is a unit.
    pub fn new(settings: HostSettings, service: impl ServiceHandle + 'static) -> Self {
        let systemd_unit = match platform::current() {
            Ok(facts) => facts.is_systemd_unit(),
            Err(err) => {
                warn!("Platform detection failed, systemd notifications disabled: {err}");
                false
            }
        };

        Self::build(
            settings,
            Box::new(service),
            SystemdNotifier::from_env(),
            systemd_unit,
        )
    }

    /// Creates a host with explicit platform facts and notifier.
    pub fn with_platform(
        settings: HostSettings,
        service: Box<dyn ServiceHandle>,
        facts: &PlatformFacts,
        notifier: SystemdNotifier,
    ) -> Self {
        Self::build(settings, service, notifier, facts.is_systemd_unit())
    }

    fn build(
        settings: HostSettings,
        service: Box<dyn ServiceHandle>,
        notifier: SystemdNotifier,
        systemd_unit: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                notifier,
                systemd_unit,
                state: StateCell::new(),
                exit_code: ExitCodeCell::new(),
                stopping: AtomicUsize::new(0),
                waiter: WaitSignal::new(),
                stopper: WaitSignal::new(),
                host_thread: OnceLock::new(),
            }),
            service,
        }
    }

    /// Control handle for front-ends that deliver triggers themselves.
    pub fn control(&self) -> HostControl {
        HostControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.shared.settings
    }

    /// Starts the service and blocks until it has been stopped.
    pub fn run(mut self) -> ExitCode {
        let shared = Arc::clone(&self.shared);
        let control = self.control();
        let host_thread = thread::current().id();

        set_working_directory();
        let _ = shared.host_thread.set(host_thread);

        let hook = PanicHookGuard::install(host_thread, {
            let weak = Arc::downgrade(&shared);
            move |fault| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_fault(fault);
                }
            }
        });

        debug!("Running the {} service using posix primitives..", shared.name());

        let mut started = false;
        let mut watcher = None;
        let result = self.start_and_wait(&control, &mut started, &mut watcher);

        let failure = match result {
            Ok(()) => None,
            Err(err) => {
                let fault = Fault::new(err.to_string()).with_origin(fault::FaultOrigin::HostThread);
                shared.settings.report_fault(&fault);
                error!("An error occurred while running the {} service: {err}", shared.name());
                Some(ExitCode::AbnormalExit)
            }
        };

        if started {
            self.stop_service(&control);
        } else {
            shared.stopping.fetch_add(1, Ordering::SeqCst);
            shared.stopper.set();
            shared.state.advance(ServiceState::Stopped);
        }

        drop(watcher);
        drop(hook);
        logs::shutdown();

        failure.unwrap_or_else(|| shared.exit_code.get())
    }

    fn start_and_wait(
        &mut self,
        control: &HostControl,
        started: &mut bool,
        watcher: &mut Option<SignalWatcher>,
    ) -> Result<(), HostError> {
        let signal_control = control.clone();
        *watcher = Some(SignalWatcher::spawn(&TERMINATION_SIGNALS, move |signal| {
            info!("Received signal {signal}, stopping..");
            signal_control.deliver_signal(signal);
        })?);

        self.start_service(control)?;
        *started = true;

        self.shared.waiter.wait();
        Ok(())
    }

    fn start_service(&mut self, control: &HostControl) -> Result<(), HostError> {
        let shared = Arc::clone(&self.shared);
        info!("Starting the {} service", shared.name());

        set_console_title(&shared.settings.display_name);
        shared.state.advance(ServiceState::Starting);

        let service = &mut self.service;
        match fault::guarded(|| service.start(control)) {
            Ok(result) => result?,
            Err(payload) => {
                return Err(ServiceError::Panicked(fault::panic_message(payload.as_ref())).into());
            }
        }

        info!(
            "The {} service is now running, press Control+C to exit.",
            shared.name()
        );

        if shared.systemd_unit {
            shared.notifier.notify(&NotifyState::Ready);
        }
        shared.state.advance(ServiceState::Running);
        Ok(())
    }

    fn stop_service(&mut self, control: &HostControl) {
        let shared = Arc::clone(&self.shared);
        shared.state.advance(ServiceState::Stopping);
        info!("Stopping the {} service", shared.name());

        if shared.systemd_unit {
            shared.notifier.notify(&NotifyState::Stopping);
        }

        let service = &mut self.service;
        let result = match fault::guarded(|| service.stop(control)) {
            Ok(result) => result,
            Err(payload) => Err(ServiceError::Panicked(fault::panic_message(payload.as_ref()))),
        };

        if let Err(err) = result {
            shared.settings.report_fault(&Fault::from_service_error(&err));
            error!("The {} service did not shut down gracefully: {err}", shared.name());
            shared.exit_code.set(ExitCode::ServiceControlRequestFailed);
        }

        shared.stopper.set();

        let service = &mut self.service;
        if fault::guarded(|| service.dispose()).is_err() {
            warn!("Disposing the {} service panicked", shared.name());
        }

        shared.state.advance(ServiceState::Stopped);
        info!("The {} service has stopped.", shared.name());
    }
}

fn set_working_directory() {
    let exe = match env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            warn!("Unable to resolve the executable path: {err}");
            return;
        }
    };

    if let Some(dir) = exe.parent()
        && let Err(err) = env::set_current_dir(dir)
    {
        warn!("Unable to change directory to {}: {err}", dir.display());
    }
}

// Consoles are often absent for daemons, so a failure here is informational.
fn set_console_title(title: &str) {
    let mut stdout = io::stdout();
    if !stdout.is_terminal() {
        return;
    }

    if let Err(err) = stdout.execute(SetTitle(title)) {
        info!("It was not possible to set the console window title: {err}");
    }
}
