//! Ready-made [`ServiceHandle`] implementations.
use std::{
    fmt, io,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use nix::{
    errno::Errno,
    sys::signal::{self, SigSet, SigmaskHow, Signal},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{
    constants::CHILD_POLL_INTERVAL,
    error::ServiceError,
    host::{HostControl, ServiceHandle},
    state::ExitCode,
};

type Callback = Box<dyn FnMut(&HostControl) -> bool + Send>;

/// Service built from closures that report success as `bool`.
pub struct FnService {
    start: Callback,
    stop: Callback,
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl FnService {
    pub fn new<S, T>(start: S, stop: T) -> Self
    where
        S: FnMut(&HostControl) -> bool + Send + 'static,
        T: FnMut(&HostControl) -> bool + Send + 'static,
    {
        Self {
            start: Box::new(start),
            stop: Box::new(stop),
            dispose: None,
        }
    }

    /// Runs `dispose` once the service has stopped.
    pub fn on_dispose<D>(mut self, dispose: D) -> Self
    where
        D: FnOnce() + Send + 'static,
    {
        self.dispose = Some(Box::new(dispose));
        self
    }
}

impl ServiceHandle for FnService {
    fn start(&mut self, control: &HostControl) -> Result<(), ServiceError> {
        if (self.start)(control) {
            Ok(())
        } else {
            Err(ServiceError::StartDeclined)
        }
    }

    fn stop(&mut self, control: &HostControl) -> Result<(), ServiceError> {
        if (self.stop)(control) {
            Ok(())
        } else {
            Err(ServiceError::StopDeclined)
        }
    }

    fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

/// Hosts an external command. The host stops when the command exits on its own;
/// stopping the host sends `SIGTERM` to the command and waits for it to exit.
pub struct CommandService {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    child: Arc<Mutex<Option<Child>>>,
    stopping: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl CommandService {
    /// The command runs in the directory current at construction time, since the host
    /// changes directory before starting it.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: std::env::current_dir().ok(),
            child: Arc::new(Mutex::new(None)),
            stopping: Arc::new(AtomicBool::new(false)),
            monitor: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn spawn_monitor(&mut self, control: HostControl) -> io::Result<()> {
        let child = Arc::clone(&self.child);
        let stopping = Arc::clone(&self.stopping);
        let program = self.program.clone();

        let handle = thread::Builder::new()
            .name("command-monitor".into())
            .spawn(move || {
                loop {
                    thread::sleep(CHILD_POLL_INTERVAL);
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }

                    let mut guard = child.lock().unwrap_or_else(PoisonError::into_inner);
                    let Some(process) = guard.as_mut() else {
                        break;
                    };

                    match process.try_wait() {
                        Ok(Some(status)) => {
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            let exit_code = if status.success() {
                                ExitCode::Ok
                            } else {
                                ExitCode::AbnormalExit
                            };
                            info!("Command '{program}' exited ({status}); stopping host");
                            control.stop_with(exit_code);
                            break;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!("Failed to poll command '{program}': {err}");
                            break;
                        }
                    }
                }
            })?;

        self.monitor = Some(handle);
        Ok(())
    }
}

impl ServiceHandle for CommandService {
    fn start(&mut self, control: &HostControl) -> Result<(), ServiceError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        // The command starts with every signal unblocked, whatever the host thread masks.
        // SAFETY: sigprocmask is async-signal-safe and nothing is allocated before exec.
        unsafe {
            command.pre_exec(|| {
                signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                    .map_err(io::Error::from)
            });
        }

        let child = command.spawn().map_err(|err| {
            ServiceError::other(io::Error::new(
                err.kind(),
                format!("failed to spawn '{}': {err}", self.program),
            ))
        })?;
        info!("Started command '{}' (PID {})", self.program, child.id());

        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        self.spawn_monitor(control.clone()).map_err(ServiceError::other)?;
        Ok(())
    }

    fn stop(&mut self, _control: &HostControl) -> Result<(), ServiceError> {
        self.stopping.store(true, Ordering::SeqCst);

        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        if child.try_wait().map_err(ServiceError::other)?.is_none() {
            let pid = Pid::from_raw(child.id() as i32);
            match signal::kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    return Err(ServiceError::other(io::Error::from_raw_os_error(err as i32)));
                }
            }
            debug!("Sent SIGTERM to command '{}' (PID {pid})", self.program);
        }

        let status = child.wait().map_err(ServiceError::other)?;
        info!("Command '{}' stopped ({status})", self.program);
        Ok(())
    }

    fn dispose(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take()
            && monitor.join().is_err()
        {
            warn!("Command monitor thread panicked");
        }
    }
}

impl fmt::Debug for CommandService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandService")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}
