//! Termination-signal reception and the wait signals used for the stop rendezvous.
use std::{
    fs::File,
    io::{self, Read, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd,
};
use tracing::{debug, warn};

use crate::{constants::SIGNAL_WATCHER_THREAD, error::HostError};

/// A binary signal: starts unset, stays set once set.
#[derive(Debug, Default)]
pub struct WaitSignal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl WaitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the signal is set.
    pub fn wait(&self) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .cond
            .wait_while(state, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Blocks until the signal is set or `timeout` elapses. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(state, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

const MAX_WATCHERS: usize = 16;

// Written to a watcher's pipe on drop; no signal has number 0.
const WAKE_BYTE: u8 = 0;

// Write ends of the live watchers' pipes, read by the signal handler.
static WATCHER_FDS: [AtomicI32; MAX_WATCHERS] = [const { AtomicI32::new(-1) }; MAX_WATCHERS];

// Dispositions replaced by `forward_signal`, with the number of watchers relying on each.
static INSTALLED: Mutex<Vec<InstalledHandler>> = Mutex::new(Vec::new());

struct InstalledHandler {
    signal: Signal,
    watchers: usize,
    previous: SigAction,
}

extern "C" fn forward_signal(signal: libc::c_int) {
    let saved = Errno::last_raw();
    let byte = signal as u8;
    for slot in &WATCHER_FDS {
        let fd = slot.load(Ordering::SeqCst);
        if fd >= 0 {
            // SAFETY: write(2) is async-signal-safe and `byte` outlives the call.
            unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
        }
    }
    Errno::set_raw(saved);
}

fn claim_slot(fd: RawFd) -> Result<usize, HostError> {
    WATCHER_FDS
        .iter()
        .position(|slot| slot.compare_exchange(-1, fd, Ordering::SeqCst, Ordering::SeqCst).is_ok())
        .ok_or_else(|| HostError::Io(io::Error::other("too many signal watchers")))
}

fn release_slot(slot: usize) {
    WATCHER_FDS[slot].store(-1, Ordering::SeqCst);
}

fn install_handlers(signals: &[Signal]) -> Result<(), HostError> {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for (index, signal) in signals.iter().enumerate() {
        if let Some(entry) = installed.iter_mut().find(|entry| entry.signal == *signal) {
            entry.watchers += 1;
            continue;
        }

        // SAFETY: `forward_signal` only loads atomics and calls write(2).
        match unsafe { signal::sigaction(*signal, &action) } {
            Ok(previous) => installed.push(InstalledHandler {
                signal: *signal,
                watchers: 1,
                previous,
            }),
            Err(err) => {
                release_handlers(&mut installed, &signals[..index]);
                return Err(HostError::Signal(err));
            }
        }
    }

    Ok(())
}

fn uninstall_handlers(signals: &[Signal]) {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    release_handlers(&mut installed, signals);
}

fn release_handlers(installed: &mut Vec<InstalledHandler>, signals: &[Signal]) {
    for signal in signals {
        let Some(index) = installed.iter().position(|entry| entry.signal == *signal) else {
            continue;
        };

        installed[index].watchers -= 1;
        if installed[index].watchers == 0 {
            let entry = installed.swap_remove(index);
            // SAFETY: reinstates the disposition that was in place before ours.
            if let Err(err) = unsafe { signal::sigaction(entry.signal, &entry.previous) } {
                warn!("Failed to restore disposition of {}: {err}", entry.signal);
            }
        }
    }
}

fn set_fd_flags(
    fd: &OwnedFd,
    get: libc::c_int,
    set: libc::c_int,
    flags: libc::c_int,
) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own, with integer arguments only.
    let current = unsafe { libc::fcntl(fd.as_raw_fd(), get) };
    if current < 0 || unsafe { libc::fcntl(fd.as_raw_fd(), set, current | flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn watcher_pipe() -> Result<(File, File), HostError> {
    let (reader, writer) = unistd::pipe()?;
    for fd in [&reader, &writer] {
        set_fd_flags(fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    }
    // A full pipe must not block the signal handler.
    set_fd_flags(&writer, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
    Ok((File::from(reader), File::from(writer)))
}

/// Dedicated thread that receives a set of signals on behalf of the whole process.
///
/// A handler is installed process-wide for each signal, so a delivery is caught no
/// matter which thread the kernel picks, including threads that existed before the
/// watcher. The handler forwards the signal number over a pipe to the watcher thread.
/// Only the first delivery reaches `on_signal`; later ones are logged and dropped.
/// Dropping the watcher joins the thread and, once no other watcher needs them,
/// reinstates the dispositions that were in place before.
pub struct SignalWatcher {
    signals: Vec<Signal>,
    slot: usize,
    wake: File,
    handle: Option<JoinHandle<()>>,
    disposed: Arc<AtomicBool>,
}

impl SignalWatcher {
    pub fn spawn<F>(signals: &[Signal], on_signal: F) -> Result<Self, HostError>
    where
        F: FnOnce(Signal) + Send + 'static,
    {
        let (reader, wake) = watcher_pipe()?;
        let slot = claim_slot(wake.as_raw_fd())?;
        if let Err(err) = install_handlers(signals) {
            release_slot(slot);
            return Err(err);
        }

        let disposed = Arc::new(AtomicBool::new(false));
        let spawned = thread::Builder::new()
            .name(SIGNAL_WATCHER_THREAD.to_string())
            .spawn({
                let watched = signals.to_vec();
                let disposed = Arc::clone(&disposed);
                move || watch(reader, &watched, &disposed, on_signal)
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                release_slot(slot);
                uninstall_handlers(signals);
                return Err(HostError::Io(err));
            }
        };

        debug!("Watching signals {:?}", signals);

        Ok(Self {
            signals: signals.to_vec(),
            slot,
            wake,
            handle: Some(handle),
            disposed,
        })
    }
}

fn watch<F>(mut reader: File, watched: &[Signal], disposed: &AtomicBool, on_signal: F)
where
    F: FnOnce(Signal),
{
    let mut on_signal = Some(on_signal);
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("Waiting for termination signals failed: {err}");
                break;
            }
        }

        if byte[0] == WAKE_BYTE || disposed.load(Ordering::SeqCst) {
            break;
        }
        let Ok(signal) = Signal::try_from(libc::c_int::from(byte[0])) else {
            continue;
        };
        if !watched.contains(&signal) {
            continue;
        }

        match on_signal.take() {
            Some(handler) => handler(signal),
            None => debug!("Ignoring repeated {signal}"),
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        release_slot(self.slot);
        uninstall_handlers(&self.signals);

        if let Some(handle) = self.handle.take() {
            if let Err(err) = (&self.wake).write_all(&[WAKE_BYTE]) {
                warn!("Failed to wake the signal watcher: {err}");
            }
            if handle.join().is_err() {
                warn!("Signal watcher thread panicked");
            }
        }
    }
}

/// Restores the default disposition of `signal` and raises it on the calling thread,
/// letting the process die the way it would without a watcher.
pub fn die_by_default(signal: Signal) {
    // SAFETY: installing SIG_DFL does not run any handler code.
    if let Err(err) = unsafe { signal::signal(signal, SigHandler::SigDfl) } {
        warn!("Failed to reset disposition of {signal}: {err}");
        return;
    }

    let mut set = SigSet::empty();
    set.add(signal);
    let _ = set.thread_unblock();
    let _ = signal::raise(signal);
}
