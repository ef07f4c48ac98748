//! Faults raised by the hosted service and the policy that decides what to do with them.
//!
//! A fault reaches the host either explicitly through
//! [`HostControl::report_fault`](crate::host::HostControl::report_fault) or through the
//! panic hook the host installs while running. Panics inside the start and stop
//! callbacks are caught at the call site and never reach the hook.
use std::{
    any::Any,
    cell::Cell,
    fmt,
    panic::{self, AssertUnwindSafe, PanicHookInfo},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use crate::{config::UnhandledFaultPolicy, error::ServiceError};

/// Kind of thread a fault originated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// The thread that called `run`.
    HostThread,
    /// Any thread owned by the hosted service.
    ServiceThread,
    /// A worker of a task pool; see [`mark_task_pool_thread`].
    TaskPool,
}

/// A fault observed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub message: String,
    /// Whether the runtime is going to bring the process down because of it.
    pub is_terminating: bool,
    pub origin: FaultOrigin,
}

impl Fault {
    /// A non-terminating fault raised on the calling thread.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_terminating: false,
            origin: current_origin(None),
        }
    }

    pub fn terminating(mut self) -> Self {
        self.is_terminating = true;
        self
    }

    pub fn with_origin(mut self, origin: FaultOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub(crate) fn from_service_error(err: &ServiceError) -> Self {
        Self {
            message: err.to_string(),
            is_terminating: false,
            origin: FaultOrigin::HostThread,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Outcome of applying an [`UnhandledFaultPolicy`] to a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Ignore,
    Log,
    /// Log as fatal, record an abnormal exit, and stop the service gracefully.
    LogAndStop,
}

impl FaultAction {
    /// Policy table. Faults from task-pool threads never trigger a stop so the pool
    /// worker is not blocked waiting on it; such a fault can leave the process running.
    pub fn decide(policy: UnhandledFaultPolicy, fault: &Fault) -> Self {
        match policy {
            UnhandledFaultPolicy::TakeNoAction => FaultAction::Ignore,
            UnhandledFaultPolicy::LogErrorOnly => FaultAction::Log,
            UnhandledFaultPolicy::LogAndTerminate => {
                if fault.is_terminating && fault.origin != FaultOrigin::TaskPool {
                    FaultAction::LogAndStop
                } else {
                    FaultAction::Log
                }
            }
        }
    }
}

thread_local! {
    static TASK_POOL_THREAD: Cell<bool> = const { Cell::new(false) };
    static GUARDED_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the calling thread as a task-pool worker. Call it from the pool's thread-start
/// hook.
pub fn mark_task_pool_thread() {
    TASK_POOL_THREAD.with(|flag| flag.set(true));
}

/// Classifies the calling thread relative to `host_thread`.
pub fn current_origin(host_thread: Option<ThreadId>) -> FaultOrigin {
    if TASK_POOL_THREAD.with(Cell::get) {
        FaultOrigin::TaskPool
    } else if host_thread == Some(thread::current().id()) {
        FaultOrigin::HostThread
    } else {
        FaultOrigin::ServiceThread
    }
}

/// Runs `f`, catching panics. Panics raised inside are not reported by the hook.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> thread::Result<R> {
    GUARDED_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    GUARDED_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

fn is_guarded() -> bool {
    GUARDED_DEPTH.with(|depth| depth.get() > 0)
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

type Hook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

// Guard whose hook is the one currently installed.
static ACTIVE_HOOK: Mutex<Option<u64>> = Mutex::new(None);
static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide panic hook forwarding unhandled panics as [`Fault`]s.
///
/// Hooks installed by overlapping guards chain onto each other. Dropping a guard stops
/// its hook from forwarding; the previous hook is reinstated only if no later guard has
/// installed its own on top, otherwise the dropped hook stays in the chain as a
/// pass-through.
pub(crate) struct PanicHookGuard {
    id: u64,
    previous: Arc<Hook>,
    previous_id: Option<u64>,
    enabled: Arc<AtomicBool>,
}

impl PanicHookGuard {
    pub(crate) fn install<F>(host_thread: ThreadId, sink: F) -> Self
    where
        F: Fn(Fault) + Send + Sync + 'static,
    {
        let mut active = ACTIVE_HOOK.lock().unwrap_or_else(PoisonError::into_inner);
        let previous: Arc<Hook> = Arc::new(panic::take_hook());
        let chained = Arc::clone(&previous);
        let enabled = Arc::new(AtomicBool::new(true));
        let forwarding = Arc::clone(&enabled);

        panic::set_hook(Box::new(move |info| {
            chained(info);

            if !forwarding.load(Ordering::SeqCst) || is_guarded() {
                return;
            }

            let thread = thread::current();
            let mut message = format!(
                "thread '{}' panicked: {}",
                thread.name().unwrap_or("<unnamed>"),
                panic_message(info.payload())
            );
            if let Some(location) = info.location() {
                message.push_str(&format!(" at {location}"));
            }

            sink(Fault {
                message,
                is_terminating: cfg!(panic = "abort") || thread.id() == host_thread,
                origin: current_origin(Some(host_thread)),
            });
        }));

        let id = NEXT_HOOK_ID.fetch_add(1, Ordering::SeqCst);
        let previous_id = active.replace(id);
        Self {
            id,
            previous,
            previous_id,
            enabled,
        }
    }
}

impl Drop for PanicHookGuard {
    fn drop(&mut self) {
        self.enabled.store(false, Ordering::SeqCst);
        if thread::panicking() {
            return;
        }

        let mut active = ACTIVE_HOOK.lock().unwrap_or_else(PoisonError::into_inner);
        if *active != Some(self.id) {
            return;
        }

        let _ = panic::take_hook();
        let previous = Arc::clone(&self.previous);
        panic::set_hook(Box::new(move |info| previous(info)));
        *active = self.previous_id;
    }
}
