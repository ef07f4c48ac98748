#[path = "common/mod.rs"]
mod common;

use std::{
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use common::{
    notify_listener, nothing_received, posix_host, receive, serial, test_settings, wait_until,
};
use daemonhost::{
    config::UnhandledFaultPolicy,
    fault::{Fault, FaultOrigin},
    host::PosixRunHost,
    notify::SystemdNotifier,
    platform::PlatformFacts,
    service::FnService,
    state::{ConsoleKey, ExitCode, ServiceState},
};
use nix::{
    sys::signal::{self, Signal},
    unistd::getpid,
};
use tempfile::tempdir;

type Spawned = Arc<Mutex<Vec<JoinHandle<()>>>>;

fn join_all(spawned: &Spawned) {
    let handles: Vec<_> = spawned.lock().unwrap().drain(..).collect();
    for handle in handles {
        handle.join().expect("trigger thread panicked");
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
fn declined_start_skips_stop_and_exits_abnormally() {
    let _serial = serial();
    let stops = counter();
    let disposed = Arc::new(AtomicBool::new(false));

    let service = FnService::new(|_| false, {
        let stops = Arc::clone(&stops);
        move |_| {
            stops.fetch_add(1, Ordering::SeqCst);
            true
        }
    })
    .on_dispose({
        let disposed = Arc::clone(&disposed);
        move || disposed.store(true, Ordering::SeqCst)
    });

    let host = posix_host(test_settings("declined"), service);
    let control = host.control();

    assert_eq!(host.run(), ExitCode::AbnormalExit);
    assert_eq!(stops.load(Ordering::SeqCst), 0);
    assert!(!disposed.load(Ordering::SeqCst));
    assert_eq!(control.state(), ServiceState::Stopped);
}

#[test]
fn panicking_start_exits_abnormally() {
    let _serial = serial();
    let faults = Arc::new(Mutex::new(Vec::<Fault>::new()));
    let settings = test_settings("start-panic").with_fault_callback({
        let faults = Arc::clone(&faults);
        move |fault| faults.lock().unwrap().push(fault.clone())
    });

    let service = FnService::new(|_| panic!("cannot open port"), |_| true);
    let host = posix_host(settings, service);

    assert_eq!(host.run(), ExitCode::AbnormalExit);
    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].message.contains("cannot open port"));
}

#[test]
fn declined_stop_reports_control_request_failure() {
    let _serial = serial();
    let faults = counter();
    let disposed = Arc::new(AtomicBool::new(false));
    let settings = test_settings("declined-stop").with_fault_callback({
        let faults = Arc::clone(&faults);
        move |_| {
            faults.fetch_add(1, Ordering::SeqCst);
        }
    });

    let service = FnService::new(
        |control| {
            control.stop();
            true
        },
        |_| false,
    )
    .on_dispose({
        let disposed = Arc::clone(&disposed);
        move || disposed.store(true, Ordering::SeqCst)
    });

    let host = posix_host(settings, service);
    let control = host.control();

    assert_eq!(host.run(), ExitCode::ServiceControlRequestFailed);
    assert_eq!(faults.load(Ordering::SeqCst), 1);
    assert!(disposed.load(Ordering::SeqCst));
    assert_eq!(control.state(), ServiceState::Stopped);
}

#[test]
fn panicking_stop_reports_control_request_failure() {
    let _serial = serial();
    let service = FnService::new(
        |control| {
            control.stop();
            true
        },
        |_| panic!("stop exploded"),
    );

    let host = posix_host(test_settings("stop-panic"), service);
    let control = host.control();

    assert_eq!(host.run(), ExitCode::ServiceControlRequestFailed);
    assert_eq!(control.state(), ServiceState::Stopped);
}

#[test]
fn concurrent_triggers_stop_exactly_once() {
    let _serial = serial();
    let stops = counter();
    let spawned: Spawned = Arc::default();

    let service = FnService::new(
        {
            let spawned = Arc::clone(&spawned);
            move |control| {
                let barrier = Arc::new(Barrier::new(8));
                let mut handles = spawned.lock().unwrap();
                for index in 0..8 {
                    let control = control.clone();
                    let barrier = Arc::clone(&barrier);
                    handles.push(thread::spawn(move || {
                        barrier.wait();
                        match index % 4 {
                            0 => control.stop(),
                            1 => control.deliver_signal(Signal::SIGTERM),
                            2 => control.deliver_signal(Signal::SIGINT),
                            _ => {
                                control.console_interrupt(ConsoleKey::CtrlC);
                            }
                        }
                    }));
                }
                true
            }
        },
        {
            let stops = Arc::clone(&stops);
            move |_| {
                stops.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                true
            }
        },
    );

    let host = posix_host(test_settings("concurrent"), service);

    assert_eq!(host.run(), ExitCode::Ok);
    join_all(&spawned);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn repeated_stop_requests_are_ignored() {
    let _serial = serial();
    let stops = counter();

    let service = FnService::new(
        |control| {
            control.stop();
            control.stop();
            control.stop_with(ExitCode::ServiceNotRunning);
            true
        },
        {
            let stops = Arc::clone(&stops);
            move |_| {
                stops.fetch_add(1, Ordering::SeqCst);
                true
            }
        },
    );

    let host = posix_host(test_settings("idempotent"), service);

    assert_eq!(host.run(), ExitCode::Ok);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_with_sets_the_exit_code() {
    let _serial = serial();
    let service = FnService::new(
        |control| {
            control.stop_with(ExitCode::ServiceNotRunning);
            true
        },
        |_| true,
    );

    let host = posix_host(test_settings("stop-with"), service);
    assert_eq!(host.run(), ExitCode::ServiceNotRunning);
}

#[test]
fn sigterm_notifies_ready_then_stopping() {
    let _serial = serial();
    let dir = tempdir().expect("failed to create tempdir");
    let (listener, path) = notify_listener(dir.path());
    let spawned: Spawned = Arc::default();

    let service = FnService::new(
        {
            let spawned = Arc::clone(&spawned);
            move |control| {
                let control = control.clone();
                spawned.lock().unwrap().push(thread::spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    control.deliver_signal(Signal::SIGTERM);
                }));
                true
            }
        },
        |_| true,
    );

    let host = PosixRunHost::with_platform(
        test_settings("unit"),
        Box::new(service),
        &PlatformFacts::default().with_systemd_unit(true),
        SystemdNotifier::with_socket_path(Some(path.into_os_string())),
    );
    let control = host.control();

    assert_eq!(host.run(), ExitCode::Ok);
    join_all(&spawned);

    assert_eq!(receive(&listener), "READY=1");
    assert_eq!(receive(&listener), "STOPPING=1");
    assert!(nothing_received(&listener));
    assert_eq!(control.state(), ServiceState::Stopped);
}

#[test]
fn process_sigterm_stops_host_with_threads_started_before_run() {
    let _serial = serial();
    let stops = counter();
    let (started_tx, started_rx) = mpsc::channel::<()>();

    // Spawned before the host runs, so nothing the host does to its own thread applies here.
    let sender = thread::spawn(move || {
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("service never started");
        signal::kill(getpid(), Signal::SIGTERM).expect("failed to signal the process");
    });

    let service = FnService::new(
        move |_| started_tx.send(()).is_ok(),
        {
            let stops = Arc::clone(&stops);
            move |_| {
                stops.fetch_add(1, Ordering::SeqCst);
                true
            }
        },
    );
    let host = posix_host(test_settings("process-sigterm"), service);
    let control = host.control();

    assert_eq!(host.run(), ExitCode::Ok);
    sender.join().expect("signal thread panicked");

    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(control.state(), ServiceState::Stopped);
}

#[test]
fn non_unit_process_sends_no_notifications() {
    let _serial = serial();
    let dir = tempdir().expect("failed to create tempdir");
    let (listener, path) = notify_listener(dir.path());

    let service = FnService::new(
        |control| {
            control.stop();
            true
        },
        |_| true,
    );

    let host = PosixRunHost::with_platform(
        test_settings("plain"),
        Box::new(service),
        &PlatformFacts::default(),
        SystemdNotifier::with_socket_path(Some(path.into_os_string())),
    );

    assert_eq!(host.run(), ExitCode::Ok);
    assert!(nothing_received(&listener));
}

#[test]
fn hung_stop_releases_the_trigger_after_the_timeout() {
    let _serial = serial();
    let (returned_tx, returned_rx) = mpsc::channel();
    let stop_finished = Arc::new(Mutex::new(None::<Instant>));
    let spawned: Spawned = Arc::default();

    let settings = test_settings("hung").with_stop_timeout(Duration::from_millis(200));
    let service = FnService::new(
        {
            let spawned = Arc::clone(&spawned);
            move |control| {
                let control = control.clone();
                let returned_tx = returned_tx.clone();
                spawned.lock().unwrap().push(thread::spawn(move || {
                    control.deliver_signal(Signal::SIGTERM);
                    returned_tx.send(Instant::now()).unwrap();
                }));
                true
            }
        },
        {
            let stop_finished = Arc::clone(&stop_finished);
            move |_| {
                thread::sleep(Duration::from_millis(1500));
                *stop_finished.lock().unwrap() = Some(Instant::now());
                true
            }
        },
    );

    let host = posix_host(settings, service);

    assert_eq!(host.run(), ExitCode::Ok);
    join_all(&spawned);

    let trigger_returned = returned_rx.recv().unwrap();
    let stop_finished = stop_finished.lock().unwrap().expect("stop never finished");
    assert!(trigger_returned < stop_finished);
}

#[test]
fn terminating_fault_stops_with_abnormal_exit() {
    let _serial = serial();
    let stops = counter();
    let reported = counter();
    let spawned: Spawned = Arc::default();

    let settings = test_settings("fatal").with_fault_callback({
        let reported = Arc::clone(&reported);
        move |_| {
            reported.fetch_add(1, Ordering::SeqCst);
        }
    });
    let service = FnService::new(
        {
            let spawned = Arc::clone(&spawned);
            move |control| {
                let control = control.clone();
                spawned.lock().unwrap().push(thread::spawn(move || {
                    control.report_fault(
                        Fault::new("worker died")
                            .terminating()
                            .with_origin(FaultOrigin::ServiceThread),
                    );
                }));
                true
            }
        },
        {
            let stops = Arc::clone(&stops);
            move |_| {
                stops.fetch_add(1, Ordering::SeqCst);
                true
            }
        },
    );

    let host = posix_host(settings, service);

    assert_eq!(host.run(), ExitCode::AbnormalExit);
    join_all(&spawned);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(reported.load(Ordering::SeqCst), 1);
}

#[test]
fn task_pool_fault_leaves_the_service_running() {
    let _serial = serial();
    let reported = counter();
    let settings = test_settings("task-pool").with_fault_callback({
        let reported = Arc::clone(&reported);
        move |_| {
            reported.fetch_add(1, Ordering::SeqCst);
        }
    });
    let spawned: Spawned = Arc::default();

    let service = FnService::new(
        {
            let spawned = Arc::clone(&spawned);
            move |control| {
                let control = control.clone();
                spawned.lock().unwrap().push(thread::spawn(move || {
                    daemonhost::fault::mark_task_pool_thread();
                    control.report_fault(
                        Fault::new("pool task failed")
                            .terminating()
                            .with_origin(FaultOrigin::TaskPool),
                    );
                    thread::sleep(Duration::from_millis(100));
                    assert_eq!(control.state(), ServiceState::Running);
                    control.stop();
                }));
                true
            }
        },
        |_| true,
    );

    let host = posix_host(settings, service);

    assert_eq!(host.run(), ExitCode::Ok);
    join_all(&spawned);
    assert_eq!(reported.load(Ordering::SeqCst), 1);
}

#[test]
fn log_error_only_keeps_running_after_faults() {
    let _serial = serial();
    let settings = test_settings("log-only").with_policy(UnhandledFaultPolicy::LogErrorOnly);

    let service = FnService::new(
        |control| {
            control.report_fault(Fault::new("disk full").terminating());
            assert_eq!(control.exit_code(), ExitCode::Ok);
            control.stop();
            true
        },
        |_| true,
    );

    let host = posix_host(settings, service);
    assert_eq!(host.run(), ExitCode::Ok);
}

#[test]
fn service_thread_panic_reaches_the_fault_callback() {
    let _serial = serial();
    let faults = Arc::new(Mutex::new(Vec::<Fault>::new()));
    let settings = test_settings("thread-panic").with_fault_callback({
        let faults = Arc::clone(&faults);
        move |fault| faults.lock().unwrap().push(fault.clone())
    });
    let spawned: Spawned = Arc::default();

    let service = FnService::new(
        {
            let spawned = Arc::clone(&spawned);
            move |control| {
                let control = control.clone();
                spawned.lock().unwrap().push(thread::spawn(move || {
                    let worker = thread::Builder::new()
                        .name("worker".into())
                        .spawn(|| {
                            panic!("worker boom");
                        })
                        .unwrap();
                    assert!(worker.join().is_err());
                    control.stop();
                }));
                true
            }
        },
        |_| true,
    );

    let host = posix_host(settings, service);

    assert_eq!(host.run(), ExitCode::Ok);
    join_all(&spawned);

    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].message.contains("worker boom"));
    assert!(!faults[0].is_terminating);
    assert_eq!(faults[0].origin, FaultOrigin::ServiceThread);
}

#[test]
fn refused_ctrl_break_leaves_the_service_running() {
    let _serial = serial();
    let mut settings = test_settings("no-break");
    settings.can_handle_ctrl_break = false;

    let service = FnService::new(
        |control| {
            assert!(!control.console_interrupt(ConsoleKey::CtrlBreak));
            control.stop();
            true
        },
        |_| true,
    );

    let host = posix_host(settings, service);
    assert_eq!(host.run(), ExitCode::Ok);
}

#[test]
fn ctrl_c_stops_the_service() {
    let _serial = serial();
    let stopped = Arc::new(AtomicBool::new(false));
    let spawned: Spawned = Arc::default();

    let service = FnService::new(
        {
            let spawned = Arc::clone(&spawned);
            move |control| {
                let control = control.clone();
                spawned.lock().unwrap().push(thread::spawn(move || {
                    assert!(control.console_interrupt(ConsoleKey::CtrlC));
                }));
                true
            }
        },
        {
            let stopped = Arc::clone(&stopped);
            move |_| {
                stopped.store(true, Ordering::SeqCst);
                true
            }
        },
    );

    let host = posix_host(test_settings("ctrl-c"), service);
    let control = host.control();

    assert_eq!(host.run(), ExitCode::Ok);
    join_all(&spawned);
    assert!(stopped.load(Ordering::SeqCst));
    assert!(wait_until(Duration::from_secs(1), || {
        control.state() == ServiceState::Stopped
    }));
}
