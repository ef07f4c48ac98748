#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Command as StdCommand, Stdio},
    time::{Duration, Instant},
};

use assert_cmd::Command;
use common::{notify_listener, receive};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use predicates::str::contains;
use tempfile::tempdir;

// Exit statuses are truncated to 8 bits: 1067 (AbnormalExit) surfaces as 43.
const ABNORMAL_EXIT_STATUS: i32 = 1067 & 0xff;

fn dhost() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("dhost"));
    cmd.env_remove("NOTIFY_SOCKET")
        .env_remove("INVOCATION_ID")
        .env_remove("MANAGERPID");
    cmd
}

#[test]
fn sigterm_stops_hosted_command_cleanly() {
    let temp = tempdir().expect("failed to create tempdir");
    let (listener, socket) = notify_listener(temp.path());

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("dhost"))
        .args(["run", "--stop-timeout", "5s", "--", "sleep", "30"])
        .env("NOTIFY_SOCKET", &socket)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn dhost");

    assert_eq!(receive(&listener), "READY=1");

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)
        .expect("failed to signal dhost");

    assert_eq!(receive(&listener), "STOPPING=1");
    let status = child.wait().expect("failed to wait for dhost");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn command_exit_ends_the_run() {
    dhost().args(["run", "--", "true"]).assert().success();

    dhost()
        .args(["run", "--", "sh", "-c", "exit 3"])
        .assert()
        .code(ABNORMAL_EXIT_STATUS);
}

#[test]
fn missing_program_is_an_abnormal_exit() {
    dhost()
        .args(["--log-level", "info", "run", "--", "/nonexistent/daemonhost-program"])
        .assert()
        .code(ABNORMAL_EXIT_STATUS)
        .stdout(contains("failed to spawn"));
}

#[test]
fn hung_command_forces_exit_after_stop_timeout() {
    let temp = tempdir().expect("failed to create tempdir");
    let (listener, socket) = notify_listener(temp.path());

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("dhost"))
        .args([
            "run",
            "--stop-timeout",
            "300ms",
            "--",
            "sh",
            "-c",
            "trap '' TERM; sleep 5",
        ])
        .env("NOTIFY_SOCKET", &socket)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn dhost");

    assert_eq!(receive(&listener), "READY=1");

    let signalled = Instant::now();
    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)
        .expect("failed to signal dhost");

    let status = child.wait().expect("failed to wait for dhost");
    assert!(signalled.elapsed() < Duration::from_secs(4));
    assert_eq!(status.code(), Some(ABNORMAL_EXIT_STATUS));
}

#[test]
fn settings_file_names_the_service() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = temp.path().join("host.yaml");
    fs::write(
        &config,
        r#"service_name: demo
stop_timeout: 10s
unhandled_fault_policy: log_error_only
"#,
    )
    .expect("failed to write settings");

    dhost()
        .args(["--log-level", "info", "run", "--config"])
        .arg(&config)
        .args(["--", "true"])
        .assert()
        .success()
        .stdout(contains("Starting the demo service"));
}

#[test]
fn invalid_settings_file_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = temp.path().join("host.yaml");
    fs::write(&config, "service_name: demo\nstop_timeout: soon\n")
        .expect("failed to write settings");

    dhost()
        .args(["run", "--config"])
        .arg(&config)
        .args(["--", "true"])
        .assert()
        .failure()
        .stderr(contains("soon"));
}

#[test]
fn probe_reports_systemd_unit_from_environment() {
    dhost()
        .arg("probe")
        .env("NOTIFY_SOCKET", "@probe.socket")
        .assert()
        .success()
        .stdout(contains("systemd_unit: true"))
        .stdout(contains("unix: true"));

    dhost()
        .arg("probe")
        .assert()
        .success()
        .stdout(contains("systemd_unit: false"))
        .stdout(contains("service_wrapper: false"));
}

#[test]
fn notify_sends_one_state() {
    let temp = tempdir().expect("failed to create tempdir");
    let (listener, socket) = notify_listener(temp.path());

    dhost()
        .args(["notify", "STATUS=warming up"])
        .env("NOTIFY_SOCKET", &socket)
        .assert()
        .success();

    assert_eq!(receive(&listener), "STATUS=warming up");
}

#[test]
fn notify_without_socket_fails() {
    dhost()
        .args(["notify", "READY=1"])
        .assert()
        .failure()
        .stderr(contains("NOTIFY_SOCKET"));
}
