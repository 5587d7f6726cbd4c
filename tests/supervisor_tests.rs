//! Child supervision against real processes.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use duskdm::process::{ChildProcess, ExitReason};

fn spawn_shell(script: &str) -> Pid {
    let child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .spawn()
        .expect("spawn sh");
    Pid::from_raw(child.id() as i32)
}

/// Spawn a shell and block until it has printed "ready", so its trap
/// handlers are in place before we start signalling it.
fn spawn_shell_ready(script: &str) -> Pid {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn sh");
    let pid = Pid::from_raw(child.id() as i32);
    let mut byte = [0u8; 1];
    child
        .stdout
        .take()
        .expect("stdout piped")
        .read_exact(&mut byte)
        .expect("child readiness");
    pid
}

#[test]
fn test_wait_collects_exit_code() {
    let mut child = ChildProcess::new();
    child.attach(spawn_shell("exit 7")).unwrap();
    let reason = child.wait_blocking().unwrap();
    assert_eq!(reason, ExitReason::Exited(7));
    assert!(!reason.success());
    assert!(!child.is_running());
}

#[test]
fn test_wait_reports_success() {
    let mut child = ChildProcess::new();
    child.attach(spawn_shell("exit 0")).unwrap();
    assert!(child.wait_blocking().unwrap().success());
}

#[test]
fn test_stop_sends_sigterm() {
    let mut child = ChildProcess::with_grace(Duration::from_secs(5));
    child.attach(spawn_shell("sleep 30")).unwrap();
    assert!(child.is_running());
    assert!(child.kill_deadline().is_none(), "no deadline before stop");

    child.stop();
    assert!(child.kill_deadline().is_some());
    let reason = child.wait_blocking().unwrap();
    assert_eq!(reason, ExitReason::Signalled(Signal::SIGTERM as i32));
    assert!(child.kill_deadline().is_none(), "deadline cleared on exit");
}

#[test]
fn test_stop_escalates_to_sigkill() {
    let mut child = ChildProcess::with_grace(Duration::from_millis(100));
    child
        .attach(spawn_shell_ready(
            "trap '' TERM; echo r; while :; do sleep 1; done",
        ))
        .unwrap();

    child.stop();
    std::thread::sleep(Duration::from_millis(150));
    child.on_timeout(Instant::now());
    let reason = child.wait_blocking().unwrap();
    assert_eq!(reason, ExitReason::Signalled(Signal::SIGKILL as i32));
}

#[test]
fn test_exit_routed_through_on_child_exited() {
    let mut child = ChildProcess::new();
    let pid = spawn_shell("exit 3");
    child.attach(pid).unwrap();

    let status = waitpid(pid, None).unwrap();
    assert!(child.on_child_exited(pid, status));
    assert_eq!(child.exit_reason(), Some(ExitReason::Exited(3)));
    assert!(!child.is_running());
}
