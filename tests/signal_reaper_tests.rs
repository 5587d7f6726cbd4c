//! The SIGCHLD-to-reaper path with real children. Kept in its own test
//! binary: reaping with `waitpid(ANY)` would steal exit statuses from
//! any other test waiting on a specific pid in the same process.

use std::process::Command;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use duskdm::process::{reap_children, ChildProcess, ExitReason, SignalSource};

fn spawn_shell(script: &str) -> Pid {
    let child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .spawn()
        .expect("spawn sh");
    Pid::from_raw(child.id() as i32)
}

#[test]
fn test_sigchld_drives_reaping() {
    let mut signals = SignalSource::install().unwrap();

    let mut workers = Vec::new();
    for script in ["exit 5", "exit 0"] {
        let mut worker = ChildProcess::new();
        worker.attach(spawn_shell(script)).unwrap();
        workers.push(worker);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut saw_sigchld = false;
    while workers.iter().any(|w| w.is_running()) {
        assert!(Instant::now() < deadline, "children never reaped");
        std::thread::sleep(Duration::from_millis(10));

        for event in signals.drain() {
            if event.signal() == Some(Signal::SIGCHLD) {
                saw_sigchld = true;
            }
        }
        for (pid, status) in reap_children() {
            for worker in workers.iter_mut() {
                if worker.on_child_exited(pid, status) {
                    break;
                }
            }
        }
    }

    assert_eq!(workers[0].exit_reason(), Some(ExitReason::Exited(5)));
    assert_eq!(workers[1].exit_reason(), Some(ExitReason::Exited(0)));

    // The handler may fire after our last drain; give it a beat
    if !saw_sigchld {
        std::thread::sleep(Duration::from_millis(50));
        saw_sigchld = signals
            .drain()
            .iter()
            .any(|e| e.signal() == Some(Signal::SIGCHLD));
    }
    assert!(saw_sigchld, "no SIGCHLD event reached the pipe");
}
