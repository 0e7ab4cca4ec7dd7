//! Integration tests for daemon discovery and lifecycle.
//!
//! A real daemon is not needed: a listening socket stands in for a running
//! one, and a shell script that never opens its socket stands in for one
//! that fails to start.

use std::fs;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;

use strata::core::retry::RetryPolicy;
use strata::dock::{DaemonSettings, Dock, DockError, PID_FILE, SOCKET_FILE};

fn quick(program: &str, args: &[&str]) -> DaemonSettings {
    DaemonSettings {
        program: program.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        probe: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(200)),
        spawn: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(500)),
    }
}

fn alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[test]
fn running_daemon_is_borrowed_not_owned() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join(PID_FILE), format!("{}\n", std::process::id())).unwrap();
    let _listener = UnixListener::bind(temp.path().join(SOCKET_FILE)).unwrap();

    let settings = quick("/nonexistent/dockerd", &[]);
    let mut dock = Dock::discover(temp.path(), &settings).unwrap();

    assert!(!dock.is_owned());
    assert!(dock.host().starts_with("unix://"));
    assert!(dock.host().ends_with(SOCKET_FILE));

    // releasing a borrowed daemon must not signal it
    dock.slay();
    assert!(alive(std::process::id()));
}

#[test]
fn stale_pid_file_starts_a_new_daemon() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join(PID_FILE), "2147483646\n").unwrap();

    let settings = quick("/nonexistent/dockerd", &[]);
    let err = Dock::discover(temp.path(), &settings).unwrap_err();

    assert!(matches!(err, DockError::Spawn { ref program, .. } if program == "/nonexistent/dockerd"));
}

#[test]
fn missing_dock_dir_is_created() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("dock");

    let settings = quick("/nonexistent/dockerd", &[]);
    let _ = Dock::discover(&dir, &settings);

    assert!(dir.is_dir());
}

#[test]
fn daemon_that_never_listens_is_stopped() {
    let temp = TempDir::new().unwrap();
    let settings = quick("sh", &["-c", "echo $$ > {dir}/docker.pid; exec sleep 30"]);

    let err = Dock::discover(temp.path(), &settings).unwrap_err();
    assert!(matches!(err, DockError::Unavailable { .. }));

    let pid: u32 = fs::read_to_string(temp.path().join(PID_FILE))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!alive(pid), "daemon {pid} should have been stopped");
}

#[test]
fn leftover_pid_of_another_process_is_left_alone() {
    let temp = TempDir::new().unwrap();
    let mut bystander = Command::new("sleep").arg("30").spawn().unwrap();
    fs::write(temp.path().join(PID_FILE), format!("{}\n", bystander.id())).unwrap();

    // the bystander holds no socket, so a daemon is spawned; it exits at once
    let err = Dock::discover(temp.path(), &quick("true", &[])).unwrap_err();
    assert!(matches!(err, DockError::Unavailable { .. }));

    let still_running = bystander.try_wait().unwrap().is_none();
    let _ = bystander.kill();
    let _ = bystander.wait();
    assert!(still_running, "discover signalled a process it did not start");
}
