//! dock
//!
//! Lifecycle of the container-runtime daemon a build talks to.
//!
//! # Architecture
//!
//! A dock is a directory holding the daemon's pid file, its control socket
//! and its data. [`Dock::discover`] first looks for a live daemon there
//! (pid file names a running process and the socket accepts connections);
//! failing that it spawns one and waits for the socket to come up.
//!
//! Only a daemon this process spawned is stopped again. Teardown happens in
//! [`Dock::slay`], which `Drop` also calls, so every exit path of a build
//! releases the daemon.
//!
//! # Example
//!
//! ```no_run
//! use strata::dock::{DaemonSettings, Dock};
//! use std::path::Path;
//!
//! let dock = Dock::discover(Path::new("dock"), &DaemonSettings::default())?;
//! if dock.is_owned() {
//!     println!("started a daemon in {}", dock.dir().display());
//! }
//! println!("talk to it at {}", dock.host());
//! # Ok::<(), strata::dock::DockError>(())
//! ```

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::core::failure::Classify;
use crate::core::paths::normalize_dir;
use crate::core::retry::{Poll, RetryPolicy};

/// File the daemon writes its pid to.
pub const PID_FILE: &str = "docker.pid";

/// The daemon's control socket.
pub const SOCKET_FILE: &str = "docker.sock";

/// Daemon output when this process spawned it.
pub const LOG_FILE: &str = "daemon.log";

/// Errors from managing the daemon.
#[derive(Debug, Error)]
pub enum DockError {
    /// The daemon binary could not be started.
    #[error("failed to start {program}: {source} (is it installed?)")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The daemon did not come up.
    #[error("container daemon in {dir} did not become available within {waited:?}{detail}")]
    Unavailable {
        dir: PathBuf,
        waited: Duration,
        detail: String,
    },

    /// Something other than a socket sits at the socket path.
    #[error("{path} is not a socket")]
    NotASocket { path: PathBuf },

    #[error("permission denied connecting to {path}; try running as root")]
    PermissionDenied { path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl DockError {
    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| DockError::Io { context, source }
    }
}

impl Classify for DockError {
    fn is_user_facing(&self) -> bool {
        !matches!(self, DockError::Io { .. })
    }
}

/// How to start and reach a daemon.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Daemon binary.
    pub program: String,
    /// Arguments; `{dir}` expands to the dock directory.
    pub args: Vec<String>,
    /// Probing for an already running daemon.
    pub probe: RetryPolicy,
    /// Waiting for a freshly spawned daemon.
    pub spawn: RetryPolicy,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            program: "dockerd".to_string(),
            args: [
                "--data-root",
                "{dir}/data",
                "--pidfile",
                "{dir}/docker.pid",
                "--host",
                "unix://{dir}/docker.sock",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            probe: RetryPolicy::PROBE,
            spawn: RetryPolicy::SPAWN,
        }
    }
}

impl DaemonSettings {
    fn expanded_args(&self, dir: &Path) -> Vec<String> {
        let dir = dir.display().to_string();
        self.args.iter().map(|a| a.replace("{dir}", &dir)).collect()
    }
}

/// Handle on a running daemon.
#[derive(Debug)]
pub struct Dock {
    dir: PathBuf,
    owned: bool,
    child: Option<Child>,
    conn: Option<UnixStream>,
}

impl Dock {
    /// Connect to the daemon in `dir`, starting one if none is running.
    pub fn discover(dir: &Path, settings: &DaemonSettings) -> Result<Self, DockError> {
        let dir = normalize_dir(dir).map_err(DockError::io(format!("resolving {}", dir.display())))?;
        if let Some(dock) = Self::load(&dir, settings)? {
            tracing::info!(dir = %dir.display(), "connected to running daemon");
            return Ok(dock);
        }
        Self::create(&dir, settings)
    }

    /// Find a live daemon in `dir`.
    fn load(dir: &Path, settings: &DaemonSettings) -> Result<Option<Self>, DockError> {
        let Some(pid) = read_pid(&dir.join(PID_FILE)) else {
            return Ok(None);
        };
        if !process_exists(pid) {
            tracing::debug!(pid, "stale pid file");
            return Ok(None);
        }
        let socket = dir.join(SOCKET_FILE);
        let conn = wait_for_socket(&socket, &settings.probe, None)?;
        Ok(conn.map(|conn| Self {
            dir: dir.to_path_buf(),
            owned: false,
            child: None,
            conn: Some(conn),
        }))
    }

    /// Spawn a daemon in `dir` and wait for it.
    fn create(dir: &Path, settings: &DaemonSettings) -> Result<Self, DockError> {
        fs::create_dir_all(dir).map_err(DockError::io(format!("creating {}", dir.display())))?;
        let log_path = dir.join(LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(DockError::io(format!("opening {}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(DockError::io(format!("opening {}", log_path.display())))?;

        // a leftover pid file names some other process, never ours
        let pid_path = dir.join(PID_FILE);
        match fs::remove_file(&pid_path) {
            Ok(()) => tracing::debug!(path = %pid_path.display(), "removed stale pid file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(DockError::io(format!("removing {}", pid_path.display()))(e)),
        }

        let args = settings.expanded_args(dir);
        let child = Command::new(&settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|source| DockError::Spawn {
                program: settings.program.clone(),
                source,
            })?;
        tracing::info!(pid = child.id(), program = %settings.program, ?args, "daemon started");

        // owned from here on, so an early return still stops it
        let mut dock = Self {
            dir: dir.to_path_buf(),
            owned: true,
            child: Some(child),
            conn: None,
        };

        let socket = dir.join(SOCKET_FILE);
        match wait_for_socket(&socket, &settings.spawn, dock.child.as_mut())? {
            Some(conn) => {
                dock.conn = Some(conn);
                Ok(dock)
            }
            None => {
                let detail = match dock.child.as_mut().map(Child::try_wait) {
                    Some(Ok(Some(status))) => format!(" (daemon exited: {status}; see {})", log_path.display()),
                    _ => format!(" (see {})", log_path.display()),
                };
                Err(DockError::Unavailable {
                    dir: dir.to_path_buf(),
                    waited: settings.spawn.patience,
                    detail,
                })
            }
        }
    }

    /// Absolute dock directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether this process spawned the daemon.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join(SOCKET_FILE)
    }

    /// Daemon address in the form runtime clients take.
    pub fn host(&self) -> String {
        format!("unix://{}", self.socket_path().display())
    }

    /// Release the daemon; stop it if this process started it.
    pub fn slay(&mut self) {
        self.conn.take();
        if !self.owned {
            return;
        }
        self.owned = false;

        if let Some(mut child) = self.child.take() {
            // the unreaped child keeps its pid reserved, so signalling it
            // cannot hit an unrelated process
            let signalled = match i32::try_from(child.id()) {
                Ok(pid) => terminate(pid),
                Err(_) => false,
            };
            if !signalled {
                if let Err(e) = child.kill() {
                    tracing::warn!(pid = child.id(), error = %e, "failed to kill daemon");
                }
            }
            // reap to avoid a zombie
            match child.wait() {
                Ok(status) => tracing::info!(pid = child.id(), %status, "daemon stopped"),
                Err(e) => tracing::warn!(pid = child.id(), error = %e, "failed to reap daemon"),
            }
        }
    }
}

impl Drop for Dock {
    fn drop(&mut self) {
        self.slay();
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    let pid = fs::read_to_string(path).ok()?.trim().parse::<i32>().ok()?;
    (pid > 0).then_some(pid)
}

/// Whether a process with `pid` exists, even one we may not signal.
fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn terminate(pid: i32) -> bool {
    // SAFETY: plain kill(2) on the pid of a child we have not reaped yet.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Wait until `path` accepts connections.
///
/// `Ok(None)` on timeout, or as soon as `child` (the daemon we are waiting
/// on) exits.
fn wait_for_socket(
    path: &Path,
    policy: &RetryPolicy,
    mut child: Option<&mut Child>,
) -> Result<Option<UnixStream>, DockError> {
    let mut exited = false;
    let found = policy.poll(|| {
        if let Some(child) = child.as_deref_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                exited = true;
                return Ok(Poll::Ready(None));
            }
        }
        match fs::metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Poll::Pending),
            Err(e) => {
                return Err(DockError::Io {
                    context: format!("checking {}", path.display()),
                    source: e,
                })
            }
            Ok(meta) if !meta.file_type().is_socket() => {
                return Err(DockError::NotASocket {
                    path: path.to_path_buf(),
                })
            }
            Ok(_) => {}
        }
        match UnixStream::connect(path) {
            Ok(conn) => Ok(Poll::Ready(Some(conn))),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(DockError::PermissionDenied {
                path: path.to_path_buf(),
            }),
            Err(_) => Ok(Poll::Pending),
        }
    })?;
    if exited {
        tracing::debug!(path = %path.display(), "daemon exited before its socket came up");
    }
    Ok(found.flatten())
}
