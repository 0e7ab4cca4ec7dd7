//! runtime::docker
//!
//! [`Runtime`] over the `docker` command-line client.
//!
//! Every call is one `docker -H unix://<dock>/docker.sock ...` invocation.
//! `docker run` stays in the foreground with the container's output on the
//! terminal; the container id comes back through a cidfile and the run
//! process is reaped by [`Runtime::wait`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::Mutex;

use serde::Deserialize;

use super::{ContainerId, Runtime, RuntimeError};
use crate::core::config::ContainerConfig;
use crate::core::retry::{Poll, RetryPolicy};
use crate::core::types::ImageRef;
use crate::dock::Dock;
use crate::ui::output::{self, Verbosity};

const PROGRAM: &str = "docker";

/// Registry implied by an image name with no domain.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Runtime client driving the `docker` CLI.
#[derive(Debug)]
pub struct DockerCli {
    program: String,
    host: String,
    trace: bool,
    cid_policy: RetryPolicy,
    /// Foreground `docker run` processes by container id.
    running: Mutex<HashMap<String, Child>>,
}

/// One row of `docker images --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct ImageRow {
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
}

impl DockerCli {
    /// Client for the daemon behind `dock`; `trace` echoes every call.
    pub fn new(dock: &Dock, trace: bool) -> Self {
        Self::with_host(dock.host(), trace)
    }

    pub fn with_host(host: impl Into<String>, trace: bool) -> Self {
        Self {
            program: PROGRAM.to_string(),
            host: host.into(),
            trace,
            cid_policy: RetryPolicy::CID,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Same client, driving `program` instead of `docker`.
    #[cfg(test)]
    fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let line = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(host = %self.host, args = %line, "docker");
        if self.trace {
            output::debug(format!("{PROGRAM} {line}"), Verbosity::Debug);
        }
        let mut cmd = Command::new(&self.program);
        cmd.arg("-H").arg(&self.host).args(args);
        cmd
    }

    fn spawn_error(source: io::Error) -> RuntimeError {
        RuntimeError::Spawn {
            program: PROGRAM.to_string(),
            source,
        }
    }

    /// Run to completion, capturing output; non-zero exit is an error.
    fn output(&self, description: &str, mut cmd: Command) -> Result<Output, RuntimeError> {
        let out = cmd.stdin(Stdio::null()).output().map_err(Self::spawn_error)?;
        if !out.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: description.to_string(),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(out)
    }

    fn read_cid(&self, path: &Path, run: &mut Child) -> Result<ContainerId, RuntimeError> {
        let found = self.cid_policy.poll(|| {
            match fs::read_to_string(path) {
                Ok(content) if !content.trim().is_empty() => {
                    return Ok(Poll::Ready(ContainerId::new(content.trim())))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(RuntimeError::io(format!("reading {}", path.display()))(e)),
            }
            // a run that dies before writing the cidfile never will
            match run.try_wait() {
                Ok(Some(status)) if !status.success() => Err(RuntimeError::CommandFailed {
                    command: format!("{PROGRAM} run"),
                    status: status.to_string(),
                    stderr: String::new(),
                }),
                _ => Ok(Poll::Pending),
            }
        })?;
        found.ok_or(RuntimeError::CidUnavailable {
            waited: self.cid_policy.patience,
        })
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Flags for `docker run` from a container config, up to the image.
fn run_args(config: &ContainerConfig, cidfile: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["run".into(), "--cidfile".into(), cidfile.into()];
    args.push("-w".into());
    args.push(config.folder.clone().into());
    if config.privileged {
        args.push("--privileged".into());
    }
    for server in &config.dns {
        args.push("--dns".into());
        args.push(server.into());
    }
    for mount in &config.mounts {
        let mut spec = mount.host.clone().into_os_string();
        spec.push(format!(":{}:{}", mount.container, mount.mode()));
        args.push("-v".into());
        args.push(spec);
    }
    for port in &config.ports {
        args.push("-p".into());
        args.push(format!("{}:{}", port.host, port.container).into());
    }
    for var in &config.environment {
        args.push("-e".into());
        args.push(format!("{}={}", var.name, var.value).into());
    }
    if config.attach {
        args.push("-i".into());
        args.push("-t".into());
    }
    args.push(config.image.clone().into());
    args.extend(config.command.iter().map(OsString::from));
    args
}

/// Canonical repository name for comparing cache listings.
///
/// Registry domains are case-insensitive, and the default registry and its
/// `library/` namespace may be spelled out or left implicit.
fn canonical_repository(name: &str) -> String {
    let (first, rest) = match name.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (Some(first.to_ascii_lowercase()), rest)
        }
        _ => (None, name),
    };
    match first.as_deref() {
        None | Some(DEFAULT_REGISTRY) => rest.strip_prefix("library/").unwrap_or(rest).to_string(),
        Some(domain) => format!("{domain}/{rest}"),
    }
}

fn parse_images(listing: &str) -> Result<Vec<ImageRow>, RuntimeError> {
    listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<ImageRow>(line).map_err(|e| RuntimeError::Parse {
                context: format!("{PROGRAM} images"),
                message: e.to_string(),
            })
        })
        .collect()
}

impl Runtime for DockerCli {
    fn check_cache(&self, image: &ImageRef) -> Result<bool, RuntimeError> {
        let cmd = self.command(["images", "--format", "{{json .}}"]);
        let out = self.output("docker images", cmd)?;
        let listing = String::from_utf8_lossy(&out.stdout);
        tracing::trace!(listing = %listing, "image listing");

        let wanted = canonical_repository(image.name());
        Ok(parse_images(&listing)?
            .iter()
            .any(|row| row.tag == image.tag() && canonical_repository(&row.repository) == wanted))
    }

    fn pull(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        let description = format!("docker pull {image}");
        let mut cmd = self.command(["pull".to_string(), image.to_string()]);
        let status = cmd
            .stdin(Stdio::null())
            .status()
            .map_err(Self::spawn_error)?;
        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: description,
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    fn import(&self, stream: &mut dyn Read, image: &ImageRef) -> Result<(), RuntimeError> {
        let mut child = self
            .command(["import".to_string(), "-".to_string(), image.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Self::spawn_error)?;

        let copied = match child.stdin.take() {
            Some(mut stdin) => {
                let copied = io::copy(stream, &mut stdin).map(|_| ());
                // a truncated stream must not reach EOF and be imported
                if copied.is_err() {
                    let _ = child.kill();
                }
                copied
            }
            None => Err(io::Error::other("stdin not captured")),
        };
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let status = child.wait().map_err(RuntimeError::io("waiting for docker import"))?;
        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("docker import - {image}"),
                status: status.to_string(),
                stderr,
            });
        }
        copied.map_err(RuntimeError::io(format!("streaming {image} into docker import")))
    }

    fn launch(&self, config: &ContainerConfig) -> Result<ContainerId, RuntimeError> {
        let scratch = tempfile::Builder::new()
            .prefix("strata-cid.")
            .tempdir()
            .map_err(RuntimeError::io("creating cidfile directory"))?;
        // docker refuses a cidfile that already exists
        let cidfile: PathBuf = scratch.path().join("cid");

        let mut cmd = self.command(run_args(config, &cidfile));
        if !config.attach {
            cmd.stdin(Stdio::null());
        }
        let mut run = cmd.spawn().map_err(Self::spawn_error)?;

        match self.read_cid(&cidfile, &mut run) {
            Ok(id) => {
                self.running().insert(id.to_string(), run);
                Ok(id)
            }
            Err(e) => {
                let _ = run.kill();
                let _ = run.wait();
                Err(e)
            }
        }
    }

    fn wait(&self, id: &ContainerId) -> Result<i32, RuntimeError> {
        let cmd = self.command(["wait", id.as_str()]);
        let out = self.output(&format!("docker wait {id}"), cmd)?;
        let text = String::from_utf8_lossy(&out.stdout);
        let code = text.trim().parse::<i32>().map_err(|e| RuntimeError::Parse {
            context: format!("docker wait {id}"),
            message: format!("{e}: {:?}", text.trim()),
        })?;

        let run = self.running().remove(id.as_str());
        if let Some(mut run) = run {
            run.wait().map_err(RuntimeError::io("waiting for docker run"))?;
        }
        Ok(code)
    }

    fn purge(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let cmd = self.command(["rm", id.as_str()]);
        self.output(&format!("docker rm {id}"), cmd).map(|_| ())
    }

    fn export(&self, id: &ContainerId, writer: &mut dyn Write) -> Result<(), RuntimeError> {
        let mut child = self
            .command(["export", id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Self::spawn_error)?;

        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, writer).map(|_| ()),
            None => Err(io::Error::other("stdout not captured")),
        };
        if copied.is_err() {
            let _ = child.kill();
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let status = child.wait().map_err(RuntimeError::io("waiting for docker export"))?;
        copied.map_err(RuntimeError::io(format!("streaming export of {id}")))?;
        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("docker export {id}"),
                status: status.to_string(),
                stderr,
            });
        }
        Ok(())
    }

    fn commit(&self, id: &ContainerId, image: &ImageRef) -> Result<(), RuntimeError> {
        let cmd = self.command(["commit".to_string(), id.to_string(), image.to_string()]);
        self.output(&format!("docker commit {id} {image}"), cmd).map(|_| ())
    }
}

impl Drop for DockerCli {
    fn drop(&mut self) {
        for (id, mut run) in self.running().drain() {
            tracing::debug!(id = %id, "reaping docker run");
            let _ = run.wait();
        }
    }
}
