//! runtime
//!
//! Control calls against the container runtime.
//!
//! # Architecture
//!
//! [`Runtime`] is the seam between the build orchestrator and the daemon.
//! [`DockerCli`] drives the `docker` client against a [`Dock`](crate::dock::Dock)
//! socket; [`mock::MockRuntime`] keeps everything in memory for tests.
//!
//! Calls are blocking and may be issued from a worker thread while the
//! caller streams the other end of an import or export, so implementations
//! are `Send + Sync`.
//!
//! # Example
//!
//! ```ignore
//! let runtime = DockerCli::new(&dock, ctx.debug);
//! let container = Container::launch(&runtime, &config)?;
//! let code = container.wait()?;
//! container.commit(&ImageRef::parse(&config.image))?;
//! ```

mod docker;
pub mod mock;

pub use docker::DockerCli;

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::core::config::ContainerConfig;
use crate::core::failure::Classify;
use crate::core::types::ImageRef;

/// Errors from runtime calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The client binary could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The runtime rejected a call.
    #[error("`{command}` failed ({status}){}", format_stderr(.stderr))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The container never reported its id.
    #[error("container did not report an id within {waited:?}")]
    CidUnavailable { waited: std::time::Duration },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Output from the runtime made no sense.
    #[error("unexpected output from {context}: {message}")]
    Parse { context: String, message: String },
}

fn format_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl RuntimeError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| RuntimeError::Io { context, source }
    }
}

impl Classify for RuntimeError {
    fn is_user_facing(&self) -> bool {
        matches!(
            self,
            RuntimeError::Spawn { .. } | RuntimeError::CommandFailed { .. } | RuntimeError::CidUnavailable { .. }
        )
    }
}

/// Identifier the daemon assigned to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the orchestrator needs from a container runtime.
pub trait Runtime: Send + Sync {
    /// Whether `image` is in the daemon's cache.
    fn check_cache(&self, image: &ImageRef) -> Result<bool, RuntimeError>;

    /// Fetch `image` from its registry.
    fn pull(&self, image: &ImageRef) -> Result<(), RuntimeError>;

    /// Import a filesystem archive read from `stream` as `image`.
    fn import(&self, stream: &mut dyn Read, image: &ImageRef) -> Result<(), RuntimeError>;

    /// Import a filesystem archive file as `image`.
    fn import_from_file(&self, path: &Path, image: &ImageRef) -> Result<(), RuntimeError> {
        let mut file = File::open(path).map_err(RuntimeError::io(format!("opening {}", path.display())))?;
        self.import(&mut file, image)
    }

    /// Start a container; returns once the daemon has assigned an id.
    fn launch(&self, config: &ContainerConfig) -> Result<ContainerId, RuntimeError>;

    /// Block until the container exits; returns its exit code.
    fn wait(&self, id: &ContainerId) -> Result<i32, RuntimeError>;

    /// Delete a stopped container.
    fn purge(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Stream the container's filesystem as a tar archive.
    fn export(&self, id: &ContainerId, writer: &mut dyn Write) -> Result<(), RuntimeError>;

    /// Save the container's filesystem into the cache as `image`.
    fn commit(&self, id: &ContainerId, image: &ImageRef) -> Result<(), RuntimeError>;
}

/// A launched container.
pub struct Container<'a> {
    runtime: &'a dyn Runtime,
    id: ContainerId,
}

impl fmt::Debug for Container<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<'a> Container<'a> {
    /// Launch a container described by `config`.
    pub fn launch(runtime: &'a dyn Runtime, config: &ContainerConfig) -> Result<Self, RuntimeError> {
        let id = runtime.launch(config)?;
        tracing::debug!(id = %id, image = %config.image, "container launched");
        Ok(Self { runtime, id })
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn wait(&self) -> Result<i32, RuntimeError> {
        self.runtime.wait(&self.id)
    }

    pub fn purge(&self) -> Result<(), RuntimeError> {
        self.runtime.purge(&self.id)
    }

    pub fn export(&self, writer: &mut dyn Write) -> Result<(), RuntimeError> {
        self.runtime.export(&self.id, writer)
    }

    /// Export the filesystem into a tar file at `path`, replacing it.
    pub fn export_to_file(&self, path: &Path) -> Result<(), RuntimeError> {
        let context = format!("writing {}", path.display());
        let file = File::create(path).map_err(RuntimeError::io(context.clone()))?;
        let mut writer = BufWriter::new(file);
        self.export(&mut writer)?;
        writer.flush().map_err(RuntimeError::io(context))
    }

    pub fn commit(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        self.runtime.commit(&self.id, image)
    }
}
