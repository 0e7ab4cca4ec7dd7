//! engine
//!
//! Orchestrates a build: Plan -> Acquire dock -> Fill cache -> Launch -> Finalize.
//!
//! # Architecture
//!
//! Commands resolve configuration, then hand the engine a source and a
//! destination [`ImagePath`](crate::core::types::ImagePath):
//!
//! 1. **Plan**: [`plan::BuildPlan`] turns config and paths into a fixed
//!    recipe without touching the daemon or the graph
//! 2. **Open**: graph stores are opened and cleansed
//! 3. **Fill cache**: the image to run is made available to the daemon
//!    (import from the graph or a file, pull from the index, or require it)
//! 4. **Launch**: the container runs to completion
//! 5. **Finalize**: the result is published to the graph or written to a
//!    file, committed into the daemon cache under its configured name, and
//!    purged if configured
//!
//! The dock itself is acquired by the caller between opening the stores and
//! filling the cache, and released by dropping it, so a failure at any step
//! still tears down a daemon this process started.
//!
//! # Example
//!
//! ```ignore
//! let plan = BuildPlan::build(config, &source, &destination, &folders, &cwd, options)?;
//! let build = Build::prepare(&plan, ctx)?;
//! let dock = Dock::discover(&folders.dock, &DaemonSettings::default())?;
//! let runtime = DockerCli::new(&dock, ctx.debug);
//! let report = build.execute(&runtime)?;
//! ```

pub mod build;
pub mod plan;

pub use build::{Build, BuildError, BuildReport};
pub use plan::{BuildOptions, BuildPlan, Destination, Source};

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::ui::output::Verbosity;

/// Pause before overwriting an image the daemon already has.
pub const DEFAULT_OVERWRITE_GRACE: Duration = Duration::from_secs(10);

/// Execution context for commands.
///
/// Contains global settings derived from CLI flags that affect command behavior.
#[derive(Debug, Clone)]
pub struct Context {
    /// Working directory override.
    pub cwd: Option<PathBuf>,
    /// Trace every daemon call and show full error chains.
    pub debug: bool,
    /// Quiet mode (minimal output).
    pub quiet: bool,
    /// How long to wait, after warning, before clobbering a cached image.
    pub overwrite_grace: Duration,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            cwd: None,
            debug: false,
            quiet: false,
            overwrite_grace: DEFAULT_OVERWRITE_GRACE,
        }
    }
}

impl Context {
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.debug)
    }

    /// The directory commands resolve relative paths and config against.
    pub fn working_dir(&self) -> Result<PathBuf> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        Ok(match &self.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => cwd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context() {
        let ctx = Context::default();
        assert_eq!(ctx.overwrite_grace, Duration::from_secs(10));
        assert_eq!(ctx.verbosity(), Verbosity::Normal);
    }

    #[test]
    fn quiet_beats_debug() {
        let ctx = Context {
            quiet: true,
            debug: true,
            ..Context::default()
        };
        assert_eq!(ctx.verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn relative_cwd_is_joined() {
        let ctx = Context {
            cwd: Some(PathBuf::from("sub")),
            ..Context::default()
        };
        let dir = ctx.working_dir().unwrap();
        assert!(dir.is_absolute());
        assert!(dir.ends_with("sub"));
    }
}
