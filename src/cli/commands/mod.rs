//! cli::commands
//!
//! Command dispatch and handlers.
//!
//! # Architecture
//!
//! Each command handler:
//! 1. Discovers configuration from the working directory
//! 2. Plans the work and opens the image graph
//! 3. Acquires the dock only once everything local checked out
//! 4. Formats and displays output
//!
//! The dock and the runtime client are dropped before a handler returns,
//! so a daemon started for the command never outlives it.

mod build;
mod publish;
mod run;
mod unpack;
mod version;

pub use build::build;
pub use publish::publish;
pub use run::run;
pub use unpack::unpack;
pub use version::version;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::cli::args::Command;
use crate::core::config::{ConfigLoad, ContainerConfig};
use crate::dock::{DaemonSettings, Dock};
use crate::engine::{Build, BuildOptions, BuildPlan, BuildReport, Context};
use crate::runtime::DockerCli;
use crate::ui::output;

/// Dispatch a command to its handler.
pub fn dispatch(command: Command, ctx: &Context) -> Result<()> {
    match command {
        Command::Run { target, source } => run::run(ctx, &target, &source),
        Command::Build {
            target,
            source,
            destination,
            noop,
            epoch,
        } => build::build(ctx, &target, &source, &destination, BuildOptions { noop, epoch }),
        Command::Publish { target, graph } => publish::publish(ctx, &target, graph.as_deref()),
        Command::Unpack { images, graph } => unpack::unpack(ctx, &images, graph.as_deref()),
        Command::Version => version::version(ctx),
    }
}

/// Configuration discovered for a command.
struct Settings {
    cwd: PathBuf,
    load: ConfigLoad,
}

impl Settings {
    fn discover(ctx: &Context) -> Result<Self> {
        let cwd = ctx.working_dir()?;
        let load = ConfigLoad::discover(&cwd).context("loading configuration")?;
        Ok(Self { cwd, load })
    }

    /// Resolved settings for `target`, warning when no file defines it.
    fn target(&self, ctx: &Context, target: &str) -> Result<ContainerConfig> {
        if !self.load.has_target(target) {
            output::warn(
                format!("no [{target}] target in any strata.toml; using defaults"),
                ctx.verbosity(),
            );
        }
        let config = self.load.target(target);
        config.validate()?;
        Ok(config)
    }
}

/// Connect to the daemon in `dir`, starting one if needed.
fn start_dock(ctx: &Context, dir: &Path) -> Result<Dock> {
    let dock = Dock::discover(dir, &DaemonSettings::default())?;
    if dock.is_owned() {
        output::print(format!("Started a docker in {}", dock.dir().display()), ctx.verbosity());
    } else {
        output::print(format!("Connecting to docker {}", dock.dir().display()), ctx.verbosity());
    }
    Ok(dock)
}

/// Prepare the stores, then run the plan against the dock.
fn execute(ctx: &Context, settings: &Settings, plan: &BuildPlan) -> Result<BuildReport> {
    let build = Build::prepare(plan, ctx)?;
    let dock = start_dock(ctx, &settings.load.folders.dock)?;
    let runtime = DockerCli::new(&dock, ctx.debug);
    let report = build.execute(&runtime);
    drop(runtime);
    drop(dock);
    report
}
