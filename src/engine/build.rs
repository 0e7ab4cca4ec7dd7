//! engine::build
//!
//! Carrying out a [`BuildPlan`] against a runtime.
//!
//! # Stream handoff
//!
//! Moving an image between the graph and the daemon pairs a graph call on
//! the current thread with a runtime call on a scoped worker, joined by a
//! [`pipe`]. Whichever side finishes first closes its end, so the other
//! never waits forever. When both fail, the error of the side that failed
//! first is reported rather than the broken pipe it caused.

use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use thiserror::Error;

use super::plan::{BuildPlan, Destination, Source};
use super::Context;
use crate::core::failure::Classify;
use crate::core::types::{ImageRef, LineageName, Oid, TypeError};
use crate::graph::{Graph, GraphError};
use crate::runtime::{Container, ContainerId, Runtime, RuntimeError};
use crate::transfer::{pipe, ArchiveOptions, TarPlace, TarReceive};
use crate::ui::output::{self, Verbosity};

/// Errors specific to orchestrating a build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("destination {destination} is not supported yet")]
    UnsupportedDestination { destination: String },

    #[error("image {lineage} not found in graph {}", .dir.display())]
    LineageMissing { lineage: String, dir: PathBuf },

    #[error("docker does not have {image} loaded")]
    NotCached { image: String },

    #[error("tar location is the same for source and destination: {}", .path.display())]
    PathCollision { path: PathBuf },

    #[error("no {key} image configured for this target")]
    ImageUnset { key: &'static str },

    #[error("container {id} exited with status {code}")]
    ContainerFailed { id: String, code: i32 },

    #[error(transparent)]
    InvalidName(#[from] TypeError),
}

impl Classify for BuildError {
    fn is_user_facing(&self) -> bool {
        true
    }
}

/// What a build did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub container: ContainerId,
    pub exit_code: i32,
    /// Whether the run image had to be brought into the cache.
    pub imported: bool,
    /// Snapshot published to the graph, if any.
    pub published: Option<Oid>,
    /// Archive written, if any.
    pub exported: Option<PathBuf>,
}

/// A build whose stores are open and ready.
#[derive(Debug)]
pub struct Build<'p> {
    plan: &'p BuildPlan,
    ctx: Context,
    source_graph: Option<Graph>,
    destination_graph: Option<Graph>,
}

impl<'p> Build<'p> {
    /// Open and cleanse the graph stores the plan uses.
    ///
    /// Publishing needs a committer identity, so that is checked here too,
    /// before any container work starts.
    pub fn prepare(plan: &'p BuildPlan, ctx: &Context) -> Result<Self> {
        let verbosity = ctx.verbosity();

        let source_graph = match &plan.source {
            Source::Graph { dir, .. } => {
                let graph = Graph::new(dir).with_context(|| format!("opening graph {}", dir.display()))?;
                output::print(format!("Opening source graph {}", graph.dir().display()), verbosity);
                graph.cleanse()?;
                Some(graph)
            }
            _ => None,
        };

        let destination_graph = match &plan.destination {
            Destination::Graph { dir, .. } => {
                let graph = Graph::new(dir).with_context(|| format!("opening graph {}", dir.display()))?;
                let shared = source_graph.as_ref().is_some_and(|s| s.dir() == graph.dir());
                if !shared {
                    output::print(format!("Opening destination graph {}", graph.dir().display()), verbosity);
                    graph.cleanse()?;
                }
                graph.signature()?;
                Some(graph)
            }
            _ => None,
        };

        Ok(Self {
            plan,
            ctx: ctx.clone(),
            source_graph,
            destination_graph,
        })
    }

    /// Fill the cache, run the container, and deliver the result.
    pub fn execute(&self, runtime: &dyn Runtime) -> Result<BuildReport> {
        let plan = self.plan;
        let verbosity = self.ctx.verbosity();

        let imported = self.fill_cache(runtime)?;

        output::print("Launching container.", verbosity);
        let container = Container::launch(runtime, &plan.run)?;
        let exit_code = container.wait()?;
        if exit_code != 0 {
            if plan.require_success {
                if plan.run.purge {
                    container.purge()?;
                }
                return Err(BuildError::ContainerFailed {
                    id: container.id().to_string(),
                    code: exit_code,
                }
                .into());
            }
            output::warn(format!("container exited with status {exit_code}"), verbosity);
        }

        let mut report = BuildReport {
            container: container.id().clone(),
            exit_code,
            imported,
            published: None,
            exported: None,
        };

        match &plan.destination {
            Destination::Graph { lineage, ancestor, .. } => {
                let graph = self.destination_graph()?;
                output::print("Committing to graph...", verbosity);
                let oid = export_to_graph(graph, lineage, ancestor.as_ref(), &container)?;
                output::print(format!("Published {} as {}", lineage, oid.short(7)), verbosity);
                report.published = Some(oid);
            }
            Destination::File { path } => {
                output::print(format!("Exporting to {}", path.display()), verbosity);
                container.export_to_file(path)?;
                report.exported = Some(path.clone());
            }
            Destination::Docker => {}
        }

        output::print(format!("Exporting to docker cache: {}", plan.output), verbosity);
        container.commit(&plan.output)?;

        if plan.run.purge {
            container.purge()?;
        }
        Ok(report)
    }

    /// Make the run image available; returns whether anything was imported.
    fn fill_cache(&self, runtime: &dyn Runtime) -> Result<bool> {
        let plan = self.plan;
        let verbosity = self.ctx.verbosity();
        let image = plan.run_image();
        let cached = runtime.check_cache(&image)?;

        match &plan.source {
            Source::Docker => {
                if !cached {
                    return Err(BuildError::NotCached {
                        image: image.to_string(),
                    }
                    .into());
                }
                Ok(false)
            }
            Source::Graph { lineage, .. } => {
                if cached {
                    output::print(
                        format!("Docker already has {image} loaded, not importing from graph."),
                        verbosity,
                    );
                    return Ok(false);
                }
                let graph = self.source_graph()?;
                if !graph.has_lineage(lineage)? {
                    return Err(BuildError::LineageMissing {
                        lineage: lineage.to_string(),
                        dir: graph.dir().to_path_buf(),
                    }
                    .into());
                }
                output::print(format!("Importing {image} from graph lineage {lineage}"), verbosity);
                import_from_graph(graph, lineage, &image, runtime, ArchiveOptions { epoch: plan.epoch })?;
                Ok(true)
            }
            Source::File { path } => {
                if cached {
                    self.warn_overwrite(&format!(
                        "your docker cache already has {image} loaded.\nImporting will overwrite the saved image."
                    ));
                }
                output::print(format!("Importing {} as {image}", path.display()), verbosity);
                runtime
                    .import_from_file(path, &image)
                    .with_context(|| format!("importing {}", path.display()))?;
                Ok(true)
            }
            Source::Index => {
                if cached {
                    self.warn_overwrite(&format!(
                        "your docker cache already has {image} loaded.\nPulling from the index may modify the saved image."
                    ));
                }
                runtime.pull(&image)?;
                Ok(true)
            }
        }
    }

    fn warn_overwrite(&self, message: &str) {
        let grace = self.ctx.overwrite_grace;
        let verbosity = self.ctx.verbosity();
        if grace.is_zero() {
            output::warn(message, verbosity);
            return;
        }
        output::warn(
            format!(
                "{message}\n\nContinuing in {} seconds, hit Ctrl-C to cancel...",
                grace.as_secs()
            ),
            verbosity,
        );
        thread::sleep(grace);
    }

    fn source_graph(&self) -> Result<&Graph> {
        self.source_graph
            .as_ref()
            .ok_or_else(|| anyhow!("source graph was not opened"))
    }

    fn destination_graph(&self) -> Result<&Graph> {
        self.destination_graph
            .as_ref()
            .ok_or_else(|| anyhow!("destination graph was not opened"))
    }
}

/// Stream the tip of `lineage` into the daemon cache as `image`.
pub fn import_from_graph(
    graph: &Graph,
    lineage: &LineageName,
    image: &ImageRef,
    runtime: &dyn Runtime,
    options: ArchiveOptions,
) -> Result<Oid> {
    let (writer, reader) = pipe();

    let (loaded, imported) = thread::scope(|scope| {
        let importer = scope.spawn(move || {
            let mut reader = reader;
            runtime.import(&mut reader, image)
        });

        let mut receive = TarReceive::new(writer, options);
        let loaded = graph.load_lineage(lineage, &mut receive);
        receive.into_inner().finish(&loaded);

        (loaded, importer.join())
    });

    let imported = imported.map_err(|_| anyhow!("import of {image} panicked"))?;
    match (loaded, imported) {
        (Ok(oid), Ok(())) => {
            tracing::debug!(%lineage, %oid, %image, "imported from graph");
            Ok(oid)
        }
        (Err(load), Err(import)) if is_broken_pipe(&load) => Err(import.into()),
        (Err(load), _) => Err(anyhow::Error::new(load).context(format!("loading {lineage} from graph"))),
        (Ok(_), Err(import)) => Err(import.into()),
    }
}

/// Publish the container's filesystem as the next snapshot of `lineage`.
pub fn export_to_graph(
    graph: &Graph,
    lineage: &LineageName,
    ancestor: Option<&LineageName>,
    container: &Container<'_>,
) -> Result<Oid> {
    let (writer, reader) = pipe();

    let (published, exported) = thread::scope(|scope| {
        let exporter = scope.spawn(move || {
            let mut writer = writer;
            let result = container.export(&mut writer);
            writer.finish(&result);
            result
        });

        let published = {
            let mut place = TarPlace::new(reader);
            graph.publish(lineage, ancestor, &mut place)
        };

        (published, exporter.join())
    });

    let exported = exported.map_err(|_| anyhow!("export of container {} panicked", container.id()))?;
    match (published, exported) {
        (Ok(oid), Ok(())) => Ok(oid),
        (Err(_), Err(export)) if !is_export_broken_pipe(&export) => Err(export.into()),
        (Err(publish), _) => Err(anyhow::Error::new(publish).context(format!("publishing {lineage}"))),
        (Ok(_), Err(export)) => Err(export.into()),
    }
}

fn is_broken_pipe(err: &GraphError) -> bool {
    matches!(err, GraphError::Transfer(t) if t.is_broken_pipe())
}

fn is_export_broken_pipe(err: &RuntimeError) -> bool {
    matches!(err, RuntimeError::Io { source, .. } if source.kind() == std::io::ErrorKind::BrokenPipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ContainerConfig, Folders};
    use crate::core::types::ImagePath;
    use crate::engine::plan::BuildOptions;
    use crate::runtime::mock::{FailOn, MockOperation, MockRuntime};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ctx() -> Context {
        Context {
            quiet: true,
            overwrite_grace: Duration::ZERO,
            ..Context::default()
        }
    }

    fn plan(cwd: &Path, source: &str, destination: &str) -> BuildPlan {
        let config = ContainerConfig {
            image: "app".into(),
            upstream: "base".into(),
            ..ContainerConfig::default()
        };
        BuildPlan::build(
            config,
            &source.parse::<ImagePath>().unwrap(),
            &destination.parse::<ImagePath>().unwrap(),
            &Folders::under(cwd),
            cwd,
            BuildOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn docker_source_requires_cached_image() {
        let temp = TempDir::new().unwrap();
        let plan = plan(temp.path(), "docker", "docker");
        let build = Build::prepare(&plan, &ctx()).unwrap();
        let err = build.execute(&MockRuntime::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::NotCached { .. })
        ));
    }

    #[test]
    fn docker_to_docker_commits_output() {
        let temp = TempDir::new().unwrap();
        let plan = plan(temp.path(), "docker", "docker");
        let runtime = MockRuntime::new().with_cached(["base"]);
        let report = Build::prepare(&plan, &ctx()).unwrap().execute(&runtime).unwrap();
        assert!(!report.imported);
        assert!(runtime.is_cached("app:latest"));
        assert_eq!(
            runtime.count(|op| matches!(op, MockOperation::Commit { image, .. } if image == "app:latest")),
            1
        );
    }

    #[test]
    fn failed_container_stops_build() {
        let temp = TempDir::new().unwrap();
        let plan = plan(temp.path(), "docker", "docker");
        let runtime = MockRuntime::new().with_cached(["base"]).with_exit_code(3);
        let err = Build::prepare(&plan, &ctx()).unwrap().execute(&runtime).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ContainerFailed { code: 3, .. })
        ));
        assert!(!runtime.is_cached("app"));
    }

    #[test]
    fn index_source_pulls() {
        let temp = TempDir::new().unwrap();
        let config = ContainerConfig {
            image: "app".into(),
            index: "ubuntu:14.04".into(),
            ..ContainerConfig::default()
        };
        let plan = BuildPlan::build(
            config,
            &"index".parse().unwrap(),
            &"docker".parse().unwrap(),
            &Folders::under(temp.path()),
            temp.path(),
            BuildOptions::default(),
        )
        .unwrap();
        let runtime = MockRuntime::new();
        Build::prepare(&plan, &ctx()).unwrap().execute(&runtime).unwrap();
        assert_eq!(
            runtime.count(|op| matches!(op, MockOperation::Pull { image } if image == "ubuntu:14.04")),
            1
        );
    }

    #[test]
    fn launch_failure_surfaces() {
        let temp = TempDir::new().unwrap();
        let plan = plan(temp.path(), "docker", "docker");
        let runtime = MockRuntime::new().with_cached(["base"]).fail_on(FailOn::Launch);
        let err = Build::prepare(&plan, &ctx()).unwrap().execute(&runtime).unwrap_err();
        assert!(err.downcast_ref::<RuntimeError>().is_some());
    }
}
