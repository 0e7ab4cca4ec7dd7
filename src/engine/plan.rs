//! engine::plan
//!
//! Resolving a build request into a fixed recipe.
//!
//! # Invariants
//!
//! - Planning reads no daemon or graph state
//! - Every path in a plan is absolute
//! - An `index` destination never produces a plan
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use strata::core::config::{ContainerConfig, Folders};
//! use strata::core::types::ImagePath;
//! use strata::engine::plan::{BuildOptions, BuildPlan, Destination, Source};
//!
//! let config = ContainerConfig {
//!     image: "polydawn/app".into(),
//!     upstream: "polydawn/base".into(),
//!     ..ContainerConfig::default()
//! };
//! let cwd = Path::new("/work");
//! let plan = BuildPlan::build(
//!     config,
//!     &"graph".parse::<ImagePath>().unwrap(),
//!     &"file:out.tar".parse::<ImagePath>().unwrap(),
//!     &Folders::under(cwd),
//!     cwd,
//!     BuildOptions::default(),
//! )
//! .unwrap();
//!
//! assert_eq!(plan.run.image, "polydawn/base");
//! assert_eq!(plan.output.to_string(), "polydawn/app:latest");
//! assert!(matches!(plan.source, Source::Graph { .. }));
//! assert!(matches!(&plan.destination, Destination::File { path } if path == Path::new("/work/out.tar")));
//! ```

use std::path::{Path, PathBuf};

use super::build::BuildError;
use crate::core::config::{ContainerConfig, Folders};
use crate::core::types::{ImagePath, ImageRef, LineageName, Scheme};

/// Archive used when a `file` path is left empty.
pub const DEFAULT_ARCHIVE: &str = "image.tar";

/// Command a no-op build runs instead of the configured one.
pub const NOOP_COMMAND: &str = "/bin/true";

/// Flags that change how a build runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Run `/bin/true` and write the result back under the upstream name.
    pub noop: bool,
    /// Normalize timestamps in archives produced from the graph.
    pub epoch: bool,
}

/// Where the image to run comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A lineage in an image graph, imported unless already cached.
    Graph { dir: PathBuf, lineage: LineageName },
    /// A tar archive on disk.
    File { path: PathBuf },
    /// The daemon's cache; the image must already be there.
    Docker,
    /// The public registry.
    Index,
}

/// Where the result goes, besides the daemon cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Published as a new snapshot of `lineage`.
    Graph {
        dir: PathBuf,
        lineage: LineageName,
        ancestor: Option<LineageName>,
    },
    /// Exported as a tar archive.
    File { path: PathBuf },
    /// Only committed into the daemon cache.
    Docker,
}

/// A resolved build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub source: Source,
    pub destination: Destination,
    /// Container settings; `image` is the image the container runs.
    pub run: ContainerConfig,
    /// Name the result is committed under in the daemon cache.
    pub output: ImageRef,
    /// A non-zero exit of the container fails the build.
    pub require_success: bool,
    pub epoch: bool,
}

impl BuildPlan {
    /// Plan a transformation from `upstream` to `image`.
    ///
    /// The container runs the upstream image (or the index key when pulling
    /// from the index) and the result is saved under the configured image.
    pub fn build(
        mut config: ContainerConfig,
        source: &ImagePath,
        destination: &ImagePath,
        folders: &Folders,
        cwd: &Path,
        options: BuildOptions,
    ) -> Result<Self, BuildError> {
        if destination.scheme == Scheme::Index {
            return Err(BuildError::UnsupportedDestination {
                destination: destination.to_string(),
            });
        }
        if options.noop {
            config.command = vec![NOOP_COMMAND.to_string()];
            config.image = config.upstream.clone();
        }

        let output = config.image.clone();
        let run_image = match source.scheme {
            Scheme::Index => required(&config.index, "index")?,
            _ => required(&config.upstream, "upstream")?,
        };

        let source = resolve_source(source, &run_image, folders, cwd)?;
        let destination = match destination.scheme {
            Scheme::Graph => Destination::Graph {
                dir: resolve_graph(destination, folders, cwd),
                lineage: LineageName::from_image(&output)?,
                ancestor: match config.upstream.as_str() {
                    "" => None,
                    upstream => Some(LineageName::from_image(upstream)?),
                },
            },
            Scheme::File => {
                let path = resolve_file(destination, cwd);
                if matches!(&source, Source::File { path: from } if *from == path) {
                    return Err(BuildError::PathCollision { path });
                }
                Destination::File { path }
            }
            Scheme::Docker => Destination::Docker,
            Scheme::Index => {
                return Err(BuildError::UnsupportedDestination {
                    destination: destination.to_string(),
                })
            }
        };

        config.image = run_image;
        Ok(Self {
            source,
            destination,
            output: ImageRef::parse(&output),
            run: config,
            require_success: true,
            epoch: options.epoch,
        })
    }

    /// Plan a plain run of the configured image.
    ///
    /// The result is committed back under the same name; a failing command
    /// does not prevent that.
    pub fn run(
        mut config: ContainerConfig,
        source: &ImagePath,
        folders: &Folders,
        cwd: &Path,
        options: BuildOptions,
    ) -> Result<Self, BuildError> {
        let output = required(&config.image, "image")?;
        let run_image = match source.scheme {
            Scheme::Index => required(&config.index, "index")?,
            _ => output.clone(),
        };
        let source = resolve_source(source, &run_image, folders, cwd)?;
        config.image = run_image;
        Ok(Self {
            source,
            destination: Destination::Docker,
            output: ImageRef::parse(&output),
            run: config,
            require_success: false,
            epoch: options.epoch,
        })
    }

    /// The image the container runs.
    pub fn run_image(&self) -> ImageRef {
        ImageRef::parse(&self.run.image)
    }
}

fn required(value: &str, key: &'static str) -> Result<String, BuildError> {
    if value.is_empty() {
        Err(BuildError::ImageUnset { key })
    } else {
        Ok(value.to_string())
    }
}

fn resolve_source(
    source: &ImagePath,
    run_image: &str,
    folders: &Folders,
    cwd: &Path,
) -> Result<Source, BuildError> {
    Ok(match source.scheme {
        Scheme::Graph => Source::Graph {
            dir: resolve_graph(source, folders, cwd),
            lineage: LineageName::from_image(run_image)?,
        },
        Scheme::File => Source::File {
            path: resolve_file(source, cwd),
        },
        Scheme::Docker => Source::Docker,
        Scheme::Index => Source::Index,
    })
}

fn resolve_graph(path: &ImagePath, folders: &Folders, cwd: &Path) -> PathBuf {
    if path.path.is_empty() {
        folders.graph.clone()
    } else {
        absolute(cwd, &path.path)
    }
}

fn resolve_file(path: &ImagePath, cwd: &Path) -> PathBuf {
    absolute(cwd, path.path_or(DEFAULT_ARCHIVE))
}

fn absolute(cwd: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    // drop `.` components so ./image.tar and image.tar compare equal
    joined.components().collect()
}
