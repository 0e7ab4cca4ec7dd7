//! core::config
//!
//! Configuration discovery and target resolution.
//!
//! # Overview
//!
//! Configuration lives in `strata.toml` files. Discovery starts in the
//! working directory and walks upward for as long as each directory holds a
//! `strata.toml`, so a project nested in another inherits its settings.
//!
//! # Precedence
//!
//! Values are resolved in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Outermost file, `[default]` then the selected target
//! 3. ... each nested file in turn ...
//! 4. Innermost file, `[default]` then the selected target
//!
//! Scalars override; `mounts`, `ports`, `dns` and `environment` append.
//!
//! # Folders
//!
//! The dock and graph folders default to `dock/` and `graph/` in the
//! starting directory. A config directory that contains such a folder
//! claims it, and the outermost claim wins.
//!
//! # Example
//!
//! ```no_run
//! use strata::core::config::ConfigLoad;
//! use std::path::Path;
//!
//! let load = ConfigLoad::discover(Path::new("/path/to/project")).unwrap();
//! let config = load.target("build");
//! println!("building {} from {}", config.image, config.upstream);
//! println!("graph at {}", load.folders.graph.display());
//! ```

pub mod schema;

pub use schema::{ConfigFile, EnvVar, Mount, PortForward, TargetOverlay};

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::failure::Classify;

/// Name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "strata.toml";

/// Target applied to every other target.
pub const DEFAULT_TARGET: &str = "default";

/// Folder holding the daemon's state.
pub const DOCK_FOLDER: &str = "dock";

/// Folder holding the image graph.
pub const GRAPH_FOLDER: &str = "graph";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

impl Classify for ConfigError {
    fn is_user_facing(&self) -> bool {
        true
    }
}

/// Where the daemon and graph state live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folders {
    pub dock: PathBuf,
    pub graph: PathBuf,
}

impl Folders {
    /// Default folders under `dir`.
    pub fn under(dir: &Path) -> Self {
        Self {
            dock: dir.join(DOCK_FOLDER),
            graph: dir.join(GRAPH_FOLDER),
        }
    }
}

/// Fully resolved settings for one container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    pub upstream: String,
    pub index: String,
    pub command: Vec<String>,
    pub folder: String,
    pub privileged: bool,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortForward>,
    pub dns: Vec<String>,
    pub attach: bool,
    pub purge: bool,
    pub environment: Vec<EnvVar>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu".to_string(),
            upstream: String::new(),
            index: String::new(),
            command: vec!["/bin/echo".to_string(), "Hello from strata!".to_string()],
            folder: "/".to_string(),
            privileged: false,
            mounts: Vec::new(),
            ports: Vec::new(),
            dns: Vec::new(),
            attach: false,
            purge: false,
            environment: Vec::new(),
        }
    }
}

impl ContainerConfig {
    /// Apply one overlay on top of these settings.
    pub fn apply(&mut self, overlay: &TargetOverlay) {
        if let Some(image) = &overlay.image {
            self.image = image.clone();
        }
        if let Some(upstream) = &overlay.upstream {
            self.upstream = upstream.clone();
        }
        if let Some(index) = &overlay.index {
            self.index = index.clone();
        }
        if let Some(command) = &overlay.command {
            self.command = command.clone();
        }
        if let Some(folder) = &overlay.folder {
            self.folder = folder.clone();
        }
        if let Some(privileged) = overlay.privileged {
            self.privileged = privileged;
        }
        if let Some(attach) = overlay.attach {
            self.attach = attach;
        }
        if let Some(purge) = overlay.purge {
            self.purge = purge;
        }
        self.mounts.extend(overlay.mounts.iter().flatten().cloned());
        self.ports.extend(overlay.ports.iter().flatten().cloned());
        self.dns.extend(overlay.dns.iter().flatten().cloned());
        self.environment
            .extend(overlay.environment.iter().flatten().cloned());
    }

    /// Check the resolved settings can actually launch something.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.is_empty() {
            return Err(ConfigError::InvalidValue("image cannot be empty".into()));
        }
        if self.command.is_empty() {
            return Err(ConfigError::InvalidValue("command cannot be empty".into()));
        }
        Ok(())
    }
}

/// A config file found during discovery.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    /// Directory holding the file; mount paths are relative to it.
    pub dir: PathBuf,
    pub targets: ConfigFile,
}

/// All configuration discovered from a starting directory.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    /// Outermost first.
    pub files: Vec<LoadedFile>,
    pub folders: Folders,
}

impl ConfigLoad {
    /// Discover configuration starting at `dir` and walking upward.
    ///
    /// `dir` should be absolute; a relative path is resolved against the
    /// process working directory.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let start = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| ConfigError::ReadError {
                    path: dir.to_path_buf(),
                    source,
                })?
                .join(dir)
        };

        let mut folders = Folders::under(&start);
        let mut files = Vec::new();
        let mut current = Some(start.as_path());

        while let Some(dir) = current {
            let path = dir.join(CONFIG_FILE_NAME);
            if !path.is_file() {
                break;
            }
            let mut targets = Self::parse_file(&path)?;
            for overlay in targets.values_mut() {
                overlay.localize(dir);
            }
            if dir.join(DOCK_FOLDER).is_dir() {
                folders.dock = dir.join(DOCK_FOLDER);
            }
            if dir.join(GRAPH_FOLDER).is_dir() {
                folders.graph = dir.join(GRAPH_FOLDER);
            }
            files.push(LoadedFile {
                dir: dir.to_path_buf(),
                targets,
            });
            current = dir.parent();
        }

        files.reverse();
        tracing::debug!(files = files.len(), dock = %folders.dock.display(), graph = %folders.graph.display(), "loaded configuration");
        Ok(Self { files, folders })
    }

    fn parse_file(path: &Path) -> Result<ConfigFile, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Resolve the settings for a target.
    pub fn target(&self, name: &str) -> ContainerConfig {
        let mut config = ContainerConfig::default();
        for file in &self.files {
            if let Some(overlay) = file.targets.get(DEFAULT_TARGET) {
                config.apply(overlay);
            }
            if name != DEFAULT_TARGET {
                if let Some(overlay) = file.targets.get(name) {
                    config.apply(overlay);
                }
            }
        }
        config
    }

    /// Whether any discovered file defines `name`.
    pub fn has_target(&self, name: &str) -> bool {
        self.files.iter().any(|f| f.targets.contains_key(name))
    }
}
