//! core::config::schema
//!
//! Configuration schema types.
//!
//! # File Format
//!
//! A `strata.toml` holds one table per target. `[default]` applies to every
//! target; a named table applies on top of it when that target is selected.
//!
//! ```toml
//! [default]
//! image = "polydawn/base"
//! upstream = "ubuntu"
//! index = "ubuntu:14.04"
//! mounts = [["...", "/strata", "ro"]]
//!
//! [build]
//! command = ["/strata/build.sh"]
//! purge = true
//!
//! [run]
//! attach = true
//! command = ["/bin/bash"]
//! ports = [["8080", "80"]]
//! environment = [["LANG", "C.UTF-8"]]
//! ```
//!
//! # Validation
//!
//! Unknown keys are rejected. List entries are validated while parsing, so
//! a malformed mount is reported with the file it came from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::ConfigError;

/// One parsed `strata.toml`: target name to overlay.
pub type ConfigFile = BTreeMap<String, TargetOverlay>;

/// Settings a single target table may set.
///
/// `None` means "not set here" so that outer files keep their value.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TargetOverlay {
    /// Image the container runs and is saved as
    pub image: Option<String>,

    /// Image this one is built from
    pub upstream: Option<String>,

    /// Name of the upstream image in the public index
    pub index: Option<String>,

    /// Command to run
    pub command: Option<Vec<String>>,

    /// Working directory inside the container
    pub folder: Option<String>,

    /// Run privileged
    pub privileged: Option<bool>,

    /// Bind mounts (appended)
    pub mounts: Option<Vec<Mount>>,

    /// Port forwards (appended)
    pub ports: Option<Vec<PortForward>>,

    /// DNS servers (appended)
    pub dns: Option<Vec<String>>,

    /// Attach an interactive terminal
    pub attach: Option<bool>,

    /// Delete the container when done
    pub purge: Option<bool>,

    /// Environment variables (appended)
    pub environment: Option<Vec<EnvVar>>,
}

impl TargetOverlay {
    /// Resolve mount host paths against the directory of the declaring file.
    ///
    /// A leading `...` stands for that directory; other relative paths are
    /// joined to it.
    pub fn localize(&mut self, dir: &Path) {
        for mount in self.mounts.iter_mut().flatten() {
            mount.host = localize_path(&mount.host, dir);
        }
    }
}

fn localize_path(host: &Path, dir: &Path) -> PathBuf {
    let raw = host.to_string_lossy();
    let expanded = match raw.strip_prefix("...") {
        Some(rest) => dir.join(rest.trim_start_matches('/')),
        None => host.to_path_buf(),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        dir.join(expanded)
    }
}

/// A bind mount: `[host, container]` or `[host, container, "ro"|"rw"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn mode(&self) -> &'static str {
        if self.read_only {
            "ro"
        } else {
            "rw"
        }
    }
}

impl TryFrom<Vec<String>> for Mount {
    type Error = ConfigError;

    fn try_from(entry: Vec<String>) -> Result<Self, Self::Error> {
        let read_only = match entry.get(2).map(String::as_str) {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "mount mode must be \"ro\" or \"rw\", got {other:?}"
                )))
            }
        };
        match entry.as_slice() {
            [host, container] | [host, container, _] if !host.is_empty() && !container.is_empty() => {
                Ok(Self {
                    host: PathBuf::from(host),
                    container: container.clone(),
                    read_only,
                })
            }
            _ => Err(ConfigError::InvalidValue(format!(
                "mount must be [host, container] or [host, container, mode], got {entry:?}"
            ))),
        }
    }
}

/// A port forward: `[host, container]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct PortForward {
    pub host: String,
    pub container: String,
}

impl TryFrom<Vec<String>> for PortForward {
    type Error = ConfigError;

    fn try_from(entry: Vec<String>) -> Result<Self, Self::Error> {
        match entry.as_slice() {
            [host, container] if !host.is_empty() && !container.is_empty() => Ok(Self {
                host: host.clone(),
                container: container.clone(),
            }),
            _ => Err(ConfigError::InvalidValue(format!(
                "port forward must be [host, container], got {entry:?}"
            ))),
        }
    }
}

/// An environment variable: `[NAME, value]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl TryFrom<Vec<String>> for EnvVar {
    type Error = ConfigError;

    fn try_from(entry: Vec<String>) -> Result<Self, Self::Error> {
        match entry.as_slice() {
            [name, value] if !name.is_empty() && !name.contains('=') => Ok(Self {
                name: name.clone(),
                value: value.clone(),
            }),
            _ => Err(ConfigError::InvalidValue(format!(
                "environment entry must be [NAME, value], got {entry:?}"
            ))),
        }
    }
}
