//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`ImageRef`] - A runtime image reference split into name and tag
//! - [`LineageName`] - Validated name of an image history in the graph
//! - [`Oid`] - Git object identifier of a snapshot
//! - [`ImagePath`] - Where an image is read from or written to (`scheme:path`)
//!
//! # Validation
//!
//! These types enforce validity at construction time. Invalid values
//! cannot be represented, so a lineage name can always be turned into a ref.
//!
//! # Examples
//!
//! ```
//! use strata::core::types::{ImagePath, ImageRef, LineageName, Scheme};
//!
//! let image = ImageRef::parse("ubuntu:14.04");
//! assert_eq!(image.name(), "ubuntu");
//! assert_eq!(image.tag(), "14.04");
//!
//! let lineage = LineageName::from_image("ubuntu:14.04").unwrap();
//! assert_eq!(lineage.ref_name(), "refs/heads/strata/image/ubuntu");
//!
//! let path: ImagePath = "file:".parse().unwrap();
//! assert_eq!(path.scheme, Scheme::File);
//! assert!(path.path.is_empty());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid lineage name: {0}")]
    InvalidLineage(String),

    #[error("invalid object id: {0}")]
    InvalidOid(String),

    #[error("unrecognized scheme '{0}' (expected graph, file, docker or index)")]
    UnknownScheme(String),
}

/// Tag used when an image reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// Ref namespace reserved for the graph.
pub const REF_PREFIX: &str = "refs/heads/strata/";

/// A runtime image reference, `name[:tag]`.
///
/// Only a `:` inside the last path component separates the tag, so a
/// registry host with a port (`localhost:5000/app`) stays part of the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    name: String,
    tag: String,
}

impl ImageRef {
    /// Split an image reference, defaulting the tag to `latest`.
    pub fn parse(image: &str) -> Self {
        let component_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
        match image[component_start..].rfind(':') {
            Some(offset) => {
                let split = component_start + offset;
                let tag = &image[split + 1..];
                Self {
                    name: image[..split].to_string(),
                    tag: if tag.is_empty() { DEFAULT_TAG } else { tag }.to_string(),
                }
            }
            None => Self {
                name: image.to_string(),
                tag: DEFAULT_TAG.to_string(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// A validated lineage name.
///
/// Lineages are keyed by the image name with its tag discarded, and each
/// maps to one ref under [`REF_PREFIX`]. The name must therefore follow
/// git's refname rules (see `git check-ref-format`).
///
/// # Example
///
/// ```
/// use strata::core::types::LineageName;
///
/// let name = LineageName::new("library/ubuntu").unwrap();
/// assert_eq!(name.as_str(), "library/ubuntu");
///
/// assert!(LineageName::new("").is_err());
/// assert!(LineageName::new("a..b").is_err());
/// assert!(LineageName::new("has space").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LineageName(String);

impl LineageName {
    /// Create a new validated lineage name.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidLineage` if the name cannot be used in a ref.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Lineage name for an image reference; the tag is discarded.
    pub fn from_image(image: &str) -> Result<Self, TypeError> {
        Self::new(ImageRef::parse(image).name)
    }

    fn validate(name: &str) -> Result<(), TypeError> {
        let fail = |why: &str| Err(TypeError::InvalidLineage(format!("'{name}' {why}")));

        if name.is_empty() {
            return fail("is empty");
        }
        if name == "@" {
            return fail("is reserved");
        }
        if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
            return fail("cannot start with '-' or start or end with '/'");
        }
        if name.ends_with('.') {
            return fail("cannot end with '.'");
        }
        for pattern in ["..", "@{", "//"] {
            if name.contains(pattern) {
                return fail(&format!("cannot contain '{pattern}'"));
            }
        }
        const INVALID_CHARS: [char; 8] = [' ', '~', '^', ':', '\\', '?', '*', '['];
        if let Some(c) = name
            .chars()
            .find(|c| INVALID_CHARS.contains(c) || c.is_ascii_control())
        {
            return fail(&format!("cannot contain {c:?}"));
        }
        for component in name.split('/') {
            if component.starts_with('.') || component.ends_with(".lock") {
                return fail("has a component starting with '.' or ending with '.lock'");
            }
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The full ref holding this lineage's tip.
    pub fn ref_name(&self) -> String {
        format!("{}image/{}", REF_PREFIX, self.0)
    }
}

impl TryFrom<String> for LineageName {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<LineageName> for String {
    fn from(name: LineageName) -> Self {
        name.0
    }
}

impl AsRef<str> for LineageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LineageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A git object identifier (SHA-1 or SHA-256), normalized to lowercase.
///
/// # Example
///
/// ```
/// use strata::core::types::Oid;
///
/// let oid = Oid::new("ABC123DEF4567890ABC123DEF4567890ABC12345").unwrap();
/// assert_eq!(oid.short(7), "abc123d");
/// assert!(Oid::new("not-a-sha").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(String);

impl Oid {
    /// Create a new validated object id.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidOid` if the string is not a 40 or 64 digit hex id.
    pub fn new(oid: impl Into<String>) -> Result<Self, TypeError> {
        let oid = oid.into().to_ascii_lowercase();
        if !matches!(oid.len(), 40 | 64) || !oid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TypeError::InvalidOid(oid));
        }
        Ok(Self(oid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` characters of the id.
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl From<git2::Oid> for Oid {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

impl TryFrom<String> for Oid {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an image lives between builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// A lineage in the image graph.
    Graph,
    /// A tar archive on disk.
    File,
    /// The daemon's own image cache.
    Docker,
    /// The public registry index.
    Index,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Graph => "graph",
            Scheme::File => "file",
            Scheme::Docker => "docker",
            Scheme::Index => "index",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `scheme:path` image location as given on the command line.
///
/// The path is everything after the first `:`; it may be empty, in which
/// case the scheme's default location is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePath {
    pub scheme: Scheme,
    pub path: String,
}

impl ImagePath {
    pub fn new(scheme: Scheme, path: impl Into<String>) -> Self {
        Self {
            scheme,
            path: path.into(),
        }
    }

    /// Path if one was given, else `default`.
    pub fn path_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.path.is_empty() {
            default
        } else {
            &self.path
        }
    }
}

impl FromStr for ImagePath {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, path) = s.split_once(':').unwrap_or((s, ""));
        let scheme = match scheme {
            "graph" => Scheme::Graph,
            "file" => Scheme::File,
            "docker" => Scheme::Docker,
            "index" => Scheme::Index,
            other => return Err(TypeError::UnknownScheme(other.to_string())),
        };
        Ok(Self::new(scheme, path))
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod image_ref {
        use super::*;

        #[test]
        fn splits_tag() {
            let image = ImageRef::parse("ubuntu:14.04");
            assert_eq!(image.name(), "ubuntu");
            assert_eq!(image.tag(), "14.04");
        }

        #[test]
        fn defaults_tag() {
            let image = ImageRef::parse("ubuntu");
            assert_eq!(image.name(), "ubuntu");
            assert_eq!(image.tag(), "latest");
            assert_eq!(ImageRef::parse("ubuntu:").tag(), "latest");
        }

        #[test]
        fn keeps_registry_port() {
            let image = ImageRef::parse("localhost:5000/app");
            assert_eq!(image.name(), "localhost:5000/app");
            assert_eq!(image.tag(), "latest");

            let image = ImageRef::parse("localhost:5000/app:v2");
            assert_eq!(image.name(), "localhost:5000/app");
            assert_eq!(image.tag(), "v2");
        }

        #[test]
        fn display() {
            assert_eq!(ImageRef::parse("a/b").to_string(), "a/b:latest");
        }
    }

    mod lineage_name {
        use super::*;

        #[test]
        fn discards_tag() {
            let name = LineageName::from_image("ubuntu:14.04").unwrap();
            assert_eq!(name.as_str(), "ubuntu");
        }

        #[test]
        fn ref_name() {
            let name = LineageName::new("polydawn/base").unwrap();
            assert_eq!(name.ref_name(), "refs/heads/strata/image/polydawn/base");
        }

        #[test]
        fn rejects_invalid() {
            for bad in ["", "@", "-x", "/x", "x/", "a..b", "a//b", "a b", "a~b", ".x", "x.lock", "a@{b"] {
                assert!(LineageName::new(bad).is_err(), "{bad:?} should be rejected");
            }
        }

        #[test]
        fn port_is_not_a_lineage() {
            assert!(LineageName::from_image("localhost:5000/app").is_err());
        }

        #[test]
        fn serde_round_trip() {
            let name = LineageName::new("ubuntu").unwrap();
            let json = serde_json::to_string(&name).unwrap();
            assert_eq!(json, "\"ubuntu\"");
            let back: LineageName = serde_json::from_str(&json).unwrap();
            assert_eq!(back, name);
            assert!(serde_json::from_str::<LineageName>("\"a..b\"").is_err());
        }
    }

    mod oid {
        use super::*;

        #[test]
        fn normalizes_case() {
            let oid = Oid::new("ABC123DEF4567890ABC123DEF4567890ABC12345").unwrap();
            assert_eq!(oid.as_str(), "abc123def4567890abc123def4567890abc12345");
        }

        #[test]
        fn rejects_bad_length() {
            assert!(Oid::new("abc123").is_err());
            assert!(Oid::new("g".repeat(40)).is_err());
        }

        #[test]
        fn short_clamps() {
            let oid = Oid::new("a".repeat(40)).unwrap();
            assert_eq!(oid.short(100).len(), 40);
        }
    }

    mod image_path {
        use super::*;

        #[test]
        fn parses_schemes() {
            let path: ImagePath = "graph".parse().unwrap();
            assert_eq!(path, ImagePath::new(Scheme::Graph, ""));

            let path: ImagePath = "file:out/image.tar".parse().unwrap();
            assert_eq!(path, ImagePath::new(Scheme::File, "out/image.tar"));

            let path: ImagePath = "docker:".parse().unwrap();
            assert_eq!(path.scheme, Scheme::Docker);

            let path: ImagePath = "index".parse().unwrap();
            assert_eq!(path.scheme, Scheme::Index);
        }

        #[test]
        fn path_keeps_later_colons() {
            let path: ImagePath = "file:c:/x".parse().unwrap();
            assert_eq!(path.path, "c:/x");
        }

        #[test]
        fn empty_file_path_defaults() {
            let path: ImagePath = "file:".parse().unwrap();
            assert_eq!(path.path_or("./image.tar"), "./image.tar");
        }

        #[test]
        fn rejects_unknown_scheme() {
            assert_eq!(
                "bogus:x".parse::<ImagePath>(),
                Err(TypeError::UnknownScheme("bogus".into()))
            );
            assert!("".parse::<ImagePath>().is_err());
            assert!(":x".parse::<ImagePath>().is_err());
        }
    }
}
