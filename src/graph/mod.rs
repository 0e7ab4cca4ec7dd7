//! graph
//!
//! The image graph: filesystem snapshots versioned in a bare git repository.
//!
//! # Architecture
//!
//! Each image name owns a *lineage*, a ref under `refs/heads/strata/image/`
//! whose commits are whole-tree snapshots of the image filesystem. A commit
//! may also credit an *ancestor* lineage as a parent, recording what the
//! image was built from. Histories are never merged by content; a new
//! snapshot replaces the tree wholesale.
//!
//! All file content passes through a scratch directory under
//! `<graph>/worktrees/`, removed when the operation ends. The repository
//! itself has no working tree and `HEAD` rests on the sentinel ref
//! `refs/heads/strata/init`, which marks a directory as a graph.
//!
//! A git tree keeps only the executable bit of a file. The full modes of a
//! snapshot, and any directories left empty, are recorded as a JSON note on
//! the snapshot commit under `refs/notes/strata/modes` and restored
//! whenever the snapshot is checked out again.
//!
//! No other module imports `git2`; everything goes through [`Graph`].
//!
//! # Error Handling
//!
//! git failures are normalized into [`GraphError`]. Missing lineages,
//! foreign repositories and an unset committer identity are user-facing;
//! everything else is internal.
//!
//! # Example
//!
//! ```ignore
//! use strata::core::types::LineageName;
//! use strata::graph::Graph;
//! use strata::transfer::TarPlace;
//!
//! let graph = Graph::new(Path::new("graph"))?;
//! let lineage = LineageName::from_image("polydawn/base")?;
//! let ancestor = LineageName::from_image("ubuntu:14.04")?;
//! let oid = graph.publish(&lineage, Some(&ancestor), &mut TarPlace::new(export))?;
//! println!("published {}", oid.short(7));
//! ```

mod store;
mod tree;

pub use store::{Graph, SnapshotInfo, INIT_REF, MODES_REF, WORKTREES_DIR};

use std::path::PathBuf;

use thiserror::Error;

use crate::core::failure::Classify;
use crate::core::types::TypeError;
use crate::transfer::TransferError;

/// Errors from image graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A git repository is there, but it is not an image graph.
    #[error("{path} is a git repository but not an image graph; refusing to use it")]
    ForeignRepository { path: PathBuf },

    /// The directory has unrelated content.
    #[error("{path} exists and is not empty; cannot create an image graph there")]
    NotEmpty { path: PathBuf },

    /// Only one directory level is created.
    #[error("cannot create an image graph at {path}: parent directory does not exist")]
    ParentMissing { path: PathBuf },

    /// No snapshots have been published under this name.
    #[error("image {lineage} not found in graph")]
    LineageNotFound { lineage: String },

    /// Lineage refs are paths, so one name cannot nest inside another.
    #[error("image {lineage} conflicts with existing image {existing}; one name cannot be nested under the other")]
    LineageConflict { lineage: String, existing: String },

    /// Publishing needs someone to attribute the snapshot to.
    #[error(
        "no git identity configured; run `git config --global user.name \"Your Name\"` \
         and `git config --global user.email you@example.com`"
    )]
    IdentityUnset,

    #[error(transparent)]
    InvalidName(#[from] TypeError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Object not found in repository.
    #[error("object not found: {oid}")]
    ObjectNotFound { oid: String },

    /// Filesystem error around the repository.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Internal git2 error.
    #[error("git error: {message}")]
    Internal { message: String },
}

impl GraphError {
    /// Convert a git2 error with context about what was being accessed.
    fn from_git2(err: git2::Error, context: &str) -> Self {
        match err.code() {
            git2::ErrorCode::NotFound if !context.starts_with("refs/") => {
                GraphError::ObjectNotFound {
                    oid: context.to_string(),
                }
            }
            git2::ErrorCode::Locked => GraphError::Internal {
                message: format!("graph is locked ({}): {}", context, err.message()),
            },
            _ => GraphError::Internal {
                message: format!("{}: {}", context, err.message()),
            },
        }
    }

    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| GraphError::Io { context, source }
    }
}

impl Classify for GraphError {
    fn is_user_facing(&self) -> bool {
        match self {
            GraphError::ForeignRepository { .. }
            | GraphError::NotEmpty { .. }
            | GraphError::ParentMissing { .. }
            | GraphError::LineageNotFound { .. }
            | GraphError::LineageConflict { .. }
            | GraphError::IdentityUnset
            | GraphError::InvalidName(_) => true,
            GraphError::Transfer(e) => e.is_user_facing(),
            GraphError::ObjectNotFound { .. }
            | GraphError::Io { .. }
            | GraphError::Internal { .. } => false,
        }
    }
}
