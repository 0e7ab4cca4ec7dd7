//! graph::store
//!
//! The [`Graph`] handle: discovery, creation, publish and load.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::{Repository, RepositoryOpenFlags, Signature};
use tempfile::TempDir;

use super::tree;
use super::GraphError;
use crate::core::paths::normalize_dir;
use crate::core::types::{LineageName, Oid, REF_PREFIX};
use crate::transfer::{Place, Receive};

/// Sentinel ref marking a repository as an image graph.
pub const INIT_REF: &str = "refs/heads/strata/init";

/// Notes ref holding the mode table of every snapshot.
pub const MODES_REF: &str = "refs/notes/strata/modes";

/// Directory under the graph holding scratch trees.
pub const WORKTREES_DIR: &str = "worktrees";

/// Identity used for the sentinel commit.
const TOOL_NAME: &str = "strata";
const TOOL_EMAIL: &str = "strata@localhost";

/// Summary of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub oid: Oid,
    /// Ancestor tip first, then the previous lineage tip.
    pub parents: Vec<Oid>,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// An image graph rooted at one bare repository.
///
/// # Example
///
/// ```ignore
/// use strata::graph::Graph;
///
/// match Graph::load(Path::new("graph"))? {
///     Some(graph) => println!("found graph at {}", graph.dir().display()),
///     None => println!("no graph yet"),
/// }
/// ```
pub struct Graph {
    repo: Repository,
    dir: PathBuf,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph").field("dir", &self.dir).finish()
    }
}

impl Graph {
    // =========================================================================
    // Discovery and Creation
    // =========================================================================

    /// Open the graph rooted exactly at `dir`.
    ///
    /// Returns `Ok(None)` unless `dir` is the root of a bare repository
    /// carrying the [`INIT_REF`] sentinel.
    pub fn load(dir: &Path) -> Result<Option<Self>, GraphError> {
        let dir = normalize_dir(dir).map_err(GraphError::io(format!("resolving {}", dir.display())))?;
        match open_root(&dir) {
            Some(repo) if is_graph(&repo) => Ok(Some(Self { repo, dir })),
            _ => Ok(None),
        }
    }

    /// Open the graph at `dir`, creating it if nothing is there.
    ///
    /// At most one directory level is created. An existing repository that
    /// is not a graph, or a directory with other content, is refused.
    pub fn new(dir: &Path) -> Result<Self, GraphError> {
        let dir = normalize_dir(dir).map_err(GraphError::io(format!("resolving {}", dir.display())))?;

        if let Some(repo) = open_root(&dir) {
            if is_graph(&repo) {
                return Ok(Self { repo, dir });
            }
            return Err(GraphError::ForeignRepository { path: dir });
        }

        if dir.exists() {
            let empty = dir.is_dir()
                && fs::read_dir(&dir)
                    .map_err(GraphError::io(format!("listing {}", dir.display())))?
                    .next()
                    .is_none();
            if !empty {
                return Err(GraphError::NotEmpty { path: dir });
            }
        } else {
            fs::create_dir(&dir).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GraphError::ParentMissing { path: dir.clone() },
                _ => GraphError::Io {
                    context: format!("creating {}", dir.display()),
                    source: e,
                },
            })?;
        }

        let repo = Repository::init_bare(&dir)
            .map_err(|e| GraphError::from_git2(e, &dir.display().to_string()))?;
        let graph = Self { repo, dir };
        graph.write_sentinel()?;
        tracing::info!(dir = %graph.dir.display(), "created image graph");
        Ok(graph)
    }

    fn write_sentinel(&self) -> Result<(), GraphError> {
        let scratch = self.scratch()?;
        let (tree_id, _) = tree::write_dir(&self.repo, scratch.path())?;
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(|e| GraphError::from_git2(e, &tree_id.to_string()))?;
        let signature = Signature::now(TOOL_NAME, TOOL_EMAIL)
            .map_err(|e| GraphError::from_git2(e, "signature"))?;
        let oid = self
            .repo
            .commit(None, &signature, &signature, "strata image graph", &tree, &[])
            .map_err(|e| GraphError::from_git2(e, "sentinel commit"))?;
        self.repo
            .reference(INIT_REF, oid, false, "strata: init")
            .map_err(|e| GraphError::from_git2(e, INIT_REF))?;
        self.repo
            .set_head(INIT_REF)
            .map_err(|e| GraphError::from_git2(e, "HEAD"))?;
        Ok(())
    }

    /// Absolute path of the repository.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Scratch Trees
    // =========================================================================

    /// Fresh empty directory under [`WORKTREES_DIR`], removed on drop.
    fn scratch(&self) -> Result<Scratch, GraphError> {
        let base = self.dir.join(WORKTREES_DIR);
        fs::create_dir_all(&base).map_err(GraphError::io(format!("creating {}", base.display())))?;
        let dir = tempfile::Builder::new()
            .prefix("tree.")
            .tempdir_in(&base)
            .map_err(GraphError::io(format!("creating scratch tree in {}", base.display())))?;
        Ok(Scratch { dir })
    }

    /// Discard leftovers of interrupted operations.
    ///
    /// Removes stale scratch trees and any stray index file. Safe to call
    /// any number of times.
    pub fn cleanse(&self) -> Result<(), GraphError> {
        let base = self.dir.join(WORKTREES_DIR);
        if base.is_dir() {
            let stale = fs::read_dir(&base).map_err(GraphError::io(format!("listing {}", base.display())))?;
            for entry in stale {
                let path = entry
                    .map_err(GraphError::io(format!("listing {}", base.display())))?
                    .path();
                tracing::debug!(path = %path.display(), "removing stale scratch tree");
                unseal(&path);
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                removed.map_err(GraphError::io(format!("removing {}", path.display())))?;
            }
        }

        let index = self.repo.path().join("index");
        if index.exists() {
            fs::remove_file(&index).map_err(GraphError::io(format!("removing {}", index.display())))?;
        }
        Ok(())
    }

    // =========================================================================
    // Lineages
    // =========================================================================

    /// Whether any snapshot has been published as `lineage`.
    pub fn has_lineage(&self, lineage: &LineageName) -> Result<bool, GraphError> {
        Ok(self.tip(lineage)?.is_some())
    }

    /// Current tip of a lineage.
    pub fn tip(&self, lineage: &LineageName) -> Result<Option<git2::Oid>, GraphError> {
        let refname = lineage.ref_name();
        match self.repo.refname_to_id(&refname) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(GraphError::from_git2(e, &refname)),
        }
    }

    /// Names of all lineages, sorted.
    pub fn lineages(&self) -> Result<Vec<LineageName>, GraphError> {
        let prefix = format!("{}image/", REF_PREFIX);
        let refs = self
            .repo
            .references_glob(&format!("{prefix}*"))
            .map_err(|e| GraphError::from_git2(e, &prefix))?;
        let mut names = Vec::new();
        for reference in refs {
            let reference = reference.map_err(|e| GraphError::from_git2(e, &prefix))?;
            if let Some(name) = reference.name().and_then(|n| n.strip_prefix(&prefix)) {
                names.push(LineageName::new(name)?);
            }
        }
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(names)
    }

    /// An existing lineage whose ref would collide with `lineage`'s.
    ///
    /// Refs are paths, so `a` and `a/b` cannot both exist.
    fn conflicting_lineage(&self, lineage: &LineageName) -> Result<Option<LineageName>, GraphError> {
        let name = lineage.as_str();
        Ok(self.lineages()?.into_iter().find(|other| {
            let other = other.as_str();
            let nested = |outer: &str, inner: &str| inner.strip_prefix(outer).is_some_and(|rest| rest.starts_with('/'));
            nested(other, name) || nested(name, other)
        }))
    }

    /// Committer identity for new snapshots.
    pub fn signature(&self) -> Result<Signature<'static>, GraphError> {
        self.repo.signature().map_err(|e| match e.code() {
            git2::ErrorCode::NotFound => GraphError::IdentityUnset,
            _ => GraphError::from_git2(e, "signature"),
        })
    }

    /// Record a new snapshot of `lineage`.
    ///
    /// `place` fills the snapshot's tree:
    /// - an existing lineage starts from an empty tree (wholesale replace)
    /// - a new lineage without an ancestor becomes an orphan
    /// - a new lineage with an ancestor is forked from the ancestor's tip,
    ///   and starts from the ancestor's tree
    ///
    /// The commit's parents are the ancestor tip and the previous lineage
    /// tip, each only if present and not already listed.
    ///
    /// A lineage naming itself as ancestor is allowed; if it does not exist
    /// yet the snapshot is an orphan.
    pub fn publish(
        &self,
        lineage: &LineageName,
        ancestor: Option<&LineageName>,
        place: &mut dyn Place,
    ) -> Result<Oid, GraphError> {
        let signature = self.signature()?;
        let mut previous = self.tip(lineage)?;
        if previous.is_none() {
            if let Some(existing) = self.conflicting_lineage(lineage)? {
                return Err(GraphError::LineageConflict {
                    lineage: lineage.to_string(),
                    existing: existing.to_string(),
                });
            }
        }

        let ancestor_tip = match ancestor {
            Some(ancestor) => match self.tip(ancestor)? {
                Some(tip) => Some(tip),
                None if ancestor == lineage => None,
                None => {
                    return Err(GraphError::LineageNotFound {
                        lineage: ancestor.to_string(),
                    })
                }
            },
            None => None,
        };

        let scratch = self.scratch()?;
        if previous.is_none() {
            if let Some(fork_point) = ancestor_tip {
                let commit = self.find_commit(fork_point)?;
                let base = commit
                    .tree()
                    .map_err(|e| GraphError::from_git2(e, &fork_point.to_string()))?;
                let modes = self.modes_of(fork_point)?;
                tree::materialize(&self.repo, &base, scratch.path(), &modes)?;
                // the ref itself only moves once the snapshot is committed
                previous = Some(fork_point);
                tracing::debug!(%lineage, fork_point = %fork_point, "forked lineage");
            }
        }

        place.place(scratch.path())?;

        let (tree_id, modes) = tree::write_dir(&self.repo, scratch.path())?;
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(|e| GraphError::from_git2(e, &tree_id.to_string()))?;

        let mut parent_ids: Vec<git2::Oid> = Vec::new();
        for id in [ancestor_tip, previous].into_iter().flatten() {
            if !parent_ids.contains(&id) {
                parent_ids.push(id);
            }
        }
        let parents = parent_ids
            .iter()
            .map(|id| self.find_commit(*id))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let message = format!(
            "updated {}<<{}",
            lineage,
            ancestor.map(LineageName::as_str).unwrap_or("")
        );
        let oid = self
            .repo
            .commit(None, &signature, &signature, &message, &tree, &parent_refs)
            .map_err(|e| GraphError::from_git2(e, "snapshot commit"))?;
        if !modes.is_empty() {
            self.repo
                .note(&signature, &signature, Some(MODES_REF), oid, &modes.to_json()?, true)
                .map_err(|e| GraphError::from_git2(e, MODES_REF))?;
        }
        self.repo
            .reference(&lineage.ref_name(), oid, true, &message)
            .map_err(|e| GraphError::from_git2(e, &lineage.ref_name()))?;

        tracing::info!(%lineage, %oid, parents = parent_ids.len(), "published snapshot");
        Ok(oid.into())
    }

    /// Hand the tip snapshot of `lineage` to `receive`.
    ///
    /// Fails with [`GraphError::LineageNotFound`] before touching the
    /// filesystem if the lineage does not exist.
    pub fn load_lineage(
        &self,
        lineage: &LineageName,
        receive: &mut dyn Receive,
    ) -> Result<Oid, GraphError> {
        let tip = self.tip(lineage)?.ok_or_else(|| GraphError::LineageNotFound {
            lineage: lineage.to_string(),
        })?;
        let tree = self
            .find_commit(tip)?
            .tree()
            .map_err(|e| GraphError::from_git2(e, &tip.to_string()))?;

        let modes = self.modes_of(tip)?;
        let scratch = self.scratch()?;
        tree::materialize(&self.repo, &tree, scratch.path(), &modes)?;
        receive.receive(scratch.path())?;
        tracing::debug!(%lineage, %tip, "loaded snapshot");
        Ok(tip.into())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Details of the tip snapshot of `lineage`.
    pub fn snapshot(&self, lineage: &LineageName) -> Result<SnapshotInfo, GraphError> {
        let tip = self.tip(lineage)?.ok_or_else(|| GraphError::LineageNotFound {
            lineage: lineage.to_string(),
        })?;
        let commit = self.find_commit(tip)?;
        let time = DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or(DateTime::UNIX_EPOCH);
        Ok(SnapshotInfo {
            oid: tip.into(),
            parents: commit.parent_ids().map(Oid::from).collect(),
            message: commit.message().unwrap_or("").to_string(),
            time,
        })
    }

    /// Every file path in the tip snapshot of `lineage` with its git mode.
    pub fn paths(&self, lineage: &LineageName) -> Result<Vec<(String, i32)>, GraphError> {
        let tip = self.tip(lineage)?.ok_or_else(|| GraphError::LineageNotFound {
            lineage: lineage.to_string(),
        })?;
        let tree = self
            .find_commit(tip)?
            .tree()
            .map_err(|e| GraphError::from_git2(e, &tip.to_string()))?;
        tree::list_paths(&tree)
    }

    /// Mode table recorded for a snapshot; empty for snapshots without one.
    fn modes_of(&self, commit: git2::Oid) -> Result<tree::Modes, GraphError> {
        match self.repo.find_note(Some(MODES_REF), commit) {
            Ok(note) => tree::Modes::from_json(note.message().unwrap_or("")),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(tree::Modes::default()),
            Err(e) => Err(GraphError::from_git2(e, MODES_REF)),
        }
    }

    fn find_commit(&self, oid: git2::Oid) -> Result<git2::Commit<'_>, GraphError> {
        self.repo
            .find_commit(oid)
            .map_err(|e| GraphError::from_git2(e, &oid.to_string()))
    }
}

/// Open `dir` as a repository root without searching upward.
fn open_root(dir: &Path) -> Option<Repository> {
    let repo = Repository::open_ext(dir, RepositoryOpenFlags::NO_SEARCH, std::iter::empty::<&std::ffi::OsStr>()).ok()?;
    let root = if repo.is_bare() {
        repo.path()
    } else {
        repo.workdir()?
    };
    let same = match (fs::canonicalize(root), fs::canonicalize(dir)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    same.then_some(repo)
}

fn is_graph(repo: &Repository) -> bool {
    repo.is_bare() && repo.find_reference(INIT_REF).is_ok()
}

/// A scratch tree that is removed even if an unpack left it read-only.
struct Scratch {
    dir: TempDir,
}

impl Scratch {
    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        unseal(self.dir.path());
    }
}

/// Make every directory under `path` writable so it can be removed.
fn unseal(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700));
    }
    if let Ok(children) = fs::read_dir(path) {
        for child in children.flatten() {
            unseal(&child.path());
        }
    }
}
