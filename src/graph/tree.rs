//! graph::tree
//!
//! Converting between directories and git trees.
//!
//! A git tree keeps only the executable bit of a regular file (`100755` vs
//! `100644`), stores symlinks as link blobs and cannot hold an empty
//! directory. Everything it drops is carried by a [`Modes`] table written
//! next to the tree: the full `st_mode` of every file and directory,
//! including setuid, setgid and sticky bits and directories left empty.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Component, Path};

use git2::{FileMode, Repository, Tree};
use serde::{Deserialize, Serialize};

use super::GraphError;

const MODE_TREE: i32 = 0o040000;
const MODE_BLOB: i32 = 0o100644;
const MODE_EXEC: i32 = 0o100755;
const MODE_LINK: i32 = 0o120000;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Full `st_mode` of every regular file and directory in a snapshot, keyed
/// by `/`-separated path relative to the snapshot root.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub(super) struct Modes(BTreeMap<String, u32>);

impl Modes {
    pub(super) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(super) fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string(self).map_err(|e| GraphError::Internal {
            message: format!("encoding mode table: {e}"),
        })
    }

    pub(super) fn from_json(text: &str) -> Result<Self, GraphError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text).map_err(|e| GraphError::Internal {
            message: format!("decoding mode table: {e}"),
        })
    }

    fn record(&mut self, rel: Option<&str>, mode: u32) {
        if let Some(rel) = rel {
            self.0.insert(rel.to_string(), mode);
        }
    }

    /// Restore recorded modes under `dir` after its tree was materialized.
    ///
    /// Directories git could not hold are created, file modes are set, and
    /// directory modes go last, deepest first, so a read-only directory is
    /// sealed only once everything below it exists.
    fn apply(&self, dir: &Path) -> Result<(), GraphError> {
        let mut sealed = Vec::new();
        for (rel, &mode) in &self.0 {
            if !Path::new(rel).components().all(|c| matches!(c, Component::Normal(_))) {
                tracing::debug!(path = %rel, "ignoring mode for unsafe path");
                continue;
            }
            let path = dir.join(rel);
            match mode & S_IFMT {
                S_IFDIR => {
                    fs::create_dir_all(&path).map_err(GraphError::io(format!("creating {}", path.display())))?;
                    sealed.push((path, mode));
                }
                S_IFREG => {
                    let is_file = fs::symlink_metadata(&path).map(|m| m.is_file()).unwrap_or(false);
                    if is_file {
                        set_mode(&path, mode)?;
                    }
                }
                _ => {}
            }
        }
        for (path, mode) in sealed.into_iter().rev() {
            set_mode(&path, mode)?;
        }
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), GraphError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(GraphError::io(format!("setting mode of {}", path.display())))
}

/// Table key of `name` under `prefix`; `None` below a name that is not UTF-8.
fn join(prefix: Option<&str>, name: &OsStr) -> Option<String> {
    let (prefix, name) = (prefix?, name.to_str()?);
    Some(if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    })
}

/// Write `dir` as a tree and return its id with the modes of its contents.
///
/// An empty directory yields the empty tree.
pub(super) fn write_dir(repo: &Repository, dir: &Path) -> Result<(git2::Oid, Modes), GraphError> {
    let mut modes = Modes::default();
    let oid = match write_subtree(repo, dir, Some(""), &mut modes)? {
        Some(oid) => oid,
        None => repo
            .treebuilder(None)
            .and_then(|builder| builder.write())
            .map_err(|e| GraphError::from_git2(e, "empty tree"))?,
    };
    Ok((oid, modes))
}

fn write_subtree(
    repo: &Repository,
    dir: &Path,
    rel: Option<&str>,
    modes: &mut Modes,
) -> Result<Option<git2::Oid>, GraphError> {
    let mut builder = repo
        .treebuilder(None)
        .map_err(|e| GraphError::from_git2(e, "treebuilder"))?;

    let entries = fs::read_dir(dir)
        .and_then(|it| it.collect::<std::io::Result<Vec<_>>>())
        .map_err(GraphError::io(format!("listing {}", dir.display())))?;

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let meta = fs::symlink_metadata(&path)
            .map_err(GraphError::io(format!("reading metadata of {}", path.display())))?;
        let file_type = meta.file_type();
        let child = join(rel, &name);
        if child.is_none() && !file_type.is_symlink() {
            tracing::debug!(path = %path.display(), "non-utf8 name; mode not recorded");
        }

        let (oid, mode) = if file_type.is_symlink() {
            let target = fs::read_link(&path)
                .map_err(GraphError::io(format!("reading link {}", path.display())))?;
            let oid = repo
                .blob(target.as_os_str().as_bytes())
                .map_err(|e| GraphError::from_git2(e, &path.display().to_string()))?;
            (oid, MODE_LINK)
        } else if file_type.is_dir() {
            modes.record(child.as_deref(), meta.mode());
            match write_subtree(repo, &path, child.as_deref(), modes)? {
                Some(oid) => (oid, MODE_TREE),
                None => continue,
            }
        } else if file_type.is_file() {
            let oid = repo
                .blob_path(&path)
                .map_err(|e| GraphError::from_git2(e, &path.display().to_string()))?;
            modes.record(child.as_deref(), meta.mode());
            let mode = if meta.permissions().mode() & 0o111 != 0 {
                MODE_EXEC
            } else {
                MODE_BLOB
            };
            (oid, mode)
        } else {
            tracing::debug!(path = %path.display(), "not snapshotting special file");
            continue;
        };

        builder
            .insert(name.as_bytes().to_vec(), oid, mode)
            .map_err(|e| GraphError::from_git2(e, &path.display().to_string()))?;
    }

    if builder.is_empty() {
        return Ok(None);
    }
    builder
        .write()
        .map(Some)
        .map_err(|e| GraphError::from_git2(e, &dir.display().to_string()))
}

/// Write the contents of `tree` into the existing directory `dir`, then
/// restore `modes` over it.
///
/// Without recorded modes files come out `0755` or `0644`.
pub(super) fn materialize(repo: &Repository, tree: &Tree<'_>, dir: &Path, modes: &Modes) -> Result<(), GraphError> {
    write_tree(repo, tree, dir)?;
    modes.apply(dir)
}

fn write_tree(repo: &Repository, tree: &Tree<'_>, dir: &Path) -> Result<(), GraphError> {
    for entry in tree.iter() {
        let name = OsStr::from_bytes(entry.name_bytes());
        if name.is_empty() || name == "." || name == ".." || entry.name_bytes().contains(&b'/') {
            return Err(GraphError::Internal {
                message: format!("refusing tree entry {:?}", name),
            });
        }
        let path = dir.join(name);
        let context = path.display().to_string();

        match entry.filemode() {
            MODE_TREE => {
                fs::create_dir(&path).map_err(GraphError::io(format!("creating {context}")))?;
                let subtree = repo
                    .find_tree(entry.id())
                    .map_err(|e| GraphError::from_git2(e, &entry.id().to_string()))?;
                write_tree(repo, &subtree, &path)?;
            }
            MODE_LINK => {
                let blob = repo
                    .find_blob(entry.id())
                    .map_err(|e| GraphError::from_git2(e, &entry.id().to_string()))?;
                symlink(OsStr::from_bytes(blob.content()), &path)
                    .map_err(GraphError::io(format!("linking {context}")))?;
            }
            mode @ (MODE_BLOB | MODE_EXEC) => {
                let blob = repo
                    .find_blob(entry.id())
                    .map_err(|e| GraphError::from_git2(e, &entry.id().to_string()))?;
                fs::write(&path, blob.content()).map_err(GraphError::io(format!("writing {context}")))?;
                let perms = if mode == MODE_EXEC { 0o755 } else { 0o644 };
                fs::set_permissions(&path, fs::Permissions::from_mode(perms))
                    .map_err(GraphError::io(format!("setting mode of {context}")))?;
            }
            other => {
                tracing::debug!(path = %context, mode = format!("{other:o}"), "skipping tree entry");
            }
        }
    }
    Ok(())
}

/// Every blob path in `tree` with its git file mode, depth first.
pub(super) fn list_paths(tree: &Tree<'_>) -> Result<Vec<(String, i32)>, GraphError> {
    let mut paths = Vec::new();
    tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
        if entry.filemode() != i32::from(FileMode::Tree) {
            let name = String::from_utf8_lossy(entry.name_bytes());
            paths.push((format!("{root}{name}"), entry.filemode()));
        }
        git2::TreeWalkResult::Ok
    })
    .map_err(|e| GraphError::from_git2(e, "tree walk"))?;
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn empty_dir_is_empty_tree() {
        let (_guard, repo) = repo();
        let scratch = TempDir::new().unwrap();
        fs::create_dir(scratch.path().join("hollow")).unwrap();
        let (oid, modes) = write_dir(&repo, scratch.path()).unwrap();
        assert_eq!(repo.find_tree(oid).unwrap().len(), 0);
        assert!(!modes.is_empty());
    }

    #[test]
    fn empty_dirs_come_back_from_modes() {
        let (_guard, repo) = repo();
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("var/empty")).unwrap();
        fs::set_permissions(src.path().join("var/empty"), fs::Permissions::from_mode(0o1777)).unwrap();

        let (oid, modes) = write_dir(&repo, src.path()).unwrap();
        let tree = repo.find_tree(oid).unwrap();
        let modes = Modes::from_json(&modes.to_json().unwrap()).unwrap();

        let dst = TempDir::new().unwrap();
        materialize(&repo, &tree, dst.path(), &modes).unwrap();
        let meta = fs::metadata(dst.path().join("var/empty")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o1777);
    }

    #[test]
    fn unsafe_mode_paths_are_ignored() {
        let (_guard, repo) = repo();
        let src = TempDir::new().unwrap();
        let (oid, _) = write_dir(&repo, src.path()).unwrap();
        let tree = repo.find_tree(oid).unwrap();
        let modes = Modes::from_json(r#"{"../escape": 16877, "/abs": 16877}"#).unwrap();

        let dst = TempDir::new().unwrap();
        materialize(&repo, &tree, dst.path(), &modes).unwrap();
        assert!(!dst.path().join("../escape").exists());
        assert_eq!(fs::read_dir(dst.path()).unwrap().count(), 0);
    }

    #[test]
    fn modes_survive_round_trip() {
        let (_guard, repo) = repo();
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("plain"), "p").unwrap();
        fs::set_permissions(src.path().join("plain"), fs::Permissions::from_mode(0o640)).unwrap();
        fs::create_dir_all(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/tool"), "t").unwrap();
        fs::set_permissions(src.path().join("bin/tool"), fs::Permissions::from_mode(0o700)).unwrap();
        symlink("bin/tool", src.path().join("tool")).unwrap();

        let (oid, modes) = write_dir(&repo, src.path()).unwrap();
        let tree = repo.find_tree(oid).unwrap();
        let mut paths = list_paths(&tree).unwrap();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                ("bin/tool".to_string(), MODE_EXEC),
                ("plain".to_string(), MODE_BLOB),
                ("tool".to_string(), MODE_LINK),
            ]
        );

        let dst = TempDir::new().unwrap();
        materialize(&repo, &tree, dst.path(), &modes).unwrap();
        let mode = |p: &str| fs::metadata(dst.path().join(p)).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode("plain"), 0o640);
        assert_eq!(mode("bin/tool"), 0o700);
        assert_eq!(fs::read_link(dst.path().join("tool")).unwrap(), Path::new("bin/tool"));
        assert_eq!(fs::read_to_string(dst.path().join("bin/tool")).unwrap(), "t");

        // a tree without a mode table falls back to the executable bit alone
        let bare = TempDir::new().unwrap();
        materialize(&repo, &tree, bare.path(), &Modes::default()).unwrap();
        let mode = |p: &str| fs::metadata(bare.path().join(p)).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode("plain"), 0o644);
        assert_eq!(mode("bin/tool"), 0o755);
    }
}
