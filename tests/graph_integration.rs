//! Integration tests for the image graph.
//!
//! These tests create real graphs in temporary directories and check the
//! results both through `Graph` and through the `git` binary.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use strata::core::failure::Classify;
use strata::core::types::LineageName;
use strata::graph::{Graph, GraphError, INIT_REF, WORKTREES_DIR};
use strata::transfer::{ReceiveFn, TransferError};

// =============================================================================
// Test Fixtures
// =============================================================================

/// A graph in a temporary directory with a committer identity configured.
struct TestGraph {
    _temp: TempDir,
    dir: PathBuf,
    graph: Graph,
}

impl TestGraph {
    fn new() -> Self {
        let temp = TempDir::new().expect("failed to create temp dir");
        let dir = temp.path().join("graph");
        let graph = Graph::new(&dir).expect("failed to create graph");
        run_git(&dir, &["config", "user.name", "Test User"]);
        run_git(&dir, &["config", "user.email", "test@example.com"]);
        // reopen so the identity is picked up
        let graph = Graph::load(graph.dir()).unwrap().expect("graph should load");
        Self {
            _temp: temp,
            dir,
            graph,
        }
    }

    /// Publish the files described by `files` as the next snapshot.
    fn publish(&self, lineage: &str, ancestor: Option<&str>, files: &[(&str, &[u8], u32)]) -> String {
        let lineage = name(lineage);
        let ancestor = ancestor.map(name);
        let mut place = |dir: &Path| -> Result<(), TransferError> {
            write_files(dir, files);
            Ok(())
        };
        self.graph
            .publish(&lineage, ancestor.as_ref(), &mut place)
            .expect("publish failed")
            .to_string()
    }

    /// Materialize the tip of `lineage` into a fresh directory.
    fn checkout(&self, lineage: &str) -> TempDir {
        let out = TempDir::new().unwrap();
        let target = out.path().to_path_buf();
        let mut receive = ReceiveFn(|dir: &Path| -> Result<(), TransferError> {
            copy_tree(dir, &target);
            Ok(())
        });
        self.graph.load_lineage(&name(lineage), &mut receive).expect("load failed");
        out
    }

    fn git(&self, args: &[&str]) -> String {
        git_output(&self.dir, args)
    }

    fn worktrees_empty(&self) -> bool {
        let base = self.dir.join(WORKTREES_DIR);
        !base.exists() || fs::read_dir(base).unwrap().next().is_none()
    }
}

fn name(s: &str) -> LineageName {
    LineageName::new(s).unwrap()
}

fn write_files(dir: &Path, files: &[(&str, &[u8], u32)]) {
    for (path, content, mode) in files {
        let path = dir.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
    }
}

fn copy_tree(from: &Path, to: &Path) {
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type().unwrap();
        if file_type.is_symlink() {
            symlink(fs::read_link(entry.path()).unwrap(), &dest).unwrap();
        } else if file_type.is_dir() {
            fs::create_dir(&dest).unwrap();
            copy_tree(&entry.path(), &dest);
            fs::set_permissions(&dest, entry.metadata().unwrap().permissions()).unwrap();
        } else {
            fs::copy(entry.path(), &dest).unwrap();
        }
    }
}

fn top_level(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn mode(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

fn run_git(git_dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .args(args)
        .output()
        .expect("git command failed");
    if !output.status.success() {
        panic!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

fn git_output(git_dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .args(args)
        .output()
        .expect("git command failed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

// =============================================================================
// Discovery and Creation
// =============================================================================

mod creation {
    use super::*;

    #[test]
    fn new_graph_is_bare_with_sentinel() {
        let t = TestGraph::new();
        assert_eq!(t.git(&["rev-parse", "--is-bare-repository"]), "true");
        assert_eq!(t.git(&["symbolic-ref", "HEAD"]), INIT_REF);
        assert!(t.graph.lineages().unwrap().is_empty());
    }

    #[test]
    fn load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(Graph::load(&temp.path().join("nothing")).unwrap().is_none());
        assert!(Graph::load(temp.path()).unwrap().is_none());
    }

    #[test]
    fn new_is_idempotent() {
        let t = TestGraph::new();
        let again = Graph::new(&t.dir).unwrap();
        assert_eq!(again.dir(), t.graph.dir());
    }

    #[test]
    fn foreign_repository_refused() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("plain");
        let status = Command::new("git")
            .args(["init", "--bare", "-q"])
            .arg(&dir)
            .status()
            .unwrap();
        assert!(status.success());

        assert!(Graph::load(&dir).unwrap().is_none());
        let err = Graph::new(&dir).unwrap_err();
        assert!(matches!(err, GraphError::ForeignRepository { .. }));
    }

    #[test]
    fn non_empty_directory_refused() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("stuff"), "x").unwrap();
        let err = Graph::new(temp.path()).unwrap_err();
        assert!(matches!(err, GraphError::NotEmpty { .. }));
    }

    #[test]
    fn only_one_level_is_created() {
        let temp = TempDir::new().unwrap();
        let err = Graph::new(&temp.path().join("a/b")).unwrap_err();
        assert!(matches!(err, GraphError::ParentMissing { .. }));
    }

    #[test]
    fn subdirectory_of_graph_is_not_a_graph() {
        let t = TestGraph::new();
        assert!(Graph::load(&t.dir.join("refs")).unwrap().is_none());
    }
}

// =============================================================================
// Publish and Load
// =============================================================================

mod publish {
    use super::*;

    #[test]
    fn orphan_first_snapshot() {
        let t = TestGraph::new();
        let oid = t.publish("base", None, &[("a", b"ab", 0o644)]);

        assert!(t.graph.has_lineage(&name("base")).unwrap());
        let info = t.graph.snapshot(&name("base")).unwrap();
        assert_eq!(info.oid.to_string(), oid);
        assert!(info.parents.is_empty());
        assert_eq!(info.message, "updated base<<");
        assert_eq!(t.git(&["rev-parse", "refs/heads/strata/image/base"]), oid);
        assert!(t.worktrees_empty());
    }

    #[test]
    fn linear_extension_replaces_tree() {
        let t = TestGraph::new();
        let first = t.publish("base", None, &[("a", b"ab", 0o644), ("b", &[1, 2, 3], 0o640)]);
        let out = t.checkout("base");
        assert_eq!(top_level(out.path()), vec!["a", "b"]);

        t.publish(
            "base",
            None,
            &[("a", b"ab", 0o644), ("e", b"exe", 0o755), ("d/d/z", b"z\n", 0o644)],
        );
        let info = t.graph.snapshot(&name("base")).unwrap();
        assert_eq!(info.parents.len(), 1);
        assert_eq!(info.parents[0].to_string(), first);

        let out = t.checkout("base");
        assert_eq!(top_level(out.path()), vec!["a", "d", "e"]);
        assert!(!out.path().join("b").exists());
        assert_eq!(fs::read(out.path().join("d/d/z")).unwrap(), b"z\n");
        assert_eq!(mode(&out.path().join("e")), 0o755);
        assert_eq!(mode(&out.path().join("a")), 0o644);
    }

    #[test]
    fn round_trip_keeps_content_and_links() {
        let t = TestGraph::new();
        let lineage = name("tools");
        let mut place = |dir: &Path| -> Result<(), TransferError> {
            write_files(dir, &[("bin/run", b"#!/bin/sh\n", 0o755), ("etc/conf", b"k=v\n", 0o600)]);
            symlink("bin/run", dir.join("run")).unwrap();
            Ok(())
        };
        t.graph.publish(&lineage, None, &mut place).unwrap();

        let out = t.checkout("tools");
        assert_eq!(fs::read(out.path().join("bin/run")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(mode(&out.path().join("bin/run")), 0o755);
        assert_eq!(fs::read(out.path().join("etc/conf")).unwrap(), b"k=v\n");
        assert_eq!(mode(&out.path().join("etc/conf")), 0o600);
        assert_eq!(fs::read_link(out.path().join("run")).unwrap(), Path::new("bin/run"));

        let mut paths: Vec<String> = t.graph.paths(&lineage).unwrap().into_iter().map(|(p, _)| p).collect();
        paths.sort();
        assert_eq!(paths, vec!["bin/run", "etc/conf", "run"]);
    }

    #[test]
    fn full_modes_and_empty_dirs_survive() {
        let t = TestGraph::new();
        let lineage = name("modes");
        let mut place = |dir: &Path| -> Result<(), TransferError> {
            write_files(
                dir,
                &[("b", &[1, 2, 3], 0o640), ("sudo", b"root", 0o4755), ("srv/data", b"d", 0o644)],
            );
            fs::create_dir(dir.join("tmp")).unwrap();
            fs::set_permissions(dir.join("tmp"), fs::Permissions::from_mode(0o1777)).unwrap();
            fs::set_permissions(dir.join("srv"), fs::Permissions::from_mode(0o750)).unwrap();
            Ok(())
        };
        t.graph.publish(&lineage, None, &mut place).unwrap();

        // the tree itself still tracks files only
        let mut paths: Vec<String> = t.graph.paths(&lineage).unwrap().into_iter().map(|(p, _)| p).collect();
        paths.sort();
        assert_eq!(paths, vec!["b", "srv/data", "sudo"]);

        let out = t.checkout("modes");
        assert_eq!(mode(&out.path().join("b")), 0o640);
        assert_eq!(mode(&out.path().join("sudo")), 0o4755);
        assert_eq!(mode(&out.path().join("srv")), 0o750);
        assert!(out.path().join("tmp").is_dir());
        assert_eq!(mode(&out.path().join("tmp")), 0o1777);

        // a fork starts from the ancestor with its modes intact
        t.publish("derived", Some("modes"), &[("extra", b"x", 0o600)]);
        let out = t.checkout("derived");
        assert_eq!(mode(&out.path().join("b")), 0o640);
        assert_eq!(mode(&out.path().join("tmp")), 0o1777);
        assert_eq!(mode(&out.path().join("extra")), 0o600);
        assert!(t.worktrees_empty());
    }

    #[test]
    fn self_ancestor_republish_drops_old_files() {
        let t = TestGraph::new();
        let first = t.publish("line", None, &[("a", b"ab", 0o644), ("b", &[1, 2, 3], 0o640)]);
        assert_eq!(t.graph.paths(&name("line")).unwrap().len(), 2);

        t.publish(
            "line",
            Some("line"),
            &[("a", b"ab", 0o644), ("e", b"exe", 0o755), ("d/d/z", b"z\n", 0o644)],
        );
        let mut paths: Vec<String> = t.graph.paths(&name("line")).unwrap().into_iter().map(|(p, _)| p).collect();
        paths.sort();
        assert_eq!(paths, vec!["a", "d/d/z", "e"]);

        let info = t.graph.snapshot(&name("line")).unwrap();
        let parents: Vec<String> = info.parents.iter().map(|p| p.to_string()).collect();
        assert_eq!(parents, vec![first]);
        assert_eq!(info.message, "updated line<<line");

        // d/d resolves through two tree levels to a tree holding only z
        let tip = "refs/heads/strata/image/line";
        assert_eq!(t.git(&["cat-file", "-t", &format!("{tip}:d/d")]), "tree");
        assert_eq!(t.git(&["ls-tree", "--name-only", tip, "d/"]), "d/d");
        assert_eq!(t.git(&["ls-tree", "--name-only", &format!("{tip}:d/d")]), "z");

        let out = t.checkout("line");
        assert!(!out.path().join("b").exists());
        assert_eq!(fs::read(out.path().join("d/d/z")).unwrap(), b"z\n");
    }

    #[test]
    fn fork_starts_from_ancestor_tree() {
        let t = TestGraph::new();
        let base = t.publish("base", None, &[("os", b"ubuntu", 0o644)]);
        t.publish("app", Some("base"), &[("app", b"bin", 0o755)]);

        let info = t.graph.snapshot(&name("app")).unwrap();
        assert_eq!(info.parents.len(), 1);
        assert_eq!(info.parents[0].to_string(), base);
        assert_eq!(info.message, "updated app<<base");

        let out = t.checkout("app");
        assert_eq!(top_level(out.path()), vec!["app", "os"]);
        assert!(t.worktrees_empty());
    }

    #[test]
    fn republish_after_both_moved_has_two_parents() {
        let t = TestGraph::new();
        t.publish("base", None, &[("os", b"v1", 0o644)]);
        let app1 = t.publish("app", Some("base"), &[("app", b"1", 0o644)]);
        let base2 = t.publish("base", None, &[("os", b"v2", 0o644)]);
        t.publish("app", Some("base"), &[("os", b"v2", 0o644), ("app", b"2", 0o644)]);

        let info = t.graph.snapshot(&name("app")).unwrap();
        let parents: Vec<String> = info.parents.iter().map(|p| p.to_string()).collect();
        assert_eq!(parents, vec![base2, app1]);

        // the ancestor's history is reachable from the derived lineage
        let count = t.git(&["rev-list", "--count", "refs/heads/strata/image/app"]);
        assert_eq!(count, "4");
    }

    #[test]
    fn self_ancestor_starts_orphan() {
        let t = TestGraph::new();
        t.publish("ubuntu", Some("ubuntu"), &[("os", b"x", 0o644)]);
        let info = t.graph.snapshot(&name("ubuntu")).unwrap();
        assert!(info.parents.is_empty());
        assert_eq!(info.message, "updated ubuntu<<ubuntu");
    }

    #[test]
    fn missing_ancestor_fails_without_side_effects() {
        let t = TestGraph::new();
        let mut place = |_: &Path| -> Result<(), TransferError> { panic!("must not place") };
        let err = t
            .graph
            .publish(&name("app"), Some(&name("nope")), &mut place)
            .unwrap_err();
        assert!(matches!(err, GraphError::LineageNotFound { ref lineage } if lineage == "nope"));
        assert!(!t.graph.has_lineage(&name("app")).unwrap());
    }

    #[test]
    fn failing_place_leaves_lineage_untouched() {
        let t = TestGraph::new();
        let first = t.publish("base", None, &[("a", b"1", 0o644)]);
        let mut place = |dir: &Path| -> Result<(), TransferError> {
            write_files(dir, &[("half", b"written", 0o644)]);
            Err(TransferError::Io {
                context: "reading archive".into(),
                source: std::io::Error::other("truncated"),
            })
        };
        assert!(t.graph.publish(&name("base"), None, &mut place).is_err());
        assert_eq!(t.graph.snapshot(&name("base")).unwrap().oid.to_string(), first);
        assert!(t.worktrees_empty());
    }

    #[test]
    fn nested_lineage_names() {
        let t = TestGraph::new();
        t.publish("polydawn/base", None, &[("a", b"1", 0o644)]);
        let names: Vec<String> = t.graph.lineages().unwrap().iter().map(|l| l.to_string()).collect();
        assert_eq!(names, vec!["polydawn/base"]);
    }

    #[test]
    fn nesting_under_an_existing_lineage_is_refused() {
        let t = TestGraph::new();
        t.publish("a", None, &[("f", b"1", 0o644)]);
        t.publish("x/y", None, &[("f", b"1", 0o644)]);
        let mut place = |_: &Path| -> Result<(), TransferError> { panic!("must not place") };

        let err = t.graph.publish(&name("a/b"), None, &mut place).unwrap_err();
        assert!(
            matches!(err, GraphError::LineageConflict { ref lineage, ref existing } if lineage == "a/b" && existing == "a")
        );
        assert!(err.is_user_facing());

        let err = t.graph.publish(&name("x"), None, &mut place).unwrap_err();
        assert!(matches!(err, GraphError::LineageConflict { ref existing, .. } if existing == "x/y"));

        // a shared prefix that is not a whole component is fine
        t.publish("ab", None, &[("f", b"1", 0o644)]);
        let names: Vec<String> = t.graph.lineages().unwrap().iter().map(|l| l.to_string()).collect();
        assert_eq!(names, vec!["a", "ab", "x/y"]);
        assert!(t.worktrees_empty());
    }
}

mod load {
    use super::*;

    #[test]
    fn missing_lineage_is_not_found() {
        let t = TestGraph::new();
        let mut receive = ReceiveFn(|_: &Path| -> Result<(), TransferError> { panic!("must not receive") });
        let err = t.graph.load_lineage(&name("ghost"), &mut receive).unwrap_err();
        assert!(matches!(err, GraphError::LineageNotFound { .. }));
        assert!(t.worktrees_empty());
    }

    #[test]
    fn receive_sees_only_the_snapshot() {
        let t = TestGraph::new();
        t.publish("base", None, &[("only", b"1", 0o644)]);
        let mut seen = Vec::new();
        let mut receive = ReceiveFn(|dir: &Path| -> Result<(), TransferError> {
            seen = top_level(dir);
            Ok(())
        });
        t.graph.load_lineage(&name("base"), &mut receive).unwrap();
        assert_eq!(seen, vec!["only"]);
    }
}

// =============================================================================
// Cleanse
// =============================================================================

mod cleanse {
    use super::*;

    #[test]
    fn removes_stale_trees_and_index() {
        let t = TestGraph::new();
        let stale = t.dir.join(WORKTREES_DIR).join("tree.stale");
        fs::create_dir_all(stale.join("locked")).unwrap();
        fs::write(stale.join("locked/file"), "x").unwrap();
        fs::set_permissions(stale.join("locked"), fs::Permissions::from_mode(0o500)).unwrap();
        fs::write(t.dir.join("index"), "junk").unwrap();

        t.graph.cleanse().unwrap();
        assert!(t.worktrees_empty());
        assert!(!t.dir.join("index").exists());

        // idempotent
        t.graph.cleanse().unwrap();
    }
}
