//! core::paths
//!
//! Path normalization shared by the dock and the graph.
//!
//! Both identify their state by directory, so two spellings of the same
//! directory must compare equal: `./graph`, `graph/` and a symlinked parent
//! all normalize to the same absolute path. The directory itself may not
//! exist yet.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Make `path` absolute with symlinks resolved in its existing ancestors.
///
/// Relative paths are resolved against the process working directory.
pub fn normalize_dir(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    match fs::canonicalize(&absolute) {
        Ok(resolved) => Ok(resolved),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            match (absolute.parent(), absolute.file_name()) {
                (Some(parent), Some(name)) => Ok(normalize_dir(parent)?.join(name)),
                _ => Ok(absolute),
            }
        }
        Err(e) => Err(e),
    }
}
