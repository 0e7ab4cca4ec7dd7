//! runtime::mock
//!
//! Mock runtime implementation for deterministic testing.
//!
//! # Design
//!
//! The mock keeps the image cache and every imported archive in memory,
//! records each call, and can be told to fail a chosen operation. Exports
//! replay a configured archive, so a test can drive the orchestrator end to
//! end against a real graph without a daemon.
//!
//! # Example
//!
//! ```
//! use strata::core::config::ContainerConfig;
//! use strata::core::types::ImageRef;
//! use strata::runtime::mock::{MockOperation, MockRuntime};
//! use strata::runtime::Runtime;
//!
//! let runtime = MockRuntime::new().with_cached(["ubuntu:14.04"]);
//! assert!(runtime.check_cache(&ImageRef::parse("ubuntu:14.04")).unwrap());
//!
//! let id = runtime.launch(&ContainerConfig::default()).unwrap();
//! assert_eq!(runtime.wait(&id).unwrap(), 0);
//! assert!(matches!(runtime.operations()[1], MockOperation::Launch { .. }));
//! ```

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ContainerId, Runtime, RuntimeError};
use crate::core::config::ContainerConfig;
use crate::core::types::ImageRef;

/// Mock runtime for testing.
///
/// Thread-safe via internal `Arc<Mutex<...>>` wrapping.
#[derive(Debug, Clone)]
pub struct MockRuntime {
    inner: Arc<Mutex<MockRuntimeInner>>,
}

#[derive(Debug)]
struct MockRuntimeInner {
    /// Cached images as `name:tag`.
    cache: BTreeSet<String>,
    /// Archive bytes received by each import, by `name:tag`.
    imported: HashMap<String, Vec<u8>>,
    /// Archive replayed by every export.
    export: Vec<u8>,
    /// Exit code reported by `wait`.
    exit_code: i32,
    next_container: u64,
    fail_on: Option<FailOn>,
    operations: Vec<MockOperation>,
}

/// Which operation should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    CheckCache,
    Pull,
    Import,
    Launch,
    Wait,
    Purge,
    Export,
    Commit,
}

/// Recorded operation for test verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOperation {
    CheckCache { image: String },
    Pull { image: String },
    Import { image: String, bytes: usize },
    ImportFromFile { path: PathBuf, image: String },
    Launch { image: String, command: Vec<String> },
    Wait { id: String },
    Purge { id: String },
    Export { id: String },
    Commit { id: String, image: String },
}

impl MockRuntime {
    /// Create a mock with an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockRuntimeInner {
                cache: BTreeSet::new(),
                imported: HashMap::new(),
                export: Vec::new(),
                exit_code: 0,
                next_container: 1,
                fail_on: None,
                operations: Vec::new(),
            })),
        }
    }

    /// Pre-populate the cache; entries without a tag get `latest`.
    pub fn with_cached<I, S>(self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        {
            let mut inner = self.lock();
            for image in images {
                inner.cache.insert(ImageRef::parse(image.as_ref()).to_string());
            }
        }
        self
    }

    /// Archive every export will produce.
    pub fn with_export(self, archive: Vec<u8>) -> Self {
        self.lock().export = archive;
        self
    }

    /// Exit code every container reports.
    pub fn with_exit_code(self, code: i32) -> Self {
        self.lock().exit_code = code;
        self
    }

    pub fn fail_on(self, fail_on: FailOn) -> Self {
        self.lock().fail_on = Some(fail_on);
        self
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<MockOperation> {
        self.lock().operations.clone()
    }

    /// Count recorded operations matching `pred`.
    pub fn count(&self, pred: impl Fn(&MockOperation) -> bool) -> usize {
        self.lock().operations.iter().filter(|op| pred(op)).count()
    }

    /// Bytes the last import of `image` received.
    pub fn imported(&self, image: &str) -> Option<Vec<u8>> {
        let key = ImageRef::parse(image).to_string();
        self.lock().imported.get(&key).cloned()
    }

    /// Whether `image` is currently cached.
    pub fn is_cached(&self, image: &str) -> bool {
        self.lock().cache.contains(&ImageRef::parse(image).to_string())
    }

    fn lock(&self) -> MutexGuard<'_, MockRuntimeInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: MockOperation) {
        self.lock().operations.push(op);
    }

    fn check_fail(&self, expected: FailOn) -> Result<(), RuntimeError> {
        if self.lock().fail_on == Some(expected) {
            return Err(RuntimeError::CommandFailed {
                command: format!("mock {expected:?}"),
                status: "exit status: 1".into(),
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for MockRuntime {
    fn check_cache(&self, image: &ImageRef) -> Result<bool, RuntimeError> {
        self.record(MockOperation::CheckCache {
            image: image.to_string(),
        });
        self.check_fail(FailOn::CheckCache)?;
        Ok(self.lock().cache.contains(&image.to_string()))
    }

    fn pull(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        self.record(MockOperation::Pull {
            image: image.to_string(),
        });
        self.check_fail(FailOn::Pull)?;
        self.lock().cache.insert(image.to_string());
        Ok(())
    }

    fn import(&self, stream: &mut dyn Read, image: &ImageRef) -> Result<(), RuntimeError> {
        self.check_fail(FailOn::Import)?;
        let mut bytes = Vec::new();
        stream
            .read_to_end(&mut bytes)
            .map_err(RuntimeError::io(format!("importing {image}")))?;
        self.record(MockOperation::Import {
            image: image.to_string(),
            bytes: bytes.len(),
        });
        let mut inner = self.lock();
        inner.cache.insert(image.to_string());
        inner.imported.insert(image.to_string(), bytes);
        Ok(())
    }

    fn import_from_file(&self, path: &Path, image: &ImageRef) -> Result<(), RuntimeError> {
        self.record(MockOperation::ImportFromFile {
            path: path.to_path_buf(),
            image: image.to_string(),
        });
        let mut file =
            std::fs::File::open(path).map_err(RuntimeError::io(format!("opening {}", path.display())))?;
        self.import(&mut file, image)
    }

    fn launch(&self, config: &ContainerConfig) -> Result<ContainerId, RuntimeError> {
        self.record(MockOperation::Launch {
            image: config.image.clone(),
            command: config.command.clone(),
        });
        self.check_fail(FailOn::Launch)?;
        let mut inner = self.lock();
        let id = ContainerId::new(format!("mock{:04}", inner.next_container));
        inner.next_container += 1;
        Ok(id)
    }

    fn wait(&self, id: &ContainerId) -> Result<i32, RuntimeError> {
        self.record(MockOperation::Wait { id: id.to_string() });
        self.check_fail(FailOn::Wait)?;
        Ok(self.lock().exit_code)
    }

    fn purge(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.record(MockOperation::Purge { id: id.to_string() });
        self.check_fail(FailOn::Purge)
    }

    fn export(&self, id: &ContainerId, writer: &mut dyn Write) -> Result<(), RuntimeError> {
        self.record(MockOperation::Export { id: id.to_string() });
        self.check_fail(FailOn::Export)?;
        let archive = self.lock().export.clone();
        io::copy(&mut archive.as_slice(), writer).map_err(RuntimeError::io(format!("exporting {id}")))?;
        Ok(())
    }

    fn commit(&self, id: &ContainerId, image: &ImageRef) -> Result<(), RuntimeError> {
        self.record(MockOperation::Commit {
            id: id.to_string(),
            image: image.to_string(),
        });
        self.check_fail(FailOn::Commit)?;
        self.lock().cache.insert(image.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_cache_entries_are_latest() {
        let runtime = MockRuntime::new().with_cached(["base"]);
        assert!(runtime.check_cache(&ImageRef::parse("base:latest")).unwrap());
        assert!(!runtime.check_cache(&ImageRef::parse("base:2")).unwrap());
    }

    #[test]
    fn import_caches_and_keeps_bytes() {
        let runtime = MockRuntime::new();
        let image = ImageRef::parse("app:v1");
        runtime.import(&mut &b"abc"[..], &image).unwrap();
        assert!(runtime.is_cached("app:v1"));
        assert_eq!(runtime.imported("app:v1").unwrap(), b"abc");
        assert_eq!(
            runtime.operations(),
            vec![MockOperation::Import {
                image: "app:v1".into(),
                bytes: 3
            }]
        );
    }

    #[test]
    fn containers_get_distinct_ids() {
        let runtime = MockRuntime::new();
        let a = runtime.launch(&ContainerConfig::default()).unwrap();
        let b = runtime.launch(&ContainerConfig::default()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fail_on_injects_error() {
        let runtime = MockRuntime::new().fail_on(FailOn::Pull);
        let err = runtime.pull(&ImageRef::parse("x")).unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { .. }));
        assert!(!runtime.is_cached("x"));
    }

    #[test]
    fn commit_caches_image() {
        let runtime = MockRuntime::new();
        let id = runtime.launch(&ContainerConfig::default()).unwrap();
        runtime.commit(&id, &ImageRef::parse("out:7")).unwrap();
        assert!(runtime.is_cached("out:7"));
    }
}
