//! strata - build container images and version them in git
//!
//! strata runs a declared build target inside a transient container and
//! keeps the resulting filesystem as a snapshot in a named history
//! ("lineage") of an image graph: a bare git repository. Images move between
//! the graph, tar files, the registry index and the container daemon's cache.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface layer (parses args, delegates to handlers)
//! - [`engine`] - Plans and runs builds: fill cache, launch, publish or export
//! - [`core`] - Domain types, configuration, retry and failure policies
//! - [`graph`] - The image graph; the only module that talks to git
//! - [`dock`] - Discovering, spawning and stopping the container daemon
//! - [`runtime`] - Control calls against the daemon
//! - [`transfer`] - Tar codec and the in-memory pipe between threads
//! - [`ui`] - User-facing output
//!
//! # Invariants
//!
//! 1. A lineage ref only ever moves to a commit whose tree is a complete snapshot
//! 2. Scratch trees live under the graph and are removed when an operation ends
//! 3. A daemon is only stopped by the process that started it
//! 4. Every failure is classified as user-facing or internal before exit

pub mod cli;
pub mod core;
pub mod dock;
pub mod engine;
pub mod graph;
pub mod runtime;
pub mod transfer;
pub mod ui;
