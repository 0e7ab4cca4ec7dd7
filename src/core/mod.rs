//! core
//!
//! Core domain types, configuration, and shared policies for strata.
//!
//! # Modules
//!
//! - [`types`] - Strong types: ImageRef, LineageName, Oid, ImagePath
//! - [`config`] - `strata.toml` discovery and target resolution
//! - [`retry`] - Bounded polling policies
//! - [`paths`] - Directory normalization
//! - [`failure`] - User-facing vs internal error classification
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at construction time
//! - Schemas are strict and reject unknown keys
//! - Nothing here talks to the daemon or the graph

pub mod config;
pub mod failure;
pub mod paths;
pub mod retry;
pub mod types;
