//! ui
//!
//! User interaction utilities.
//!
//! # Modules
//!
//! - [`output`] - Output formatting and display
//!
//! # Design
//!
//! Everything meant for the person at the terminal goes through this
//! module. Diagnostics for developers go through `tracing` instead.

pub mod output;
