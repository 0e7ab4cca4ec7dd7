//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! These flags are available on all commands:
//! - `--help` / `-h`: Show help
//! - `--version`: Show version
//! - `--cwd <path>`: Run as if in that directory
//! - `--debug`: Trace daemon calls and show full error chains
//! - `--quiet` / `-q`: Minimal output
//!
//! Source and destination values are `scheme[:path]` with scheme one of
//! `graph`, `file`, `docker` or `index`. They are parsed here, so an unknown
//! scheme is an argument error.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::types::ImagePath;

/// Target used by `run` when none is named.
pub const DEFAULT_RUN_TARGET: &str = "run";

/// Target used by `build` and `publish` when none is named.
pub const DEFAULT_BUILD_TARGET: &str = "build";

/// strata - build container images and version them in git
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run as if strata was started in this directory
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Trace every daemon call and print full error chains
    #[arg(long, global = true)]
    pub debug: bool,

    /// Minimal output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments, exiting on error.
    pub fn parse_args() -> Self {
        Parser::parse()
    }

    /// Parse command-line arguments, leaving error reporting to the caller.
    pub fn try_parse_args() -> Result<Self, clap::Error> {
        Parser::try_parse()
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a container from a configured image
    Run {
        /// Target table in strata.toml
        #[arg(default_value = DEFAULT_RUN_TARGET)]
        target: String,

        /// Where the image comes from
        #[arg(short, long, default_value = "graph")]
        source: ImagePath,
    },

    /// Transform an upstream image into a new one
    ///
    /// If the build container exits non-zero the build fails: nothing is
    /// exported and no snapshot is committed.
    Build {
        /// Target table in strata.toml
        #[arg(default_value = DEFAULT_BUILD_TARGET)]
        target: String,

        /// Where the upstream image comes from
        #[arg(short, long, default_value = "graph")]
        source: ImagePath,

        /// Where the result goes
        #[arg(short, long, default_value = "graph")]
        destination: ImagePath,

        /// Run /bin/true and save the result back under the upstream name
        #[arg(long)]
        noop: bool,

        /// Normalize timestamps of archives imported from the graph
        #[arg(long)]
        epoch: bool,
    },

    /// Build from the graph into the same graph
    ///
    /// If the build container exits non-zero nothing is committed to the
    /// graph.
    Publish {
        /// Target table in strata.toml
        #[arg(default_value = DEFAULT_BUILD_TARGET)]
        target: String,

        /// Image graph to use (defaults to the discovered graph folder)
        #[arg(long)]
        graph: Option<PathBuf>,
    },

    /// Load images from the graph into the daemon cache
    Unpack {
        /// Images to load
        #[arg(required = true)]
        images: Vec<String>,

        /// Image graph to use (defaults to the discovered graph folder)
        #[arg(long)]
        graph: Option<PathBuf>,
    },

    /// Print version information
    Version,
}
