//! cli
//!
//! Command-line interface layer for strata.
//!
//! # Responsibilities
//!
//! - Parse command-line arguments and global flags
//! - Set up diagnostics
//! - Delegate to command handlers
//! - Turn the outcome into an exit code
//!
//! # Exit codes
//!
//! `0` success, `1` bad arguments, `2` internal failure, `10` a failure the
//! user can act on (bad config, missing image, unset identity, ...).

pub mod args;
pub mod commands;

pub use args::{Cli, Command};

use tracing_subscriber::EnvFilter;

use crate::core::failure::{classify, Failure, EXIT_BAD_ARGS, EXIT_OK};
use crate::engine;
use crate::ui::output;

/// Environment variable that turns on debug mode.
pub const DEBUG_ENV: &str = "DEBUG";

/// Run the CLI application and return the process exit code.
///
/// This is the main entry point called from `main.rs`.
pub fn run() -> i32 {
    let cli = match Cli::try_parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { EXIT_BAD_ARGS } else { EXIT_OK };
        }
    };

    let debug = cli.debug || debug_from_env();
    init_tracing(debug);

    let ctx = engine::Context {
        cwd: cli.cwd.clone(),
        debug,
        quiet: cli.quiet,
        ..engine::Context::default()
    };

    match commands::dispatch(cli.command, &ctx) {
        Ok(()) => EXIT_OK,
        Err(err) => report(&err, debug),
    }
}

/// Print a failure the way its class demands and pick the exit code.
pub fn report(err: &anyhow::Error, debug: bool) -> i32 {
    let failure = classify(err);
    match &failure {
        _ if debug => output::error(format!("{err:?}")),
        Failure::User(message) => output::error(message),
        Failure::Internal => output::error(format!("something went wrong; set {DEBUG_ENV}=1 for details")),
    }
    failure.exit_code()
}

fn debug_from_env() -> bool {
    std::env::var_os(DEBUG_ENV).is_some_and(|v| !v.is_empty() && v != "0")
}

/// Install the stderr subscriber; `RUST_LOG` overrides the default filter.
fn init_tracing(debug: bool) {
    let default = if debug { "strata=debug" } else { "strata=warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::failure::{EXIT_INTERNAL, EXIT_USER};
    use crate::engine::BuildError;

    #[test]
    fn user_facing_exit_code() {
        let err: anyhow::Error = BuildError::NotCached {
            image: "base:latest".into(),
        }
        .into();
        assert_eq!(report(&err, false), EXIT_USER);
    }

    #[test]
    fn internal_exit_code() {
        let err = anyhow::anyhow!("unexpected state");
        assert_eq!(report(&err, false), EXIT_INTERNAL);
        assert_eq!(report(&err, true), EXIT_INTERNAL);
    }
}
