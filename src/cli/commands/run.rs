//! run command - Run a container from a configured image

use anyhow::Result;

use super::{execute, Settings};
use crate::core::types::ImagePath;
use crate::engine::{BuildOptions, BuildPlan, Context};
use crate::ui::output;

/// Run `target`, bringing its image in from `source` if needed.
pub fn run(ctx: &Context, target: &str, source: &ImagePath) -> Result<()> {
    let settings = Settings::discover(ctx)?;
    let config = settings.target(ctx, target)?;
    output::print(format!("Running {}", config.image), ctx.verbosity());

    let plan = BuildPlan::run(config, source, &settings.load.folders, &settings.cwd, BuildOptions::default())?;
    let report = execute(ctx, &settings, &plan)?;
    if report.exit_code != 0 {
        output::print(format!("Container exited with status {}", report.exit_code), ctx.verbosity());
    }
    Ok(())
}
