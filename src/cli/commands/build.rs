//! build command - Transform an upstream image into a new one

use anyhow::Result;

use super::{execute, Settings};
use crate::core::types::ImagePath;
use crate::engine::{BuildOptions, BuildPlan, Context};
use crate::ui::output;

/// Build `target` from `source` into `destination`.
pub fn build(
    ctx: &Context,
    target: &str,
    source: &ImagePath,
    destination: &ImagePath,
    options: BuildOptions,
) -> Result<()> {
    let settings = Settings::discover(ctx)?;
    let config = settings.target(ctx, target)?;
    output::print(
        format!("Building from {} to {}", config.upstream, config.image),
        ctx.verbosity(),
    );

    let plan = BuildPlan::build(config, source, destination, &settings.load.folders, &settings.cwd, options)?;
    let report = execute(ctx, &settings, &plan)?;
    output::debug(format!("build finished: {report:?}"), ctx.verbosity());
    Ok(())
}
