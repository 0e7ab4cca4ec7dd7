//! publish command - Build from the graph into the same graph

use std::path::Path;

use anyhow::Result;

use super::{execute, Settings};
use crate::core::types::{ImagePath, Scheme};
use crate::engine::{BuildOptions, BuildPlan, Context};
use crate::ui::output;

/// Build `target` with the graph at `graph` as both source and destination.
pub fn publish(ctx: &Context, target: &str, graph: Option<&Path>) -> Result<()> {
    let settings = Settings::discover(ctx)?;
    let config = settings.target(ctx, target)?;

    let dir = match graph {
        Some(dir) => settings.cwd.join(dir),
        None => settings.load.folders.graph.clone(),
    };
    let store = ImagePath::new(Scheme::Graph, dir.to_string_lossy());
    output::print(
        format!("Publishing {} from {} in {}", config.image, config.upstream, dir.display()),
        ctx.verbosity(),
    );

    let plan = BuildPlan::build(config, &store, &store, &settings.load.folders, &settings.cwd, BuildOptions::default())?;
    execute(ctx, &settings, &plan)?;
    Ok(())
}
