//! unpack command - Load images from the graph into the daemon cache

use std::path::Path;

use anyhow::{Context as _, Result};

use super::{start_dock, Settings};
use crate::core::types::{ImageRef, LineageName};
use crate::engine::build::import_from_graph;
use crate::engine::{BuildError, Context};
use crate::graph::Graph;
use crate::runtime::DockerCli;
use crate::transfer::ArchiveOptions;
use crate::ui::output;

/// Import the tip of each image's lineage under the image's name.
///
/// Every image is checked against the graph before the dock is started.
pub fn unpack(ctx: &Context, images: &[String], graph: Option<&Path>) -> Result<()> {
    let verbosity = ctx.verbosity();
    let settings = Settings::discover(ctx)?;
    let dir = match graph {
        Some(dir) => settings.cwd.join(dir),
        None => settings.load.folders.graph.clone(),
    };

    let store = Graph::new(&dir).with_context(|| format!("opening graph {}", dir.display()))?;
    store.cleanse()?;

    let mut wanted = Vec::with_capacity(images.len());
    for image in images {
        let lineage = LineageName::from_image(image)?;
        if !store.has_lineage(&lineage)? {
            return Err(BuildError::LineageMissing {
                lineage: lineage.to_string(),
                dir: store.dir().to_path_buf(),
            }
            .into());
        }
        wanted.push((ImageRef::parse(image), lineage));
    }

    let dock = start_dock(ctx, &settings.load.folders.dock)?;
    let runtime = DockerCli::new(&dock, ctx.debug);
    for (image, lineage) in &wanted {
        output::print(format!("Importing {image} from graph"), verbosity);
        let oid = import_from_graph(&store, lineage, image, &runtime, ArchiveOptions::default())?;
        output::debug(format!("{image} is snapshot {}", oid.short(7)), verbosity);
    }
    output::print("Successfully unpacked!", verbosity);
    Ok(())
}
