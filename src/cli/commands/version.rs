//! version command - Print version information

use anyhow::Result;

use crate::engine::Context;

/// Print the crate version.
///
/// Printed even in quiet mode, since it is the command's only output.
pub fn version(_ctx: &Context) -> Result<()> {
    println!("strata {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
