//! strata entry point.

use std::panic;
use std::process;

use strata::core::failure::EXIT_INTERNAL;

fn main() {
    let code = match panic::catch_unwind(strata::cli::run) {
        Ok(code) => code,
        Err(_) => {
            eprintln!("error: something went wrong (panic); set DEBUG=1 for details");
            EXIT_INTERNAL
        }
    };
    process::exit(code);
}
