//! ui::output
//!
//! Output formatting and display.
//!
//! # Design
//!
//! Progress lines go to stdout and respect the quiet flag. Warnings and
//! errors go to stderr; warnings may span several lines and each continuation
//! line is indented under the label.

use std::fmt::Display;

/// Output verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Quiet mode - minimal output
    Quiet,
    /// Normal mode - standard output
    Normal,
    /// Debug mode - verbose output
    Debug,
}

impl Verbosity {
    /// Create verbosity from flags.
    pub fn from_flags(quiet: bool, debug: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if debug {
            Verbosity::Debug
        } else {
            Verbosity::Normal
        }
    }
}

/// Print a message (respects quiet mode).
pub fn print(message: impl Display, verbosity: Verbosity) {
    if verbosity != Verbosity::Quiet {
        println!("{}", message);
    }
}

/// Print a debug message (only in debug mode).
pub fn debug(message: impl Display, verbosity: Verbosity) {
    if verbosity == Verbosity::Debug {
        eprintln!("[debug] {}", message);
    }
}

/// Print an error message (always shown).
pub fn error(message: impl Display) {
    eprintln!("{}", labelled("error", &message.to_string()));
}

/// Print a warning message (respects quiet mode).
pub fn warn(message: impl Display, verbosity: Verbosity) {
    if verbosity != Verbosity::Quiet {
        eprintln!("{}", labelled("warning", &message.to_string()));
    }
}

fn labelled(label: &str, message: &str) -> String {
    let indent = " ".repeat(label.len() + 2);
    let mut out = String::with_capacity(message.len() + label.len() + 2);
    for (i, line) in message.lines().enumerate() {
        if i == 0 {
            out.push_str(label);
            out.push_str(": ");
        } else {
            out.push('\n');
            if !line.is_empty() {
                out.push_str(&indent);
            }
        }
        out.push_str(line);
    }
    if out.is_empty() {
        out.push_str(label);
        out.push(':');
    }
    out
}
