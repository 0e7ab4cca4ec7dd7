//! core::failure
//!
//! Classification of failures into user-facing and internal.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | bad command-line arguments |
//! | 2 | internal failure (a bug, or something the user cannot fix) |
//! | 10 | user-facing failure with an actionable message |
//!
//! Every typed error in the crate implements [`Classify`]. The CLI walks an
//! `anyhow` chain with [`classify`]; the first typed error found decides.

use crate::core::config::ConfigError;
use crate::core::types::TypeError;
use crate::dock::DockError;
use crate::engine::build::BuildError;
use crate::graph::GraphError;
use crate::runtime::RuntimeError;
use crate::transfer::TransferError;

pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGS: i32 = 1;
pub const EXIT_INTERNAL: i32 = 2;
pub const EXIT_USER: i32 = 10;

/// Errors that know whether the user can act on them.
pub trait Classify {
    fn is_user_facing(&self) -> bool;
}

/// Outcome of classifying an error chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Show this one-line message.
    User(String),
    /// Show a generic message; details only in debug mode.
    Internal,
}

impl Failure {
    pub fn exit_code(&self) -> i32 {
        match self {
            Failure::User(_) => EXIT_USER,
            Failure::Internal => EXIT_INTERNAL,
        }
    }
}

/// Classify an error chain.
///
/// Errors without any typed cause are internal.
pub fn classify(err: &anyhow::Error) -> Failure {
    for cause in err.chain() {
        if let Some(classified) = as_classify(cause) {
            return if classified.is_user_facing() {
                Failure::User(cause.to_string())
            } else {
                Failure::Internal
            };
        }
    }
    Failure::Internal
}

fn as_classify<'a>(cause: &'a (dyn std::error::Error + 'static)) -> Option<&'a dyn Classify> {
    if let Some(e) = cause.downcast_ref::<BuildError>() {
        return Some(e);
    }
    if let Some(e) = cause.downcast_ref::<GraphError>() {
        return Some(e);
    }
    if let Some(e) = cause.downcast_ref::<DockError>() {
        return Some(e);
    }
    if let Some(e) = cause.downcast_ref::<RuntimeError>() {
        return Some(e);
    }
    if let Some(e) = cause.downcast_ref::<TransferError>() {
        return Some(e);
    }
    if let Some(e) = cause.downcast_ref::<ConfigError>() {
        return Some(e);
    }
    if let Some(e) = cause.downcast_ref::<TypeError>() {
        return Some(e);
    }
    None
}

impl Classify for TypeError {
    fn is_user_facing(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn untyped_is_internal() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(classify(&err), Failure::Internal);
        assert_eq!(classify(&err).exit_code(), EXIT_INTERNAL);
    }

    #[test]
    fn typed_cause_under_context() {
        let err: anyhow::Result<()> = Err(TypeError::UnknownScheme("ftp".into()).into());
        let err = err.context("parsing --source").unwrap_err();
        match classify(&err) {
            Failure::User(message) => assert!(message.contains("ftp")),
            Failure::Internal => panic!("expected user-facing"),
        }
    }

    #[test]
    fn internal_typed_error() {
        let err: anyhow::Error = TransferError::Io {
            context: "writing archive".into(),
            source: std::io::Error::other("disk full"),
        }
        .into();
        assert_eq!(classify(&err), Failure::Internal);
    }

    #[test]
    fn user_exit_code() {
        assert_eq!(Failure::User("x".into()).exit_code(), EXIT_USER);
    }
}
