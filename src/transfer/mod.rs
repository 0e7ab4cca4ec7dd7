//! transfer
//!
//! Moving filesystem snapshots between directories and byte streams.
//!
//! # Architecture
//!
//! The graph never sees archives. It hands a scratch directory to a
//! [`Place`] (fill this directory) or a [`Receive`] (take this directory's
//! contents). The tar codec in [`archive`] implements both over any reader or
//! writer, and [`pipe`] connects those to a runtime call running on
//! another thread.
//!
//! # Example
//!
//! ```ignore
//! use strata::transfer::{pipe, TarReceive};
//!
//! let (writer, reader) = pipe();
//! let mut receive = TarReceive::new(writer, Default::default());
//! graph.load_lineage(&lineage, &mut receive)?;
//! receive.into_inner().close();
//! ```

pub mod archive;
pub mod pipe;

pub use self::pipe::{pipe, PipeReader, PipeWriter};
pub use self::archive::{ArchiveOptions, TarPlace, TarReceive};

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::core::failure::Classify;

/// Errors while packing or unpacking a snapshot.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The archive contained something that cannot be placed.
    #[error("unsupported archive entry {path}: {reason}")]
    Unsupported { path: String, reason: String },
}

impl TransferError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| TransferError::Io { context, source }
    }

    /// Whether the other end of a pipe went away.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, TransferError::Io { source, .. } if source.kind() == io::ErrorKind::BrokenPipe)
    }
}

impl Classify for TransferError {
    fn is_user_facing(&self) -> bool {
        false
    }
}

/// Fills an empty directory with a filesystem.
pub trait Place {
    fn place(&mut self, dir: &Path) -> Result<(), TransferError>;
}

/// Consumes the filesystem in a directory.
pub trait Receive {
    fn receive(&mut self, dir: &Path) -> Result<(), TransferError>;
}

impl<F> Place for F
where
    F: FnMut(&Path) -> Result<(), TransferError>,
{
    fn place(&mut self, dir: &Path) -> Result<(), TransferError> {
        self(dir)
    }
}

/// Adapter letting a closure act as a [`Receive`].
///
/// Closures already implement [`Place`], so this one needs a name.
pub struct ReceiveFn<F>(pub F);

impl<F> Receive for ReceiveFn<F>
where
    F: FnMut(&Path) -> Result<(), TransferError>,
{
    fn receive(&mut self, dir: &Path) -> Result<(), TransferError> {
        (self.0)(dir)
    }
}
