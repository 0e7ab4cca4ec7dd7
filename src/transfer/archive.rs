//! transfer::archive
//!
//! Tar codec between a directory and a byte stream.
//!
//! Unpacking keeps mode bits and skips entries git cannot hold (device
//! nodes, fifos). Packing walks the tree in name order, records symlinks as
//! links, and writes every entry as owned by root so an image imported from
//! the graph does not inherit the builder's uid.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header, HeaderMode};

use super::{Place, Receive, TransferError};

/// Options for producing archives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// Normalize timestamps so the same tree always yields the same bytes.
    pub epoch: bool,
}

impl ArchiveOptions {
    fn header_mode(&self) -> HeaderMode {
        if self.epoch {
            HeaderMode::Deterministic
        } else {
            HeaderMode::Complete
        }
    }
}

/// Unpack a tar stream into `dir`.
pub fn unpack<R: Read>(reader: R, dir: &Path) -> Result<(), TransferError> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    // (path, mode) of directories to lock down once their children exist
    let mut sealed: Vec<(PathBuf, u32)> = Vec::new();

    let entries = archive
        .entries()
        .map_err(TransferError::io("reading archive"))?;
    for entry in entries {
        let mut entry = entry.map_err(TransferError::io("reading archive entry"))?;
        let kind = entry.header().entry_type();
        let path = entry
            .path()
            .map_err(TransferError::io("reading entry path"))?
            .into_owned();

        if is_root(&path) {
            continue;
        }
        if matches!(
            kind,
            EntryType::Char | EntryType::Block | EntryType::Fifo
        ) {
            tracing::debug!(path = %path.display(), ?kind, "skipping special file");
            continue;
        }

        let mode = entry.header().mode().unwrap_or(0o644);
        let unpacked = entry
            .unpack_in(dir)
            .map_err(TransferError::io(format!("unpacking {}", path.display())))?;
        if !unpacked {
            return Err(TransferError::Unsupported {
                path: path.display().to_string(),
                reason: "path escapes the target directory".into(),
            });
        }

        let target = dir.join(&path);
        if kind == EntryType::Directory && mode & 0o700 != 0o700 {
            set_mode(&target, mode | 0o700)?;
            sealed.push((target, mode));
        } else if kind == EntryType::Regular && mode & 0o400 == 0 {
            // must stay readable to be snapshotted
            set_mode(&target, mode | 0o600)?;
        }
    }

    for (path, mode) in sealed.into_iter().rev() {
        set_mode(&path, mode)?;
    }
    Ok(())
}

fn is_root(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::CurDir))
}

fn set_mode(path: &Path, mode: u32) -> Result<(), TransferError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(TransferError::io(format!("setting mode of {}", path.display())))
}

/// Pack the contents of `dir` (not `dir` itself) into a tar stream.
///
/// Returns the writer after the archive trailer has been written.
pub fn pack<W: Write>(dir: &Path, writer: W, options: ArchiveOptions) -> Result<W, TransferError> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    append_children(&mut builder, dir, Path::new(""), options.header_mode())?;
    let mut writer = builder
        .into_inner()
        .map_err(TransferError::io("finishing archive"))?;
    writer
        .flush()
        .map_err(TransferError::io("flushing archive"))?;
    Ok(writer)
}

fn append_children<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    rel: &Path,
    mode: HeaderMode,
) -> Result<(), TransferError> {
    let listing = root.join(rel);
    let mut children = fs::read_dir(&listing)
        .and_then(|it| it.collect::<io::Result<Vec<_>>>())
        .map_err(TransferError::io(format!("listing {}", listing.display())))?;
    children.sort_by_key(|child| child.file_name());

    for child in children {
        let rel_path = rel.join(child.file_name());
        let path = root.join(&rel_path);
        let meta = fs::symlink_metadata(&path)
            .map_err(TransferError::io(format!("reading metadata of {}", path.display())))?;
        let file_type = meta.file_type();
        let context = format!("archiving {}", rel_path.display());

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, mode);
        header.set_uid(0);
        header.set_gid(0);

        if file_type.is_symlink() {
            let link = fs::read_link(&path).map_err(TransferError::io(context.clone()))?;
            header.set_size(0);
            builder
                .append_link(&mut header, &rel_path, &link)
                .map_err(TransferError::io(context))?;
        } else if file_type.is_dir() {
            header.set_size(0);
            builder
                .append_data(&mut header, &rel_path, io::empty())
                .map_err(TransferError::io(context))?;
            append_children(builder, root, &rel_path, mode)?;
        } else if file_type.is_file() {
            let file = File::open(&path).map_err(TransferError::io(context.clone()))?;
            builder
                .append_data(&mut header, &rel_path, file)
                .map_err(TransferError::io(context))?;
        }
    }
    Ok(())
}

/// A [`Place`] that unpacks a tar stream.
#[derive(Debug)]
pub struct TarPlace<R> {
    reader: R,
}

impl<R: Read> TarPlace<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Place for TarPlace<R> {
    fn place(&mut self, dir: &Path) -> Result<(), TransferError> {
        unpack(&mut self.reader, dir)?;
        // consume trailing padding so the writer does not see a broken pipe
        io::copy(&mut self.reader, &mut io::sink()).map_err(TransferError::io("draining archive"))?;
        Ok(())
    }
}

/// A [`Receive`] that packs a directory into a tar stream.
#[derive(Debug)]
pub struct TarReceive<W> {
    writer: W,
    options: ArchiveOptions,
}

impl<W: Write> TarReceive<W> {
    pub fn new(writer: W, options: ArchiveOptions) -> Self {
        Self { writer, options }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Receive for TarReceive<W> {
    fn receive(&mut self, dir: &Path) -> Result<(), TransferError> {
        pack(dir, &mut self.writer, self.options)?;
        Ok(())
    }
}
