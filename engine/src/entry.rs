//! Backup entries.
//!
//! This module defines the two payload types the archive engine consumes:
//! - BackupEntry: one file-system object observed through a snapshot
//! - MetadataEntry: a named byte stream contributed by an extension
//!
//! A BackupEntry is created during traversal, immutable thereafter, and
//! consumed exactly once by the archive engine. Read handles are opened
//! lazily and closed as soon as the entry has been written.

use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::EngineError;

/// Attribute bit marking a file as changed since the last full backup
/// (the DOS/NTFS archive bit).
pub const ATTR_ARCHIVE: u32 = 0x20;

/// Attribute bit marking a reparse point.
pub const ATTR_REPARSE_POINT: u32 = 0x400;

/// The kind of file-system object an entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file; streamed into the archive
    File,
    /// Directory; becomes a zero-length directory record
    Directory,
    /// Symbolic link; never materialized, prunes traversal
    Symlink,
    /// Non-symlink reparse point; never materialized, prunes traversal
    Reparse,
    /// Device nodes, sockets and other special objects
    Other,
}

/// One file-system object observed through a snapshot.
///
/// `snapshot_path` is where the object is read from (under the snapshot
/// device root); `real_path` is the translated path on the live volume,
/// used for exclusion matching and archive entry naming.
#[derive(Debug)]
pub struct BackupEntry {
    /// Path of the object on the snapshot device
    pub snapshot_path: PathBuf,

    /// Translated path on the original volume
    pub real_path: PathBuf,

    /// What kind of object this is
    pub kind: EntryKind,

    /// Size in bytes (0 for directories)
    pub size: u64,

    /// Creation time, if the platform records one
    pub created: Option<SystemTime>,

    /// Last modification time
    pub modified: Option<SystemTime>,

    /// Last access time
    pub accessed: Option<SystemTime>,

    /// Platform attribute bits (see `ATTR_ARCHIVE`, `ATTR_REPARSE_POINT`)
    pub attributes: u32,
}

impl BackupEntry {
    /// Build an entry by reading metadata from its snapshot path.
    ///
    /// Symlinks are not followed, so a link to a directory is reported as
    /// `EntryKind::Symlink` and never traversed.
    pub fn from_paths(snapshot_path: PathBuf, real_path: PathBuf) -> Result<Self, EngineError> {
        let meta = fs::symlink_metadata(&snapshot_path).map_err(|e| EngineError::TraversalFailed {
            path: snapshot_path.clone(),
            source: e,
        })?;

        let attributes = attributes_of(&meta);
        let kind = kind_of(&meta, attributes);
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        Ok(BackupEntry {
            snapshot_path,
            real_path,
            kind,
            size,
            created: meta.created().ok(),
            modified: meta.modified().ok(),
            accessed: meta.accessed().ok(),
            attributes,
        })
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// True when the archive attribute marks this entry as changed since
    /// the last full backup. Platforms without the attribute report true.
    pub fn has_archive_attribute(&self) -> bool {
        self.attributes & ATTR_ARCHIVE != 0
    }

    /// Open a read handle over the snapshot copy of this entry.
    pub fn open_reader(&self) -> io::Result<fs::File> {
        fs::File::open(&self.snapshot_path)
    }

    /// Probe whether the entry can actually be opened for reading.
    pub fn is_readable(&self) -> bool {
        self.open_reader().is_ok()
    }
}

fn kind_of(meta: &fs::Metadata, attributes: u32) -> EntryKind {
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if attributes & ATTR_REPARSE_POINT != 0 {
        EntryKind::Reparse
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

#[cfg(windows)]
fn attributes_of(meta: &fs::Metadata) -> u32 {
    use std::os::windows::fs::MetadataExt;
    meta.file_attributes()
}

// Platforms without DOS attribute bits treat every file as changed, so
// incremental mode degrades to a full backup there.
#[cfg(not(windows))]
fn attributes_of(_meta: &fs::Metadata) -> u32 {
    ATTR_ARCHIVE
}

/// A named byte stream contributed by an extension, appended to the
/// archive under the `metadata/` namespace after all backup entries.
pub struct MetadataEntry {
    /// Archive name of the stream (without the `metadata/` prefix)
    pub name: String,
    reader: Box<dyn Read>,
}

impl MetadataEntry {
    pub fn new(name: impl Into<String>, reader: Box<dyn Read>) -> Self {
        MetadataEntry {
            name: name.into(),
            reader,
        }
    }

    /// Wrap an in-memory payload.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(name, Box::new(Cursor::new(bytes)))
    }

    /// Consume the entry, yielding its name and stream.
    pub fn into_parts(self) -> (String, Box<dyn Read>) {
        (self.name, self.reader)
    }
}

impl fmt::Debug for MetadataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Derive the volume root of a path: the drive prefix on Windows, the
/// file-system root elsewhere. Relative paths fall back to the root
/// separator so every path maps onto some volume.
pub fn volume_root(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut root = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => root.push(prefix.as_os_str()),
            Component::RootDir => {
                root.push(std::path::MAIN_SEPARATOR.to_string());
                break;
            }
            _ => break,
        }
    }
    if root.as_os_str().is_empty() {
        PathBuf::from(std::path::MAIN_SEPARATOR.to_string())
    } else {
        root
    }
}
