//! Archive engines.
//!
//! An archive engine is a three-phase writer: `init` allocates the output
//! artifact, `write_entry`/`write_metadata` append to it, `post` finalizes
//! and reports whether the artifact is usable. Writes outside the
//! init..post bracket are rejected with `NotReady`, a second `init` with
//! `AlreadyStarted`. `abort` closes the output handle and removes the
//! incomplete artifact; it is the cleanup path for cancelled or failed runs.
//!
//! The one concrete engine streams entries into a standard zip container.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::entry::{volume_root, BackupEntry, EntryKind, MetadataEntry};
use crate::error::EngineError;

const COPY_BUFFER_SIZE: usize = 4096;

/// Offset between the NTFS epoch (1601-01-01) and the Unix epoch, in
/// 100-nanosecond intervals.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Extra-field tag for NTFS timestamps.
const NTFS_EXTRA_TAG: u16 = 0x000a;

/// Three-phase archive writer.
pub trait ArchiveEngine {
    /// Allocate the output artifact.
    fn init(&mut self) -> Result<(), EngineError>;

    /// Append one backup entry; returns the number of payload bytes
    /// streamed. The entry's read handle is closed before returning.
    fn write_entry(&mut self, entry: &BackupEntry) -> Result<u64, EngineError>;

    /// Append an extension-contributed stream under the `metadata/`
    /// namespace.
    fn write_metadata(&mut self, meta: MetadataEntry) -> Result<(), EngineError>;

    /// Finalize and close the artifact; returns whether it is usable.
    fn post(&mut self) -> Result<bool, EngineError>;

    /// Close the output handle and remove the incomplete artifact.
    fn abort(&mut self);
}

/// Streaming zip engine.
///
/// Entry names are the volume letter plus the snapshot-relative path.
/// Files are streamed in fixed-size chunks and tagged with NTFS timestamp
/// extra fields; directories become zero-length directory records. 64-bit
/// size fields are enabled so single entries may exceed 4 GiB.
pub struct ZipEngine {
    target: PathBuf,
    comment: &'static str,
    writer: Option<ZipWriter<fs::File>>,
    started: bool,
    finished: bool,
}

impl ZipEngine {
    pub fn new(target: PathBuf, incremental: bool) -> Self {
        ZipEngine {
            target,
            comment: if incremental {
                "Incremental backup"
            } else {
                "Full backup"
            },
            writer: None,
            started: false,
            finished: false,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<fs::File>, EngineError> {
        self.writer.as_mut().ok_or(EngineError::NotReady)
    }

    fn stream_into<R: Read>(
        zip: &mut ZipWriter<fs::File>,
        reader: &mut R,
        context: &Path,
    ) -> Result<u64, EngineError> {
        let mut buffer = [0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = reader.read(&mut buffer).map_err(|e| EngineError::EntryWriteFailed {
                path: context.to_path_buf(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            zip.write_all(&buffer[..n])
                .map_err(|e| EngineError::EntryWriteFailed {
                    path: context.to_path_buf(),
                    source: e,
                })?;
            written += n as u64;
        }
        Ok(written)
    }
}

impl ArchiveEngine for ZipEngine {
    fn init(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        let file = fs::File::create(&self.target).map_err(|e| EngineError::TargetCreateFailed {
            path: self.target.clone(),
            source: e,
        })?;
        let mut zip = ZipWriter::new(file);
        zip.set_comment(self.comment);
        self.writer = Some(zip);
        self.started = true;
        Ok(())
    }

    fn write_entry(&mut self, entry: &BackupEntry) -> Result<u64, EngineError> {
        let zip = self.writer()?;
        let name = archive_entry_name(&entry.real_path);

        match entry.kind {
            EntryKind::Directory => {
                zip.add_directory(name, FileOptions::default())
                    .map_err(|e| zip_write_error(&entry.real_path, e))?;
                Ok(0)
            }
            EntryKind::File => {
                let mut options = FileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .large_file(true);
                if let Some(modified) = entry.modified.and_then(zip_datetime) {
                    options = options.last_modified_time(modified);
                }

                zip.start_file_with_extra_data(name, options)
                    .map_err(|e| zip_write_error(&entry.real_path, e))?;
                zip.write_all(&ntfs_times_field(entry))
                    .map_err(|e| EngineError::EntryWriteFailed {
                        path: entry.real_path.clone(),
                        source: e,
                    })?;
                zip.end_extra_data()
                    .map_err(|e| zip_write_error(&entry.real_path, e))?;

                let mut reader =
                    entry
                        .open_reader()
                        .map_err(|e| EngineError::EntryWriteFailed {
                            path: entry.snapshot_path.clone(),
                            source: e,
                        })?;
                // Handle is dropped, and therefore closed, as soon as the
                // entry has been streamed.
                Self::stream_into(zip, &mut reader, &entry.snapshot_path)
            }
            // Symlinks, reparse points and special files are never
            // materialized by the traversal.
            _ => Ok(0),
        }
    }

    fn write_metadata(&mut self, meta: MetadataEntry) -> Result<(), EngineError> {
        let zip = self.writer()?;
        let (name, mut reader) = meta.into_parts();
        let archive_path = PathBuf::from(format!("metadata/{}", name));

        zip.start_file(
            archive_path.to_string_lossy().into_owned(),
            FileOptions::default().compression_method(CompressionMethod::Deflated),
        )
        .map_err(|e| zip_write_error(&archive_path, e))?;
        Self::stream_into(zip, &mut reader, &archive_path)?;
        Ok(())
    }

    fn post(&mut self) -> Result<bool, EngineError> {
        let mut zip = self.writer.take().ok_or(EngineError::NotReady)?;
        match zip.finish() {
            Ok(file) => {
                drop(file);
                self.finished = true;
                Ok(true)
            }
            Err(e) => {
                let source = into_io_error(e);
                Err(EngineError::FinalizeFailed {
                    path: self.target.clone(),
                    source,
                })
            }
        }
    }

    fn abort(&mut self) {
        if !self.started || self.finished {
            return;
        }
        self.finished = true;
        if let Some(mut zip) = self.writer.take() {
            if let Err(e) = zip.finish() {
                log::debug!("archive close during abort failed: {}", e);
            }
        }
        match fs::remove_file(&self.target) {
            Ok(()) => log::info!("removed incomplete archive {}", self.target.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "could not remove incomplete archive {}: {}",
                self.target.display(),
                e
            ),
        }
    }
}

/// Archive-internal name of an entry: the volume label plus the path
/// relative to the volume root, with forward-slash separators.
fn archive_entry_name(real_path: &Path) -> String {
    let root = volume_root(real_path);
    let relative = real_path.strip_prefix(&root).unwrap_or(real_path);

    let mut name = volume_label(&root);
    for component in relative.components() {
        if let Component::Normal(part) = component {
            name.push('/');
            name.push_str(&part.to_string_lossy());
        }
    }
    name
}

/// The drive letter on Windows; "root" for the plain file-system root.
fn volume_label(root: &Path) -> String {
    let text = root.to_string_lossy();
    match text.chars().find(|c| c.is_ascii_alphanumeric()) {
        Some(letter) => letter.to_ascii_uppercase().to_string(),
        None => "root".to_string(),
    }
}

/// NTFS timestamp extra field: created/modified/accessed as FILETIME values.
fn ntfs_times_field(entry: &BackupEntry) -> Vec<u8> {
    let mut field = Vec::with_capacity(36);
    field.extend_from_slice(&NTFS_EXTRA_TAG.to_le_bytes());
    field.extend_from_slice(&32u16.to_le_bytes());
    field.extend_from_slice(&0u32.to_le_bytes()); // reserved
    field.extend_from_slice(&1u16.to_le_bytes()); // attribute tag: times
    field.extend_from_slice(&24u16.to_le_bytes());
    field.extend_from_slice(&filetime_of(entry.modified).to_le_bytes());
    field.extend_from_slice(&filetime_of(entry.accessed).to_le_bytes());
    field.extend_from_slice(&filetime_of(entry.created).to_le_bytes());
    field
}

fn filetime_of(time: Option<std::time::SystemTime>) -> u64 {
    match time.and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok()) {
        Some(elapsed) => FILETIME_UNIX_EPOCH + (elapsed.as_nanos() / 100) as u64,
        None => 0,
    }
}

fn zip_datetime(time: std::time::SystemTime) -> Option<zip::DateTime> {
    let local: DateTime<Local> = time.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}

fn zip_write_error(path: &Path, err: ZipError) -> EngineError {
    EngineError::EntryWriteFailed {
        path: path.to_path_buf(),
        source: into_io_error(err),
    }
}

fn into_io_error(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}
