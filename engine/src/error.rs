//! Error types for the backup engine.
//!
//! The primary error type is `EngineError`, which covers the failures that can
//! abort a run (configuration, snapshot acquisition, archive finalization) as
//! well as the per-item failures the orchestrator records and skips
//! (inaccessible directories, unwritable entries, extension faults).
//!
//! `Interrupt` is the run-control condition used between the orchestrator and
//! its phases: a phase either fails with an `EngineError` or observes the
//! cancellation flag. It is caught exactly once, in `BackupJob::run`.

use std::error::Error;
use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;

/// Errors raised by the backup engine.
///
/// Only configuration-time and snapshot-acquisition errors abort a run.
/// `TraversalFailed`, `EntryWriteFailed` and `ExtensionFailed` are per-item:
/// the orchestrator logs them and continues with the remaining work.
#[derive(Debug)]
pub enum EngineError {
    /// Job configuration is missing or invalid (no sources, bad target,
    /// unrecognized format, malformed exclusion rule)
    Configuration { reason: String },

    /// The snapshot service could not be reached or started
    ServiceUnavailable { reason: String },

    /// The volume cannot be snapshotted
    VolumeUnsupported { volume: PathBuf },

    /// Dependent writers did not acknowledge the impending snapshot in time
    PreparationTimeout { volume: PathBuf },

    /// The point-in-time copy itself failed
    SnapshotCreationFailed { volume: PathBuf, reason: String },

    /// Path translation was requested before the snapshot was committed
    SnapshotNotReady { volume: PathBuf },

    /// A snapshot session operation was invoked out of order
    InvalidTransition { from: &'static str, op: &'static str },

    /// The archive target (or its parent directory) could not be created
    TargetCreateFailed { path: PathBuf, source: io::Error },

    /// The archive engine was initialized twice
    AlreadyStarted,

    /// The archive engine received a write outside the init()..post() bracket
    NotReady,

    /// A directory could not be listed during traversal
    TraversalFailed { path: PathBuf, source: io::Error },

    /// A single entry could not be read or appended to the archive
    EntryWriteFailed { path: PathBuf, source: io::Error },

    /// The archive could not be finalized
    FinalizeFailed { path: PathBuf, source: io::Error },

    /// An extension misbehaved; its contribution is omitted
    ExtensionFailed { name: String, reason: String },

    /// Catch-all for unexpected errors
    Unknown { message: String },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { reason } => {
                write!(f, "Invalid job configuration: {}", reason)
            }
            Self::ServiceUnavailable { reason } => {
                write!(f, "Snapshot service is not available: {}", reason)
            }
            Self::VolumeUnsupported { volume } => {
                write!(f, "Volume does not support snapshots: {}", volume.display())
            }
            Self::PreparationTimeout { volume } => {
                write!(
                    f,
                    "Writers did not become ready in time on volume: {}",
                    volume.display()
                )
            }
            Self::SnapshotCreationFailed { volume, reason } => {
                write!(
                    f,
                    "Snapshot creation failed on volume {}: {}",
                    volume.display(),
                    reason
                )
            }
            Self::SnapshotNotReady { volume } => {
                write!(
                    f,
                    "Snapshot for volume {} has not been committed",
                    volume.display()
                )
            }
            Self::InvalidTransition { from, op } => {
                write!(f, "Snapshot session in state {} cannot {}", from, op)
            }
            Self::TargetCreateFailed { path, .. } => {
                write!(f, "Failed to create backup target: {}", path.display())
            }
            Self::AlreadyStarted => {
                write!(f, "Backup engine has already been started")
            }
            Self::NotReady => {
                write!(f, "The backup engine is not ready")
            }
            Self::TraversalFailed { path, .. } => {
                write!(f, "Failed to list directory: {}", path.display())
            }
            Self::EntryWriteFailed { path, .. } => {
                write!(f, "Failed to archive entry: {}", path.display())
            }
            Self::FinalizeFailed { path, .. } => {
                write!(f, "Failed to finalize archive: {}", path.display())
            }
            Self::ExtensionFailed { name, reason } => {
                write!(f, "Extension `{}` failed: {}", name, reason)
            }
            Self::Unknown { message } => {
                write!(f, "Engine error: {}", message)
            }
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::TargetCreateFailed { source, .. }
            | Self::TraversalFailed { source, .. }
            | Self::EntryWriteFailed { source, .. }
            | Self::FinalizeFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Unknown {
            message: err.to_string(),
        }
    }
}

/// Run-control condition for the orchestrator's internal phases.
///
/// `Cancelled` is produced when a phase observes the cancellation flag at one
/// of the defined suspension points; `Failed` wraps a fatal `EngineError`.
/// Both unwind to `BackupJob::run`, which converts them into a `RunOutcome`
/// after teardown has completed.
#[derive(Debug)]
pub enum Interrupt {
    /// Cancellation was requested and observed
    Cancelled,
    /// A fatal error ended the run
    Failed(EngineError),
}

impl From<EngineError> for Interrupt {
    fn from(err: EngineError) -> Self {
        Interrupt::Failed(err)
    }
}
