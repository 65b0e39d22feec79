//! # snapbak Engine - Consistent Volume Backup Library
//!
//! A headless engine for point-in-time file-system backups of live volumes.
//! Designed as the foundation for multiple frontends (CLI, scheduled jobs,
//! automation).
//!
//! ## Overview
//!
//! The engine coordinates an OS snapshot facility, a filtered directory walk
//! and a streaming archive writer. It features:
//! - Per-volume snapshot lifecycle management with all-or-nothing setup and
//!   guaranteed teardown
//! - Breadth-first filtered traversal with per-directory error isolation
//! - A streaming zip archive engine with 64-bit size support
//! - Pluggable exclusion filters (full and incremental modes)
//! - Extension hooks for auxiliary metadata capture
//! - Byte-weighted progress reporting via callbacks (decoupled from UI
//!   technology) and cooperative cancellation
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{BackupJob, DirectProvider, JobConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load one or more jobs from a JSON job file
//! let configs = JobConfig::load_file(std::path::Path::new("jobs.json"))?;
//!
//! for config in configs {
//!     let mut job = BackupJob::new(config, Box::new(DirectProvider))?;
//!     let outcome = job.run(None);
//!     println!("{:?}", outcome);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **config**: Job configuration loading and validation
//! - **error**: Error types and run-control conditions
//! - **entry**: Backup and metadata entries
//! - **snapshot**: Snapshot capability traits, sessions and sets
//! - **filter**: Exclusion rules and filter strategies
//! - **archive**: Archive engine trait and the streaming zip engine
//! - **extension**: Extension hooks and the permission-capture extension
//! - **progress**: Progress tracking and the callback trait
//! - **job**: Job orchestration (construct, run, cancel)

pub mod archive;
pub mod config;
pub mod entry;
pub mod error;
pub mod extension;
pub mod filter;
pub mod job;
pub mod progress;
pub mod snapshot;

// Re-export main types and functions
pub use archive::{ArchiveEngine, ZipEngine};
pub use config::{ArchiveFormat, JobConfig};
pub use entry::{
    volume_root, BackupEntry, EntryKind, MetadataEntry, ATTR_ARCHIVE, ATTR_REPARSE_POINT,
};
pub use error::{EngineError, Interrupt};
pub use extension::{AclInventoryExtension, BackupExtension};
pub use filter::{ExclusionFilter, FullBackupFilter, IncrementalBackupFilter, Rule, RuleSet};
pub use job::{BackupJob, CancelToken, RunOutcome, DEFAULT_PREPARE_TIMEOUT};
pub use progress::{Progress, ProgressCallback};
pub use snapshot::{
    DirectProvider, SessionState, SnapshotProvider, SnapshotService, SnapshotSession, SnapshotSet,
};
