//! Progress reporting.
//!
//! `Progress` tracks the byte-weighted completion of a run: a monotonically
//! non-decreasing `written` counter against a `total` fixed once traversal
//! has completed. `ProgressCallback` decouples the engine from any specific
//! UI; the CLI provides the console implementation, and all methods are
//! invoked synchronously during the run with no backpressure contract.

use std::path::Path;
use std::time::Duration;

use crate::config::JobConfig;
use crate::entry::BackupEntry;
use crate::job::RunOutcome;

/// Byte-weighted run progress.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    written: u64,
    total: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Progress { written: 0, total }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn add(&mut self, bytes: u64) {
        self.written += bytes;
    }

    /// Completed fraction in `[0, 1]`; defined as 0 when the total is 0.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.written as f64 / self.total as f64
        }
    }
}

/// Trait for receiving progress updates from a backup run.
///
/// All methods are called synchronously during job execution.
pub trait ProgressCallback: Send {
    /// Called when the run starts, before snapshot acquisition.
    fn on_run_started(&self, config: &JobConfig);

    /// Called once traversal has finished and the byte total is known.
    fn on_entries_collected(&self, count: usize, total_bytes: u64);

    /// Called before each entry is written.
    fn on_entry_started(&self, index: usize, count: usize, entry: &BackupEntry);

    /// Called when the active filter excludes a file.
    fn on_entry_excluded(&self, real_path: &Path);

    /// Called after each entry has been written.
    fn on_progress(&self, progress: Progress);

    /// Called when the run is over, on every outcome.
    fn on_run_completed(&self, outcome: &RunOutcome, elapsed: Duration);
}
