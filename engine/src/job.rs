//! Backup job orchestration.
//!
//! `BackupJob` sequences one run: acquire the snapshot set, collect entries
//! through a breadth-first filtered traversal of the snapshotted trees,
//! stream them through the archive engine while invoking extensions, append
//! extension metadata, finalize, and release the snapshot set on every exit
//! path.
//!
//! Failure policy: configuration and snapshot-acquisition errors abort the
//! run; everything per-item (an unlistable directory, a locked file, a
//! misbehaving extension) is logged and skipped. Cancellation is cooperative:
//! `CancelToken` is polled before each snapshot acquisition, before each
//! dequeued directory and before each entry write, and anything not yet
//! written when it fires is discarded.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::archive::{ArchiveEngine, ZipEngine};
use crate::config::{ArchiveFormat, JobConfig};
use crate::entry::{BackupEntry, EntryKind};
use crate::error::{EngineError, Interrupt};
use crate::extension::{AclInventoryExtension, BackupExtension};
use crate::filter::{ExclusionFilter, FullBackupFilter, IncrementalBackupFilter};
use crate::progress::{Progress, ProgressCallback};
use crate::snapshot::{SnapshotProvider, SnapshotSet};

/// How long dependent writers get to acknowledge an impending snapshot.
pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared cancellation flag, polled at defined suspension points.
///
/// Cloning yields a handle onto the same flag, so a controlling thread can
/// request cancellation while the run is in flight. The in-flight operation
/// (a single file copy, a single snapshot commit) always completes before
/// cancellation is honored.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Terminal result of one run.
#[derive(Debug)]
pub enum RunOutcome {
    /// The archive was produced (or there was nothing to back up)
    Success,
    /// Cancellation was requested and honored; teardown completed
    Cancelled,
    /// A fatal error ended the run; teardown completed
    Failed(EngineError),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

/// The top-level backup controller.
///
/// Strategies (filter, engine, extensions) are fixed at construction from
/// the validated configuration; the traversal and write phases are
/// strategy-agnostic. A job is used for exactly one run and never shared
/// across concurrent runs targeting the same volume.
pub struct BackupJob {
    id: Uuid,
    config: JobConfig,
    provider: Box<dyn SnapshotProvider>,
    engine: Box<dyn ArchiveEngine>,
    filter: Box<dyn ExclusionFilter>,
    extensions: Vec<Box<dyn BackupExtension>>,
    cancel: CancelToken,
    prepare_timeout: Duration,
    progress: Progress,
}

impl BackupJob {
    /// Wire up a job from a validated configuration and a snapshot provider.
    ///
    /// The permission-capture extension is attached when the configuration
    /// names an ACL tool that exists; otherwise it is skipped with a
    /// warning, never an error.
    pub fn new(
        config: JobConfig,
        provider: Box<dyn SnapshotProvider>,
    ) -> Result<Self, EngineError> {
        if config.sources.is_empty() {
            return Err(EngineError::Configuration {
                reason: "no sources specified".to_string(),
            });
        }
        if config.target.as_os_str().is_empty() {
            return Err(EngineError::Configuration {
                reason: "no target specified".to_string(),
            });
        }

        let filter: Box<dyn ExclusionFilter> = if config.incremental {
            Box::new(IncrementalBackupFilter::new(config.rules.clone()))
        } else {
            Box::new(FullBackupFilter::new(config.rules.clone()))
        };

        let engine: Box<dyn ArchiveEngine> = match config.format {
            ArchiveFormat::Zip => {
                Box::new(ZipEngine::new(config.target.clone(), config.incremental))
            }
        };

        let mut extensions: Vec<Box<dyn BackupExtension>> = Vec::new();
        if let Some(tool) = &config.acl_tool {
            match AclInventoryExtension::new(tool.clone(), &config) {
                Ok(ext) => extensions.push(Box::new(ext)),
                Err(e) => log::warn!("permission capture disabled: {}", e),
            }
        }

        Ok(BackupJob {
            id: Uuid::new_v4(),
            config,
            provider,
            engine,
            filter,
            extensions,
            cancel: CancelToken::new(),
            prepare_timeout: DEFAULT_PREPARE_TIMEOUT,
            progress: Progress::default(),
        })
    }

    /// Replace the archive engine. Intended for alternative engines and
    /// for tests; the default is selected from the configuration.
    pub fn with_engine(mut self, engine: Box<dyn ArchiveEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn add_extension(&mut self, extension: Box<dyn BackupExtension>) {
        self.extensions.push(extension);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// A handle for requesting cancellation from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute the backup. The snapshot set is released on every exit path:
    /// success, fatal error, or cancellation.
    pub fn run(&mut self, callback: Option<&dyn ProgressCallback>) -> RunOutcome {
        self.progress = Progress::default();
        self.cancel.reset();
        let started = Instant::now();

        log::info!("starting backup job `{}` ({})", self.config.name, self.id);
        if let Some(cb) = callback {
            cb.on_run_started(&self.config);
        }

        let outcome = match self.execute(callback) {
            Ok(true) => RunOutcome::Success,
            Ok(false) => RunOutcome::Failed(EngineError::Unknown {
                message: "archive was not finalized cleanly".to_string(),
            }),
            Err(Interrupt::Cancelled) => RunOutcome::Cancelled,
            Err(Interrupt::Failed(e)) => RunOutcome::Failed(e),
        };

        let elapsed = started.elapsed();
        match &outcome {
            RunOutcome::Success => log::info!(
                "backup job `{}` finished in {}s",
                self.config.name,
                elapsed.as_secs()
            ),
            RunOutcome::Cancelled => {
                log::info!("backup job `{}` was cancelled", self.config.name)
            }
            RunOutcome::Failed(e) => {
                log::error!("backup job `{}` failed: {}", self.config.name, e)
            }
        }
        if let Some(cb) = callback {
            cb.on_run_completed(&outcome, elapsed);
        }
        outcome
    }

    fn execute(&mut self, callback: Option<&dyn ProgressCallback>) -> Result<bool, Interrupt> {
        let mut snapshots = SnapshotSet::acquire(
            self.provider.as_ref(),
            &self.config.sources,
            self.prepare_timeout,
            &self.cancel,
        )?;

        let result = self.backup_with(&snapshots, callback);
        snapshots.release(matches!(result, Ok(true)));
        result
    }

    fn backup_with(
        &mut self,
        snapshots: &SnapshotSet,
        callback: Option<&dyn ProgressCallback>,
    ) -> Result<bool, Interrupt> {
        log::info!("collecting backup entries");
        let entries = self.collect_entries(snapshots, callback)?;

        if entries.is_empty() {
            log::info!("there is nothing to back up");
            return Ok(true);
        }

        let total: u64 = entries.iter().map(|e| e.size).sum();
        self.progress = Progress::new(total);
        if let Some(cb) = callback {
            cb.on_entries_collected(entries.len(), total);
        }

        log::info!("creating backup ({} entries, {} bytes)", entries.len(), total);
        self.write_entries(&entries, callback)
    }

    /// Breadth-first traversal of every source through its snapshot.
    fn collect_entries(
        &self,
        snapshots: &SnapshotSet,
        callback: Option<&dyn ProgressCallback>,
    ) -> Result<Vec<BackupEntry>, Interrupt> {
        let mut entries = Vec::new();

        for source in &self.config.sources {
            let Some(session) = snapshots.session_for(source) else {
                log::warn!("no snapshot covers source {}", source.display());
                continue;
            };

            log::info!("scanning source: {}", source.display());
            let snap_source = session.translate_path(source).map_err(Interrupt::from)?;

            if snap_source.is_dir() {
                let mut queue = VecDeque::new();
                queue.push_back(snap_source);

                while let Some(dir) = queue.pop_front() {
                    if self.cancel.is_cancelled() {
                        return Err(Interrupt::Cancelled);
                    }
                    if let Err(e) =
                        self.scan_directory(&dir, snapshots, source, &mut queue, &mut entries, callback)
                    {
                        let real = session.translate_back(&dir).unwrap_or_else(|_| dir.clone());
                        log::warn!("{} is not accessible: {}", real.display(), e);
                    }
                }
            } else if snap_source.is_file() {
                let entry = BackupEntry::from_paths(snap_source, source.clone())
                    .map_err(Interrupt::from)?;
                self.consider_file(entry, &mut entries, callback);
            } else {
                log::warn!("source {} does not exist", source.display());
            }
        }

        Ok(entries)
    }

    /// One level of the traversal: list a snapshot directory, enqueue its
    /// eligible subdirectories and collect its eligible files.
    fn scan_directory(
        &self,
        dir: &Path,
        snapshots: &SnapshotSet,
        source: &Path,
        queue: &mut VecDeque<PathBuf>,
        entries: &mut Vec<BackupEntry>,
        callback: Option<&dyn ProgressCallback>,
    ) -> Result<(), EngineError> {
        let session = snapshots
            .session_for(source)
            .ok_or_else(|| EngineError::Unknown {
                message: format!("no snapshot covers {}", source.display()),
            })?;

        let listing = fs::read_dir(dir).map_err(|e| EngineError::TraversalFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

        for dirent in listing {
            let dirent = dirent.map_err(|e| EngineError::TraversalFailed {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let snap_path = dirent.path();
            let real_path = session.translate_back(&snap_path)?;

            let entry = match BackupEntry::from_paths(snap_path.clone(), real_path) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("skipping {}: {}", snap_path.display(), e);
                    continue;
                }
            };

            match entry.kind {
                EntryKind::Directory => {
                    if self.config.recursive && !self.filter.is_dir_excluded(&entry) {
                        queue.push_back(snap_path);
                    }
                }
                EntryKind::File => {
                    self.consider_file(entry, entries, callback);
                }
                // Symlinks and reparse points prune the walk regardless of
                // the filter; special files are never backed up.
                EntryKind::Symlink | EntryKind::Reparse | EntryKind::Other => {}
            }
        }

        Ok(())
    }

    fn consider_file(
        &self,
        entry: BackupEntry,
        entries: &mut Vec<BackupEntry>,
        callback: Option<&dyn ProgressCallback>,
    ) {
        if self.filter.is_file_excluded(&entry) {
            log::info!("file excluded: {}", entry.real_path.display());
            if let Some(cb) = callback {
                cb.on_entry_excluded(&entry.real_path);
            }
            return;
        }
        if !entry.is_readable() {
            log::warn!("file not readable, skipping: {}", entry.real_path.display());
            return;
        }
        entries.push(entry);
    }

    /// Drive the archive engine over the collected entries, then append
    /// extension metadata and finalize.
    fn write_entries(
        &mut self,
        entries: &[BackupEntry],
        callback: Option<&dyn ProgressCallback>,
    ) -> Result<bool, Interrupt> {
        if let Some(parent) = self.config.target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| EngineError::TargetCreateFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        self.engine.init().map_err(Interrupt::from)?;

        for (index, entry) in entries.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.engine.abort();
                return Err(Interrupt::Cancelled);
            }
            if let Some(cb) = callback {
                cb.on_entry_started(index, entries.len(), entry);
            }
            log::debug!("compressing: {}", entry.real_path.display());

            match self.engine.write_entry(entry) {
                Ok(_) => {
                    self.progress.add(entry.size);
                    if let Some(cb) = callback {
                        cb.on_progress(self.progress);
                    }
                    for extension in &mut self.extensions {
                        if let Err(e) = extension.on_write(entry) {
                            log::warn!(
                                "extension `{}` failed on {}: {}",
                                extension.name(),
                                entry.real_path.display(),
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    log::warn!("skipping {}: {}", entry.real_path.display(), e);
                }
            }
        }

        for extension in &mut self.extensions {
            match extension.get_metadata() {
                Ok(Some(meta)) => {
                    if let Err(e) = self.engine.write_metadata(meta) {
                        log::warn!(
                            "could not append metadata from `{}`: {}",
                            extension.name(),
                            e
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("extension `{}` contributed no metadata: {}", extension.name(), e);
                }
            }
        }

        match self.engine.post() {
            Ok(usable) => Ok(usable),
            Err(e) => {
                self.engine.abort();
                Err(Interrupt::Failed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::MetadataEntry;
    use crate::snapshot::DirectProvider;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::sync::Mutex;
    use zip::ZipArchive;

    fn write_file(path: &Path, contents: &[u8]) {
        let mut file = File::create(path).expect("Failed to create file");
        file.write_all(contents).expect("Failed to write file");
    }

    fn job_config(source: &Path, target_template: &str, exclude: Vec<&str>) -> JobConfig {
        let value = serde_json::json!({
            "name": "test",
            "options": { "target": target_template },
            "sources": [source.to_string_lossy()],
            "exclude": exclude,
        });
        JobConfig::from_value(&value).expect("Failed to validate config")
    }

    fn archive_names(target: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(target).expect("Failed to open archive"))
            .expect("Failed to read archive");
        archive.file_names().map(String::from).collect()
    }

    struct NullCallback;

    impl ProgressCallback for NullCallback {
        fn on_run_started(&self, _config: &JobConfig) {}
        fn on_entries_collected(&self, _count: usize, _total_bytes: u64) {}
        fn on_entry_started(&self, _index: usize, _count: usize, _entry: &BackupEntry) {}
        fn on_entry_excluded(&self, _real_path: &Path) {}
        fn on_progress(&self, _progress: Progress) {}
        fn on_run_completed(&self, _outcome: &RunOutcome, _elapsed: Duration) {}
    }

    /// Records fractions and optionally cancels at a chosen hook, standing
    /// in for a controlling thread requesting `stop()` mid-run.
    struct RecordingCallback {
        fractions: Mutex<Vec<f64>>,
        excluded: Mutex<Vec<PathBuf>>,
        cancel_on_collected: Option<CancelToken>,
        cancel_on_start: Option<CancelToken>,
    }

    impl RecordingCallback {
        fn new() -> Self {
            RecordingCallback {
                fractions: Mutex::new(Vec::new()),
                excluded: Mutex::new(Vec::new()),
                cancel_on_collected: None,
                cancel_on_start: None,
            }
        }
    }

    impl ProgressCallback for RecordingCallback {
        fn on_run_started(&self, _config: &JobConfig) {
            if let Some(token) = &self.cancel_on_start {
                token.cancel();
            }
        }

        fn on_entries_collected(&self, _count: usize, _total_bytes: u64) {
            if let Some(token) = &self.cancel_on_collected {
                token.cancel();
            }
        }

        fn on_entry_started(&self, _index: usize, _count: usize, _entry: &BackupEntry) {}

        fn on_entry_excluded(&self, real_path: &Path) {
            self.excluded.lock().unwrap().push(real_path.to_path_buf());
        }

        fn on_progress(&self, progress: Progress) {
            self.fractions.lock().unwrap().push(progress.fraction());
        }

        fn on_run_completed(&self, _outcome: &RunOutcome, _elapsed: Duration) {}
    }

    struct RecordingExtension {
        writes: Arc<Mutex<usize>>,
        fail_metadata: bool,
    }

    impl BackupExtension for RecordingExtension {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_write(&mut self, _entry: &BackupEntry) -> Result<(), EngineError> {
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        fn get_metadata(&mut self) -> Result<Option<MetadataEntry>, EngineError> {
            if self.fail_metadata {
                return Err(EngineError::ExtensionFailed {
                    name: "recorder".to_string(),
                    reason: "injected".to_string(),
                });
            }
            Ok(Some(MetadataEntry::from_bytes("recorder", b"seen".to_vec())))
        }
    }

    struct FailingEngine;

    impl ArchiveEngine for FailingEngine {
        fn init(&mut self) -> Result<(), EngineError> {
            Err(EngineError::TargetCreateFailed {
                path: PathBuf::from("nowhere"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected"),
            })
        }

        fn write_entry(&mut self, _entry: &BackupEntry) -> Result<u64, EngineError> {
            Err(EngineError::NotReady)
        }

        fn write_metadata(&mut self, _meta: MetadataEntry) -> Result<(), EngineError> {
            Err(EngineError::NotReady)
        }

        fn post(&mut self) -> Result<bool, EngineError> {
            Err(EngineError::NotReady)
        }

        fn abort(&mut self) {}
    }

    #[test]
    fn test_full_backup_archives_exactly_the_included_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"0123456789");
        write_file(&source.join("trace.log"), b"noise");
        fs::create_dir(source.join("sub")).expect("Failed to create subdir");
        write_file(&source.join("sub").join("b.txt"), b"nested");

        let template = temp_dir.path().join("out").join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec!["x/log/"]);
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        let callback = RecordingCallback::new();
        let outcome = job.run(Some(&callback));

        assert!(outcome.is_success(), "outcome was {:?}", outcome);
        assert_eq!(job.progress().total(), 16);
        assert_eq!(job.progress().fraction(), 1.0);

        let names = archive_names(&target);
        assert_eq!(names.len(), 2, "names were {:?}", names);
        assert!(names.iter().any(|n| n.ends_with("/a.txt")));
        assert!(names.iter().any(|n| n.ends_with("/b.txt")));

        let excluded = callback.excluded.lock().unwrap();
        assert_eq!(excluded.len(), 1);
        assert!(excluded[0].ends_with("trace.log"));
    }

    #[test]
    fn test_progress_fractions_are_monotonic() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        for i in 0..5 {
            write_file(&source.join(format!("f{}.bin", i)), &[0u8; 128]);
        }

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        let callback = RecordingCallback::new();
        assert!(job.run(Some(&callback)).is_success());

        let fractions = callback.fractions.lock().unwrap();
        assert_eq!(fractions.len(), 5);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*fractions.last().unwrap(), 1.0);
    }

    #[test]
    fn test_nothing_to_back_up_is_success_without_artifact() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"x");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec!["x/txt/"]);
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        let outcome = job.run(None);

        assert!(outcome.is_success(), "outcome was {:?}", outcome);
        assert!(!target.exists());
        assert_eq!(job.progress().fraction(), 0.0);
    }

    #[test]
    fn test_single_file_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("single.txt");
        write_file(&source, b"lonely");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        assert!(job.run(None).is_success());

        let names = archive_names(&target);
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("/single.txt"));
    }

    #[test]
    fn test_non_recursive_skips_subdirectories() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("top.txt"), b"top");
        fs::create_dir(source.join("sub")).expect("Failed to create subdir");
        write_file(&source.join("sub").join("deep.txt"), b"deep");

        let value = serde_json::json!({
            "name": "flat",
            "options": { "target": temp_dir.path().join("backup").to_string_lossy() },
            "flags": { "recursive": false },
            "sources": [source.to_string_lossy()],
        });
        let config = JobConfig::from_value(&value).expect("Failed to validate config");
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        assert!(job.run(None).is_success());

        let names = archive_names(&target);
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("/top.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directories_are_pruned() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let outside = temp_dir.path().join("outside");
        fs::create_dir(&outside).expect("Failed to create dir");
        write_file(&outside.join("secret.txt"), b"outside");

        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"inside");
        std::os::unix::fs::symlink(&outside, source.join("link")).expect("Failed to symlink");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        assert!(job.run(None).is_success());

        let names = archive_names(&target);
        assert_eq!(names.len(), 1, "names were {:?}", names);
        assert!(names[0].ends_with("/a.txt"));
    }

    #[test]
    fn test_cancellation_before_acquisition() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"x");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        let mut callback = RecordingCallback::new();
        callback.cancel_on_start = Some(job.cancel_token());

        let outcome = job.run(Some(&callback));
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert!(!target.exists());
    }

    #[test]
    fn test_cancellation_before_first_write_discards_everything() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"abc");
        write_file(&source.join("b.txt"), b"def");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        let mut callback = RecordingCallback::new();
        callback.cancel_on_collected = Some(job.cancel_token());

        let outcome = job.run(Some(&callback));
        assert!(matches!(outcome, RunOutcome::Cancelled));
        // The incomplete artifact was removed along with everything queued.
        assert!(!target.exists());
        assert!(callback.fractions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_engine_failure_is_a_failed_outcome() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"x");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);

        let mut job = BackupJob::new(config, Box::new(DirectProvider))
            .expect("Failed to build job")
            .with_engine(Box::new(FailingEngine));

        let outcome = job.run(Some(&NullCallback));
        assert!(matches!(
            outcome,
            RunOutcome::Failed(EngineError::TargetCreateFailed { .. })
        ));
    }

    #[test]
    fn test_extensions_observe_writes_and_contribute_metadata() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"one");
        write_file(&source.join("b.txt"), b"two");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);
        let target = config.target.clone();

        let writes = Arc::new(Mutex::new(0));
        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        job.add_extension(Box::new(RecordingExtension {
            writes: Arc::clone(&writes),
            fail_metadata: false,
        }));

        assert!(job.run(None).is_success());
        assert_eq!(*writes.lock().unwrap(), 2);

        let mut archive = ZipArchive::new(File::open(&target).expect("Failed to open archive"))
            .expect("Failed to read archive");
        let mut payload = String::new();
        archive
            .by_name("metadata/recorder")
            .expect("metadata missing")
            .read_to_string(&mut payload)
            .expect("Failed to read metadata");
        assert_eq!(payload, "seen");
    }

    #[test]
    fn test_failing_extension_does_not_abort_the_run() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("data");
        fs::create_dir(&source).expect("Failed to create source");
        write_file(&source.join("a.txt"), b"x");

        let template = temp_dir.path().join("backup");
        let config = job_config(&source, &template.to_string_lossy(), vec![]);
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        job.add_extension(Box::new(RecordingExtension {
            writes: Arc::new(Mutex::new(0)),
            fail_metadata: true,
        }));

        assert!(job.run(None).is_success());

        let names = archive_names(&target);
        assert_eq!(names.len(), 1);
        assert!(!names.iter().any(|n| n.starts_with("metadata/")));
    }

    #[test]
    fn test_missing_source_is_tolerated() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let present = temp_dir.path().join("present");
        fs::create_dir(&present).expect("Failed to create source");
        write_file(&present.join("a.txt"), b"x");
        let absent = temp_dir.path().join("absent");

        let value = serde_json::json!({
            "name": "partial",
            "options": { "target": temp_dir.path().join("backup").to_string_lossy() },
            "sources": [present.to_string_lossy(), absent.to_string_lossy()],
        });
        let config = JobConfig::from_value(&value).expect("Failed to validate config");
        let target = config.target.clone();

        let mut job = BackupJob::new(config, Box::new(DirectProvider)).expect("Failed to build job");
        assert!(job.run(None).is_success());
        assert_eq!(archive_names(&target).len(), 1);
    }
}
