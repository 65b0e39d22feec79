//! Point-in-time volume snapshots.
//!
//! The platform snapshot facility is consumed through two capability traits:
//! `SnapshotProvider` opens one snapshot transaction per volume and
//! `SnapshotService` exposes the operations of that transaction. The engine
//! never names a concrete platform binding; `DirectProvider` is the portable
//! fallback that exposes the live volume as its own snapshot device.
//!
//! `SnapshotSession` drives one service instance through its linear
//! lifecycle, and `SnapshotSet` owns one session per distinct volume root
//! with all-or-nothing setup and unconditional teardown.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::entry::volume_root;
use crate::error::{EngineError, Interrupt};
use crate::job::CancelToken;

/// One snapshot transaction on one volume, as exposed by the platform
/// snapshot facility.
///
/// Implementations must tolerate `complete` and `delete` being called in any
/// state: teardown issues both as a best effort, and deleting a snapshot
/// that was never committed is a no-op, not an error.
pub trait SnapshotService {
    /// Add the volume to the snapshot transaction. Fails when the volume
    /// cannot be snapshotted.
    fn register_volume(&mut self, volume: &Path) -> Result<(), EngineError>;

    /// Notify dependent writers of the impending snapshot and block until
    /// they acknowledge or the timeout elapses.
    fn prepare(&mut self, timeout: Duration) -> Result<(), EngineError>;

    /// Perform the point-in-time copy; blocks until the device is ready.
    fn commit(&mut self) -> Result<(), EngineError>;

    /// Path prefix under which the snapshot's files are accessible.
    /// Only meaningful after `commit` succeeded.
    fn device_root(&self) -> Result<PathBuf, EngineError>;

    /// Send the completion notice to dependent writers.
    fn complete(&mut self, succeeded: bool) -> Result<(), EngineError>;

    /// Delete the snapshot and release the transaction.
    fn delete(&mut self) -> Result<(), EngineError>;
}

/// Factory for snapshot transactions, selected at startup.
pub trait SnapshotProvider {
    /// Open a fresh snapshot transaction. Fails when the underlying
    /// snapshot service is not running and cannot be started.
    fn begin(&self) -> Result<Box<dyn SnapshotService>, EngineError>;
}

/// Lifecycle state of a `SnapshotSession`. Transitions are linear and never
/// go backward; any failing step moves the session to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Discovered,
    Prepared,
    Committed,
    Completed,
    Deleted,
    Failed,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Created => "Created",
            SessionState::Discovered => "Discovered",
            SessionState::Prepared => "Prepared",
            SessionState::Committed => "Committed",
            SessionState::Completed => "Completed",
            SessionState::Deleted => "Deleted",
            SessionState::Failed => "Failed",
        }
    }
}

/// The lifecycle of one snapshot of one volume.
///
/// Owned exclusively by the `SnapshotSet` that created it. Path translation
/// is defined only once the session is `Committed`.
pub struct SnapshotSession {
    service: Box<dyn SnapshotService>,
    volume: PathBuf,
    device_root: Option<PathBuf>,
    state: SessionState,
    released: bool,
}

impl SnapshotSession {
    pub fn new(service: Box<dyn SnapshotService>, volume: PathBuf) -> Self {
        SnapshotSession {
            service,
            volume,
            device_root: None,
            state: SessionState::Created,
            released: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The volume root this session snapshots (the original drive identifier).
    pub fn volume(&self) -> &Path {
        &self.volume
    }

    /// Register the volume with the snapshot service.
    pub fn discover(&mut self) -> Result<(), EngineError> {
        self.expect(SessionState::Created, "discover")?;
        self.step(SessionState::Discovered, |session| {
            session.service.register_volume(&session.volume)
        })
    }

    /// Signal the impending snapshot to dependent writers and wait.
    pub fn prepare(&mut self, timeout: Duration) -> Result<(), EngineError> {
        self.expect(SessionState::Discovered, "prepare")?;
        self.step(SessionState::Prepared, |session| {
            session.service.prepare(timeout)
        })
    }

    /// Perform the point-in-time copy and record the device root.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        self.expect(SessionState::Prepared, "commit")?;
        self.step(SessionState::Committed, |session| {
            session.service.commit()?;
            session.device_root = Some(session.service.device_root()?);
            Ok(())
        })
    }

    /// Rewrite a live-volume path into its snapshot-device equivalent.
    pub fn translate_path(&self, real_path: &Path) -> Result<PathBuf, EngineError> {
        let device_root = self.device_root()?;
        let relative = real_path.strip_prefix(&self.volume).unwrap_or(real_path);
        Ok(device_root.join(relative))
    }

    /// Rewrite a snapshot-device path back onto the live volume.
    pub fn translate_back(&self, snapshot_path: &Path) -> Result<PathBuf, EngineError> {
        let device_root = self.device_root()?;
        let relative = snapshot_path
            .strip_prefix(&device_root)
            .unwrap_or(snapshot_path);
        Ok(self.volume.join(relative))
    }

    /// Send the completion notice. Some snapshot services reject this call
    /// in certain states; the failure is logged and swallowed.
    pub fn complete(&mut self, succeeded: bool) {
        if let Err(e) = self.service.complete(succeeded) {
            log::debug!(
                "completion notice rejected for volume {}: {}",
                self.volume.display(),
                e
            );
        }
        if self.state == SessionState::Committed {
            self.state = SessionState::Completed;
        }
    }

    /// Delete the snapshot and release the session handle. Idempotent;
    /// deleting a never-committed snapshot is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.service.delete() {
            log::warn!(
                "failed to delete snapshot for volume {}: {}",
                self.volume.display(),
                e
            );
        }
        if self.state != SessionState::Failed {
            self.state = SessionState::Deleted;
        }
    }

    /// Best-effort completion notice plus release, in teardown order.
    pub fn teardown(&mut self, succeeded: bool) {
        if self.released {
            return;
        }
        self.complete(succeeded);
        self.release();
    }

    fn device_root(&self) -> Result<PathBuf, EngineError> {
        self.device_root
            .clone()
            .ok_or_else(|| EngineError::SnapshotNotReady {
                volume: self.volume.clone(),
            })
    }

    fn expect(&self, want: SessionState, op: &'static str) -> Result<(), EngineError> {
        if self.state != want {
            return Err(EngineError::InvalidTransition {
                from: self.state.name(),
                op,
            });
        }
        Ok(())
    }

    fn step(
        &mut self,
        next: SessionState,
        action: impl FnOnce(&mut Self) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        match action(self) {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }
}

/// One committed snapshot per distinct volume root among the job's sources.
///
/// `acquire` either returns a fully committed set or tears down every
/// session it created and propagates the original error. `release` is
/// unconditional and idempotent; `Drop` is the backstop for early exits.
pub struct SnapshotSet {
    sessions: BTreeMap<PathBuf, SnapshotSession>,
    released: bool,
}

impl SnapshotSet {
    /// Group the sources by volume root and drive one session per volume
    /// through discover, prepare and commit.
    pub fn acquire(
        provider: &dyn SnapshotProvider,
        sources: &[PathBuf],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<SnapshotSet, Interrupt> {
        let volumes: BTreeSet<PathBuf> = sources.iter().map(|s| volume_root(s)).collect();

        let mut set = SnapshotSet {
            sessions: BTreeMap::new(),
            released: false,
        };

        for volume in volumes {
            if cancel.is_cancelled() {
                set.release(false);
                return Err(Interrupt::Cancelled);
            }

            log::info!("preparing volume {}", volume.display());
            let service = match provider.begin() {
                Ok(service) => service,
                Err(e) => {
                    set.release(false);
                    return Err(Interrupt::Failed(e));
                }
            };

            let mut session = SnapshotSession::new(service, volume.clone());
            let setup = session
                .discover()
                .and_then(|_| session.prepare(timeout))
                .and_then(|_| session.commit());

            match setup {
                Ok(()) => {
                    set.sessions.insert(volume, session);
                }
                Err(e) => {
                    session.teardown(false);
                    set.release(false);
                    return Err(Interrupt::Failed(e));
                }
            }
        }

        Ok(set)
    }

    /// The session covering the volume a path belongs to.
    pub fn session_for(&self, path: &Path) -> Option<&SnapshotSession> {
        self.sessions.get(&volume_root(path))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tear down every session: completion notice, then deletion. Safe to
    /// call multiple times; later calls are no-ops.
    pub fn release(&mut self, succeeded: bool) {
        if self.released {
            return;
        }
        self.released = true;
        for session in self.sessions.values_mut() {
            session.teardown(succeeded);
        }
    }
}

impl Drop for SnapshotSet {
    fn drop(&mut self) {
        self.release(false);
    }
}

/// Portable fallback provider: the live volume doubles as its own snapshot
/// device. There is no point-in-time guarantee; files modified during the
/// run are read in whatever state they are in.
#[derive(Debug, Default)]
pub struct DirectProvider;

impl SnapshotProvider for DirectProvider {
    fn begin(&self) -> Result<Box<dyn SnapshotService>, EngineError> {
        Ok(Box::new(DirectSession { volume: None }))
    }
}

struct DirectSession {
    volume: Option<PathBuf>,
}

impl SnapshotService for DirectSession {
    fn register_volume(&mut self, volume: &Path) -> Result<(), EngineError> {
        if !volume.exists() {
            return Err(EngineError::VolumeUnsupported {
                volume: volume.to_path_buf(),
            });
        }
        self.volume = Some(volume.to_path_buf());
        Ok(())
    }

    fn prepare(&mut self, _timeout: Duration) -> Result<(), EngineError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn device_root(&self) -> Result<PathBuf, EngineError> {
        self.volume.clone().ok_or_else(|| EngineError::Unknown {
            message: "no volume registered".to_string(),
        })
    }

    fn complete(&mut self, _succeeded: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn delete(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}
