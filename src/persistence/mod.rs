//! Snapshot Persistence
//!
//! Writes the keyspace to `dir/dbfilename` and reads it back at startup.
//!
//! Snapshots are always taken inside a command on the synchronizer's worker,
//! so the copy is consistent without any locking. Encoding and the file
//! write then happen either inline (`SAVE`) or on a background thread
//! (`BGSAVE`), at most one background save at a time.
//!
//! Files are written to `<path>.tmp` and renamed into place, so a crash
//! mid-write never leaves a truncated snapshot behind.

pub mod rdb;

use crate::storage::{Clock, Snapshot};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, error, info};

pub use rdb::RdbError;

/// Errors saving or loading a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt snapshot: {0}")]
    Rdb(#[from] RdbError),

    #[error("Background save already in progress")]
    SaveInProgress,
}

/// Owns the snapshot file location and save bookkeeping.
#[derive(Debug)]
pub struct Persistence {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    /// Unix seconds of the last successful save
    last_save: AtomicU64,
    save_in_progress: AtomicBool,
    /// Number of completed saves, for INFO
    saves: AtomicU64,
}

impl Persistence {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let started = unix_secs(clock.as_ref());
        Self {
            path: path.into(),
            clock,
            last_save: AtomicU64::new(started),
            save_in_progress: AtomicBool::new(false),
            saves: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_save(&self) -> u64 {
        self.last_save.load(Ordering::Relaxed)
    }

    pub fn save_in_progress(&self) -> bool {
        self.save_in_progress.load(Ordering::Acquire)
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Reads the snapshot file. Returns `None` if it does not exist.
    pub fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot to load");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = rdb::decode(&data, self.clock.now())?;
        info!(
            path = %self.path.display(),
            keys = snapshot.len(),
            "Snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    /// Writes `snapshot` on the calling thread.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        if self.save_in_progress() {
            return Err(PersistenceError::SaveInProgress);
        }
        self.write(snapshot)
    }

    /// Writes `snapshot` on a background thread.
    pub fn background_save(self: &Arc<Self>, snapshot: Snapshot) -> Result<(), PersistenceError> {
        if self
            .save_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PersistenceError::SaveInProgress);
        }

        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("rdb-bgsave".to_string())
            .spawn(move || {
                if let Err(e) = this.write(&snapshot) {
                    error!(path = %this.path.display(), error = %e, "Background save failed");
                }
                this.save_in_progress.store(false, Ordering::Release);
            });

        if let Err(e) = spawned {
            self.save_in_progress.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let data = rdb::encode(snapshot, self.clock.now());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;

        self.last_save
            .store(unix_secs(self.clock.as_ref()), Ordering::Relaxed);
        self.saves.fetch_add(1, Ordering::Relaxed);
        info!(
            path = %self.path.display(),
            keys = snapshot.len(),
            bytes = data.len(),
            "Snapshot saved"
        );
        Ok(())
    }
}

fn unix_secs(clock: &dyn Clock) -> u64 {
    clock
        .now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
