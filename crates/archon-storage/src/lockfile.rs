//! The sidecar lockfile format that brackets every FITS write (`spec.md`
//! §3 "External interfaces: ... a lockfile format", §4.6 step 6, §6
//! "Lockfile format").
//!
//! A lockfile is a small self-describing JSON document written next to the
//! destination FITS path *before* the write begins and removed only after
//! the write (and any checksum sidecar) completes. A lockfile left behind
//! at startup means the prior process died mid-write; `spec.md` §7 requires
//! the orchestrator to treat any such file as a candidate for recovery
//! rather than silently deleting it.

use archon_core::data::FetchedFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Errors raised while creating, reading, or removing a lockfile.
#[derive(Debug, Error)]
pub enum LockfileError {
    /// The lockfile (or its directory) could not be read or written.
    #[error("lockfile I/O error at {path}: {source}")]
    Io {
        /// Path the operation was attempted against.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The lockfile's contents did not parse as the expected JSON shape.
    #[error("malformed lockfile at {path}: {source}")]
    Malformed {
        /// Path of the unparsable lockfile.
        path: PathBuf,
        /// Underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// The self-describing contents of a sidecar lockfile: enough to recover
/// or clean up after an interrupted write without consulting any other
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    /// The monotonic exposure sequence number this write belongs to.
    pub exposure_no: u64,
    /// The controller whose frame is being written.
    pub controller: String,
    /// The detector region within that controller's frame, if this write
    /// is a per-detector crop rather than the whole buffer.
    pub detector: Option<String>,
    /// Final destination path of the FITS file this lockfile brackets.
    pub target_path: String,
    /// When the write began, for operator visibility during recovery.
    pub started_at: DateTime<Utc>,
    /// The frame this write is persisting, embedded so recovery can
    /// reproduce the exact same file without re-fetching from hardware
    /// (`spec.md` §4.6 "Recovery: ... their embedded frames written or
    /// re-written to the final path").
    pub frame: FetchedFrame,
    /// The computed header this write is persisting alongside `frame`.
    pub header: BTreeMap<String, String>,
}

impl Lockfile {
    /// Derives the lockfile path for a given FITS target path: the same
    /// directory and file stem, with a `.lock` suffix appended to the full
    /// file name (so `frame.fits` locks as `frame.fits.lock`).
    #[must_use]
    pub fn path_for(target_path: &str) -> PathBuf {
        let mut p = PathBuf::from(target_path);
        let file_name = p
            .file_name()
            .map(|n| format!("{}.lock", n.to_string_lossy()))
            .unwrap_or_else(|| "frame.fits.lock".to_string());
        p.set_file_name(file_name);
        p
    }

    /// Creates the lockfile on disk before the guarded write begins.
    /// Creates parent directories as needed; overwrites any stale lockfile
    /// already present at the same path (the caller is expected to have
    /// already decided, via recovery, that the prior write is abandoned).
    pub async fn create(&self) -> Result<(), LockfileError> {
        let path = Path::new(&self.target_path);
        let lock_path = Self::path_for(&self.target_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| LockfileError::Io { path: parent.to_path_buf(), source })?;
        }
        let body = serde_json::to_vec_pretty(self)
            .map_err(|source| LockfileError::Malformed { path: lock_path.clone(), source })?;
        let mut file = fs::File::create(&lock_path)
            .await
            .map_err(|source| LockfileError::Io { path: lock_path.clone(), source })?;
        file.write_all(&body)
            .await
            .map_err(|source| LockfileError::Io { path: lock_path.clone(), source })?;
        file.sync_all()
            .await
            .map_err(|source| LockfileError::Io { path: lock_path, source })?;
        Ok(())
    }

    /// Removes the lockfile after the guarded write has durably completed.
    /// Succeeds silently if the lockfile is already gone.
    pub async fn remove(target_path: &str) -> Result<(), LockfileError> {
        let lock_path = Self::path_for(target_path);
        match fs::remove_file(&lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockfileError::Io { path: lock_path, source }),
        }
    }

    /// Reads and parses a lockfile from disk.
    pub async fn read(lock_path: &Path) -> Result<Self, LockfileError> {
        let bytes = fs::read(lock_path)
            .await
            .map_err(|source| LockfileError::Io { path: lock_path.to_path_buf(), source })?;
        serde_json::from_slice(&bytes)
            .map_err(|source| LockfileError::Malformed { path: lock_path.to_path_buf(), source })
    }

    /// Scans `dir` (non-recursively) for `*.lock` sidecar files and parses
    /// each one, for startup recovery (`spec.md` §7). Entries that fail to
    /// parse are skipped with their path retained in the error slot so the
    /// caller can log rather than silently drop them.
    pub async fn scan_dir(dir: &Path) -> Result<Vec<Result<Self, LockfileError>>, LockfileError> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|source| LockfileError::Io { path: dir.to_path_buf(), source })?;
        let mut found = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|source| LockfileError::Io { path: dir.to_path_buf(), source })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("lock") {
                found.push(Self::read(&path).await);
            }
        }
        Ok(found)
    }
}
