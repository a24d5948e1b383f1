//! The persisted monotonic exposure counter (`spec.md` §6 "a persisted
//! exposure counter ... surviving process restarts").
//!
//! `spec.md` §5 scopes `archond` to a single process, so the counter only
//! needs to be safe against concurrent callers *within* that process; no
//! cross-process advisory-lock crate (`fs2`/`fs4`) appears anywhere in this
//! workspace's dependency corpus, and none is needed here. An in-process
//! [`tokio::sync::Mutex`] serializes increments, and each increment is
//! persisted with the same temp-write-then-rename sequence
//! `archon-storage::fits` uses, so a crash between writing and renaming
//! never leaves a half-written counter file behind.

use anyhow::Context;
use archon_core::ports::ExposureCounterStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A file-backed [`ExposureCounterStore`]. The file holds a single decimal
/// integer: the last exposure number handed out. A missing file is treated
/// as a fresh counter starting at zero.
#[derive(Debug)]
pub struct FileExposureCounterStore {
    path: PathBuf,
    value: Mutex<Option<u64>>,
}

impl FileExposureCounterStore {
    /// Creates a store backed by `path`. The file is not touched until the
    /// first [`next`](ExposureCounterStore::next) or
    /// [`current`](ExposureCounterStore::current) call.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), value: Mutex::new(None) }
    }

    async fn load(&self) -> anyhow::Result<u64> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .with_context(|| format!("parsing exposure counter at {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("reading exposure counter at {}", self.path.display())),
        }
    }

    async fn persist(&self, value: u64) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("creating exposure counter directory {}", parent.display())
            })?;
        }
        let tmp_path = temp_path_for(&self.path);
        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("creating temp counter file {}", tmp_path.display()))?;
        file.write_all(value.to_string().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming counter into place at {}", self.path.display()))?;
        Ok(())
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "exposure_counter".to_string());
    target.with_file_name(format!(".{file_name}.tmp"))
}

#[async_trait]
impl ExposureCounterStore for FileExposureCounterStore {
    async fn next(&self) -> anyhow::Result<u64> {
        let mut guard = self.value.lock().await;
        let current = match *guard {
            Some(v) => v,
            None => self.load().await?,
        };
        let next = current + 1;
        self.persist(next).await?;
        *guard = Some(next);
        Ok(next)
    }

    async fn current(&self) -> anyhow::Result<u64> {
        let mut guard = self.value.lock().await;
        if let Some(v) = *guard {
            return Ok(v);
        }
        let loaded = self.load().await?;
        *guard = Some(loaded);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn next_starts_at_one_when_no_file_exists() {
        let dir = tempdir().unwrap();
        let store = FileExposureCounterStore::new(dir.path().join("counter"));
        assert_eq!(store.next().await.unwrap(), 1);
        assert_eq!(store.next().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn current_does_not_allocate() {
        let dir = tempdir().unwrap();
        let store = FileExposureCounterStore::new(dir.path().join("counter"));
        assert_eq!(store.current().await.unwrap(), 0);
        assert_eq!(store.current().await.unwrap(), 0);
        assert_eq!(store.next().await.unwrap(), 1);
        assert_eq!(store.current().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn value_survives_reconstruction_from_the_same_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter");
        {
            let store = FileExposureCounterStore::new(path.clone());
            store.next().await.unwrap();
            store.next().await.unwrap();
            store.next().await.unwrap();
        }
        let reopened = FileExposureCounterStore::new(path);
        assert_eq!(reopened.current().await.unwrap(), 3);
        assert_eq!(reopened.next().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn concurrent_next_calls_never_hand_out_duplicate_numbers() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(FileExposureCounterStore::new(dir.path().join("counter")));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.next().await.unwrap() }));
        }
        let mut results: Vec<u64> = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        results.sort_unstable();
        results.dedup();
        assert_eq!(results.len(), 20);
        assert_eq!(*results.last().unwrap(), 20);
    }
}
