//! Optional daily checksum sidecar (`spec.md` §6: "A checksum sidecar (md5
//! or sha1) may optionally be appended to a shared daily file").
//!
//! No `md5` or `sha1` crate is available anywhere in this workspace's
//! dependency corpus. `sha2` is — it is the teacher's own choice for this
//! exact kind of content-integrity hash (`daq-server::grpc::preset_service`
//! hashes saved presets with `Sha256`) — so this sidecar records SHA-256
//! digests instead of the spec's md5/sha1.

use archon_core::data::{FetchedFrame, FrameData};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Appends one `<sha256 hex>  <target_path>` line per persisted frame to a
/// single file shared by every write landing on the same UTC day.
#[derive(Debug, Clone)]
pub struct DailyChecksumSidecar {
    directory: PathBuf,
    enabled: bool,
}

impl DailyChecksumSidecar {
    /// Builds a sidecar writing under `directory`. `enabled` mirrors the
    /// site configuration toggle; when `false`, [`record`](Self::record) is
    /// a no-op.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, enabled: bool) -> Self {
        Self { directory: directory.into(), enabled }
    }

    fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.directory.join(format!("checksums-{}.sha256", at.format("%Y%m%d")))
    }

    /// Hashes `frame`'s sample data (in the same big-endian byte order the
    /// FITS writer encodes to disk) and appends a line naming `target_path`
    /// to the day's shared sidecar file. No-op when disabled.
    pub async fn record(&self, at: DateTime<Utc>, target_path: &str, frame: &FetchedFrame) -> std::io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.directory).await?;
        let mut hasher = Sha256::new();
        hasher.update(&sample_bytes(&frame.data));
        let digest = hasher.finalize();
        let line = format!("{digest:x}  {target_path}\n");
        let mut file = OpenOptions::new().create(true).append(true).open(self.path_for(at)).await?;
        file.write_all(line.as_bytes()).await
    }
}

fn sample_bytes(data: &FrameData) -> Vec<u8> {
    match data {
        FrameData::U16(samples) => samples.iter().flat_map(|s| s.to_be_bytes()).collect(),
        FrameData::U32(samples) => samples.iter().flat_map(|s| s.to_be_bytes()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archon_core::data::Geometry;
    use chrono::TimeZone;

    fn frame() -> FetchedFrame {
        FetchedFrame {
            controller: "ccd1".to_string(),
            data: FrameData::U16(vec![1, 2, 3, 4]),
            width: 2,
            height: 2,
            geometry: Geometry::default(),
        }
    }

    #[tokio::test]
    async fn disabled_sidecar_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = DailyChecksumSidecar::new(dir.path(), false);
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        sidecar.record(at, "ccd1.fits", &frame()).await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn appends_one_line_per_write_to_the_same_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = DailyChecksumSidecar::new(dir.path(), true);
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        sidecar.record(at, "ccd1.fits", &frame()).await.unwrap();
        sidecar.record(at, "ccd2.fits", &frame()).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("checksums-20260102.sha256")).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("ccd1.fits"));
        assert!(lines[1].ends_with("ccd2.fits"));
    }

    #[tokio::test]
    async fn different_days_get_different_files() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = DailyChecksumSidecar::new(dir.path(), true);
        let day1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        sidecar.record(day1, "a.fits", &frame()).await.unwrap();
        sidecar.record(day2, "b.fits", &frame()).await.unwrap();
        assert!(dir.path().join("checksums-20260102.sha256").exists());
        assert!(dir.path().join("checksums-20260103.sha256").exists());
    }
}
