//! Exercises the lockfile-bracketed FITS write end to end (`spec.md` §4.6
//! step 6): create the lockfile (with the frame embedded), write the FITS
//! file, remove the lockfile, and confirm a crash before the write ever
//! happens still lets recovery reproduce the identical file from the
//! lockfile's embedded frame alone.

use archon_core::data::{FetchedFrame, FrameData, Geometry};
use archon_core::ports::FitsWriter;
use archon_storage::lockfile::Lockfile;
use archon_storage::FilesystemFitsWriter;
use chrono::Utc;
use std::collections::BTreeMap;
use tempfile::tempdir;

fn frame() -> FetchedFrame {
    FetchedFrame {
        controller: "ccd1".to_string(),
        data: FrameData::U16(vec![42u16; 9]),
        width: 3,
        height: 3,
        geometry: Geometry::default(),
    }
}

fn lockfile_for(target_path: String, exposure_no: u64) -> Lockfile {
    Lockfile {
        exposure_no,
        controller: "ccd1".to_string(),
        detector: Some("red".to_string()),
        target_path,
        started_at: Utc::now(),
        frame: frame(),
        header: BTreeMap::new(),
    }
}

#[tokio::test]
async fn successful_write_leaves_the_fits_file_and_clears_the_lockfile() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("ccd1_00001.fits").to_string_lossy().to_string();
    let lock = lockfile_for(target.clone(), 1);

    lock.create().await.unwrap();
    assert!(Lockfile::path_for(&target).exists());

    let writer = FilesystemFitsWriter::new();
    writer.write(&target, &lock.frame, &lock.header).await.unwrap();
    Lockfile::remove(&target).await.unwrap();

    assert!(std::path::Path::new(&target).exists());
    assert!(!Lockfile::path_for(&target).exists());
}

#[tokio::test]
async fn a_crash_before_the_write_still_lets_recovery_reproduce_the_file() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("ccd1_00002.fits").to_string_lossy().to_string();
    let lock = lockfile_for(target.clone(), 2);
    lock.create().await.unwrap();
    // The process "crashes" here, before the FITS write ever runs.
    assert!(!std::path::Path::new(&target).exists());

    let found = Lockfile::scan_dir(dir.path()).await.unwrap();
    assert_eq!(found.len(), 1);
    let recovered = found[0].as_ref().unwrap();
    assert_eq!(recovered.exposure_no, 2);
    assert_eq!(recovered.target_path, target);

    let writer = FilesystemFitsWriter::new();
    writer
        .write(&recovered.target_path, &recovered.frame, &recovered.header)
        .await
        .unwrap();
    Lockfile::remove(&recovered.target_path).await.unwrap();

    assert!(std::path::Path::new(&target).exists());
    assert!(!Lockfile::path_for(&target).exists());
}
