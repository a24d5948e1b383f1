//! A filesystem-backed [`FitsWriter`](archon_core::ports::FitsWriter):
//! encodes one FITS primary HDU (`spec.md` §6 "FITS file") and writes it
//! atomically (`spec.md` §4.6 step 6: temp path in the same directory, then
//! rename into place).
//!
//! No FITS-encoding crate is available anywhere in this workspace's
//! dependency corpus, so the format is hand-rolled here the same way
//! `archon-core::wire` hand-rolls the Archon wire protocol: a small, fully
//! tested codec rather than a dependency. The write-then-rename shape and
//! the size-validate-before-encode order follow the teacher's
//! `daq-storage::tiff_writer` and the atomic rename in
//! `daq-server::grpc::preset_service`.

use anyhow::{bail, Context};
use archon_core::data::{FetchedFrame, FrameData};
use archon_core::ports::FitsWriter;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

/// Writes FITS files to the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FilesystemFitsWriter;

impl FilesystemFitsWriter {
    /// Creates a new writer. Stateless: all configuration lives in the
    /// `path` passed to [`FitsWriter::write`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FitsWriter for FilesystemFitsWriter {
    async fn write(
        &self,
        path: &str,
        frame: &FetchedFrame,
        header: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let bytes = encode_fits(frame, header)?;
        let target = Path::new(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating parent directory for {path}"))?;
        }
        let tmp_path = temp_path_for(target);
        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("creating temp file {}", tmp_path.display()))?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, target)
            .await
            .with_context(|| format!("renaming {} into place at {path}", tmp_path.display()))?;
        Ok(())
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "frame.fits".to_string());
    target.with_file_name(format!(".{file_name}.tmp"))
}

/// Encodes `frame` and `header` as a single-HDU FITS file: an 80-byte-card,
/// 2880-byte-block header followed by big-endian pixel data padded to the
/// next block boundary.
fn encode_fits(frame: &FetchedFrame, header: &BTreeMap<String, String>) -> anyhow::Result<Vec<u8>> {
    let expected_len = frame.width as usize * frame.height as usize;
    if frame.data.len() != expected_len {
        bail!(
            "frame data length {} does not match width*height {}",
            frame.data.len(),
            expected_len
        );
    }

    let (bitpix, bzero) = match &frame.data {
        FrameData::U16(_) => (16i32, 32768i64),
        FrameData::U32(_) => (32i32, 2_147_483_648i64),
    };

    let mut cards = Vec::new();
    cards.push(fixed_card("SIMPLE", "T", Some("conforms to FITS standard")));
    cards.push(fixed_card("BITPIX", &bitpix.to_string(), Some("signed integer samples")));
    cards.push(fixed_card("NAXIS", "2", None));
    cards.push(fixed_card("NAXIS1", &frame.width.to_string(), Some("pixels per line")));
    cards.push(fixed_card("NAXIS2", &frame.height.to_string(), Some("lines")));
    cards.push(fixed_card("BZERO", &bzero.to_string(), Some("offset for unsigned samples")));
    cards.push(fixed_card("BSCALE", "1", None));
    for (key, value) in header {
        cards.push(string_card(key, value));
    }
    cards.push(format!("{:<80}", "END"));

    let mut header_bytes: Vec<u8> = cards.into_iter().flat_map(|c| c.into_bytes()).collect();
    pad_to_block(&mut header_bytes);

    let mut data_bytes = match &frame.data {
        FrameData::U16(samples) => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &sample in samples {
                let signed = sample as i64 - bzero;
                out.extend_from_slice(&(signed as i16).to_be_bytes());
            }
            out
        }
        FrameData::U32(samples) => {
            let mut out = Vec::with_capacity(samples.len() * 4);
            for &sample in samples {
                let signed = sample as i64 - bzero;
                out.extend_from_slice(&(signed as i32).to_be_bytes());
            }
            out
        }
    };
    pad_to_block(&mut data_bytes);

    header_bytes.extend_from_slice(&data_bytes);
    Ok(header_bytes)
}

fn pad_to_block(bytes: &mut Vec<u8>) {
    let remainder = bytes.len() % BLOCK_SIZE;
    if remainder != 0 {
        bytes.resize(bytes.len() + (BLOCK_SIZE - remainder), 0);
    }
}

/// A FITS card with an unquoted value, e.g. `SIMPLE  =                    T`.
fn fixed_card(key: &str, value: &str, comment: Option<&str>) -> String {
    let body = format!("{key:<8}= {value:>20}");
    finish_card(body, comment)
}

/// A FITS card with a single-quoted string value, escaping embedded quotes
/// by doubling them per the FITS standard.
fn string_card(key: &str, value: &str) -> String {
    let escaped = value.replace('\'', "''");
    let quoted = format!("'{escaped}'");
    let body = format!("{key:<8}= {quoted:<20}");
    finish_card(body, None)
}

fn finish_card(mut body: String, comment: Option<&str>) -> String {
    if let Some(comment) = comment {
        body.push_str(" / ");
        body.push_str(comment);
    }
    if body.len() > CARD_SIZE {
        body.truncate(CARD_SIZE);
    } else {
        body.push_str(&" ".repeat(CARD_SIZE - body.len()));
    }
    body
}
