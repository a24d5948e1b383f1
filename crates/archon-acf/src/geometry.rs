//! Geometry derivation from a parsed ACF document (`spec.md` §4.3
//! `compute_geometry`).

use crate::document::AcfDocument;
use archon_core::data::{Geometry, TapLine};
use archon_core::error::{ArchonError, ArchonResult};

/// Derives `lines`/`pixels`/skip/overscan/binning geometry from the named
/// ACF parameters, and also derives the framemode taplines so the CCD area
/// map in the config file lines up with the buffer hardware actually writes.
///
/// # Errors
///
/// Returns [`ArchonError::Config`] if a required named parameter is absent,
/// cannot be parsed, or the declared tap lines don't sum to the total line
/// count.
pub fn compute_geometry(doc: &AcfDocument) -> ArchonResult<Geometry> {
    let lines = required_u32(doc, "Lines")?;
    let pixels = required_u32(doc, "Pixels")?;
    let pre_skip_lines = optional_u32(doc, "PreSkipLines");
    let pre_skip_pixels = optional_u32(doc, "PreSkipPixels");
    let post_skip_lines = optional_u32(doc, "PostSkipLines");
    let post_skip_pixels = optional_u32(doc, "PostSkipPixels");
    let overscan_lines = optional_u32(doc, "OverscanLines");
    let overscan_pixels = optional_u32(doc, "OverscanPixels");
    let vertical_binning = optional_u32(doc, "VerticalBinning").max(1);
    let horizontal_binning = optional_u32(doc, "HorizontalBinning").max(1);
    let total_lines = lines + pre_skip_lines + post_skip_lines + overscan_lines;

    let tap_lines = read_tap_lines(doc)?;
    let tap_line_total: u32 = tap_lines.iter().map(|t| t.lines).sum();
    if tap_line_total != total_lines {
        return Err(ArchonError::Config(format!(
            "tap lines sum to {tap_line_total} but the buffer clocks {total_lines} lines"
        )));
    }
    let framemode = tap_lines.len() as u32 - 1;

    Ok(Geometry {
        lines: total_lines,
        pixels: pixels + pre_skip_pixels + post_skip_pixels + overscan_pixels,
        pre_skip_lines,
        pre_skip_pixels,
        post_skip_lines,
        post_skip_pixels,
        overscan_lines,
        overscan_pixels,
        vertical_binning,
        horizontal_binning,
        framemode,
        tap_lines,
    })
}

/// Reads the `TapLines` count and its `TapLine0`, `TapLine1`, ... entries,
/// each formatted `TAP,LINES` (e.g. `A,512`), matching the Archon
/// convention of declaring one tapline per active readout channel.
fn read_tap_lines(doc: &AcfDocument) -> ArchonResult<Vec<TapLine>> {
    let count = required_u32(doc, "TapLines")?;
    if count == 0 {
        return Err(ArchonError::Config("'TapLines' must declare at least one tap".to_string()));
    }

    let mut tap_lines = Vec::with_capacity(count as usize);
    for i in 0..count {
        let key = format!("TapLine{i}");
        let raw = doc
            .named_value(&key)
            .ok_or_else(|| ArchonError::Config(format!("missing required parameter '{key}'")))?;
        let (tap, lines) = raw
            .split_once(',')
            .ok_or_else(|| ArchonError::Config(format!("parameter '{key}' is not 'TAP,LINES'")))?;
        let tap = tap
            .trim()
            .chars()
            .next()
            .ok_or_else(|| ArchonError::Config(format!("parameter '{key}' has an empty tap label")))?;
        let lines = lines
            .trim()
            .parse()
            .map_err(|_| ArchonError::Config(format!("parameter '{key}' line count is not a valid integer")))?;
        tap_lines.push(TapLine { tap, lines });
    }
    Ok(tap_lines)
}

fn required_u32(doc: &AcfDocument, name: &str) -> ArchonResult<u32> {
    doc.named_value(name)
        .ok_or_else(|| ArchonError::Config(format!("missing required parameter '{name}'")))?
        .parse()
        .map_err(|_| ArchonError::Config(format!("parameter '{name}' is not a valid integer")))
}

fn optional_u32(doc: &AcfDocument, name: &str) -> u32 {
    doc.named_value(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
