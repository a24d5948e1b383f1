//! The core data model: controller/detector descriptors, buffer
//! descriptors, and exposure records (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rectangular readout area within a controller's virtual focal-plane
/// buffer, and the sensor tap that feeds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorDescriptor {
    /// Human-readable detector name, e.g. `"red"`.
    pub name: String,
    /// Left edge of the readout rectangle, inclusive, in buffer pixels.
    pub x0: u32,
    /// Top edge of the readout rectangle, inclusive, in buffer pixels.
    pub y0: u32,
    /// Right edge of the readout rectangle, exclusive, in buffer pixels.
    pub x1: u32,
    /// Bottom edge of the readout rectangle, exclusive, in buffer pixels.
    pub y1: u32,
    /// Which physical sensor tap feeds this detector (`A`, `B`, or `C`).
    pub sensor_tap: char,
}

impl DetectorDescriptor {
    /// Width of the readout rectangle in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    /// Height of the readout rectangle in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }
}

/// Identity and detector configuration for one Archon controller. Immutable
/// after construction per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerDescriptor {
    /// Human-readable controller name, e.g. `"ccd1"`. Used as the key
    /// everywhere the reply sink, lockfiles, and FITS paths refer to a
    /// controller.
    pub name: String,
    /// TCP host.
    pub host: String,
    /// TCP port (default 4242 per `spec.md` §6).
    pub port: u16,
    /// One or more detectors sharing this controller's readout buffer.
    pub detectors: Vec<DetectorDescriptor>,
}

/// A frame buffer slot on the controller (`spec.md` §3). There are
/// typically `N=3` of these per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// 1-based buffer index.
    pub index: u8,
    /// Whether the buffer holds a complete, readable frame.
    pub complete: bool,
    /// Monotonically increasing frame number for this controller.
    pub frame_number: u64,
    /// Buffer width in pixels.
    pub width: u32,
    /// Buffer height in pixels.
    pub height: u32,
    /// Pixel bit width: 16 or 32.
    pub bit_width: u8,
    /// Buffer timestamp as reported by the controller, seconds since the
    /// Archon epoch. Stored raw; `archon-exposure` converts it for headers.
    pub timestamp_raw: u64,
}

impl BufferDescriptor {
    /// Declared byte size of this buffer: `width * height * (bit_width / 8)`.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * (self.bit_width as usize / 8)
    }
}

/// Selects the buffer with the greatest complete frame number, per
/// `spec.md` §4.2/§8 ("fetch returns buffer 2" example). Returns `None` if
/// no buffer is complete.
#[must_use]
pub fn select_fetch_buffer(buffers: &[BufferDescriptor]) -> Option<&BufferDescriptor> {
    buffers
        .iter()
        .filter(|b| b.complete)
        .max_by_key(|b| b.frame_number)
}

/// A decoded, reshaped frame buffer: either 16- or 32-bit unsigned samples,
/// stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameData {
    /// 16-bit unsigned samples.
    U16(Vec<u16>),
    /// 32-bit unsigned samples.
    U32(Vec<u32>),
}

impl FrameData {
    /// Number of samples, regardless of bit width.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            FrameData::U16(v) => v.len(),
            FrameData::U32(v) => v.len(),
        }
    }

    /// True if there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One controller's fetched frame plus the geometry it was read out with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedFrame {
    /// Controller this frame came from.
    pub controller: String,
    /// Full-buffer pixel data, width x height as declared by the buffer
    /// descriptor it was fetched from.
    pub data: FrameData,
    /// Buffer width in pixels.
    pub width: u32,
    /// Buffer height in pixels.
    pub height: u32,
    /// Computed readout geometry (skips/overscan/binning), used both to
    /// crop per-detector regions and to populate FITS header geometry keys.
    pub geometry: Geometry,
}

/// Derived readout geometry, computed by `archon-acf::compute_geometry`
/// (`spec.md` §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Geometry {
    /// Total clocked lines, including pre/post-skip and overscan.
    pub lines: u32,
    /// Total clocked pixels per line, including pre/post-skip and overscan.
    pub pixels: u32,
    /// Lines skipped before the imaging region.
    pub pre_skip_lines: u32,
    /// Pixels skipped before the imaging region, per line.
    pub pre_skip_pixels: u32,
    /// Lines skipped after the imaging region.
    pub post_skip_lines: u32,
    /// Pixels skipped after the imaging region, per line.
    pub post_skip_pixels: u32,
    /// Overscan lines appended by the controller.
    pub overscan_lines: u32,
    /// Overscan pixels appended by the controller, per line.
    pub overscan_pixels: u32,
    /// Vertical (line) binning factor.
    pub vertical_binning: u32,
    /// Horizontal (pixel) binning factor.
    pub horizontal_binning: u32,
    /// Archon `FRAMEMODE` value this geometry implies: the number of active
    /// taps minus one (`0` for a single tap, `1` for a top/bottom split,
    /// ...). Governs how the fetched buffer's rows are laid out across taps.
    pub framemode: u32,
    /// Per-tap line counts declared by the ACF's `TapLines`/`TapLineN`
    /// parameters, in tap order. Their sum must equal `lines` so the CCD
    /// area map in the config file lines up with the buffer hardware
    /// actually writes.
    pub tap_lines: Vec<TapLine>,
}

/// One physical readout channel ("tap") contributing rows to a controller's
/// buffer, and the number of lines it clocks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapLine {
    /// Tap label as declared in the ACF (`A`, `B`, `C`, ...), matching
    /// [`DetectorDescriptor::sensor_tap`].
    pub tap: char,
    /// Lines this tap contributes to the buffer.
    pub lines: u32,
}

/// The shared inputs and per-controller outputs of one exposure
/// (`spec.md` §3). Created by the orchestrator before integration begins.
#[derive(Debug, Clone)]
pub struct ExposureRecord {
    /// Unbounded monotonic exposure sequence number.
    pub exposure_no: u64,
    /// Integration time, rounded to centiseconds (`spec.md` §8).
    pub integration_cs: u32,
    /// Whether readout follows integration automatically.
    pub auto_read: bool,
    /// Controllers participating in this exposure.
    pub controllers: Vec<String>,
    /// Caller-supplied extra FITS header entries, merged over the computed
    /// default header.
    pub extra_header: BTreeMap<String, String>,
    /// Wall-clock time the exposure was allocated, for header timestamps.
    pub started_at: DateTime<Utc>,
}

impl ExposureRecord {
    /// Integration time in whole seconds, rounded, for log messages.
    #[must_use]
    pub fn integration_seconds(&self) -> f64 {
        f64::from(self.integration_cs) / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(index: u8, complete: bool, frame_number: u64) -> BufferDescriptor {
        BufferDescriptor {
            index,
            complete,
            frame_number,
            width: 100,
            height: 100,
            bit_width: 16,
            timestamp_raw: 0,
        }
    }

    #[test]
    fn selects_highest_complete_frame_number() {
        let buffers = vec![buf(1, true, 10), buf(2, true, 12), buf(3, true, 11)];
        let selected = select_fetch_buffer(&buffers).unwrap();
        assert_eq!(selected.index, 2);
        assert_eq!(selected.frame_number, 12);
    }

    #[test]
    fn ignores_incomplete_buffers() {
        let buffers = vec![buf(1, true, 10), buf(2, false, 99)];
        let selected = select_fetch_buffer(&buffers).unwrap();
        assert_eq!(selected.index, 1);
    }

    #[test]
    fn buffer_byte_size() {
        let b = BufferDescriptor {
            index: 1,
            complete: true,
            frame_number: 1,
            width: 100,
            height: 100,
            bit_width: 16,
            timestamp_raw: 0,
        };
        assert_eq!(b.byte_size(), 100 * 100 * 2);
    }

    #[test]
    fn detector_width_height() {
        let d = DetectorDescriptor {
            name: "red".into(),
            x0: 10,
            y0: 20,
            x1: 110,
            y1: 220,
            sensor_tap: 'A',
        };
        assert_eq!(d.width(), 100);
        assert_eq!(d.height(), 200);
    }
}
