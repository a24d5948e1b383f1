//! Per-detector FITS header composition (`spec.md` §4.6 step 5: "one FITS
//! primary HDU per detector region with a computed default header (geometry
//! keys, timestamps, exposure number, software version, backplane id,
//! gain/readnoise per tap, bias section coordinates) merged with
//! caller-supplied extras").
//!
//! [`archon_core::ports::default_header`] already covers the geometry and
//! identity keys shared by every detector on a controller; this module adds
//! the per-detector electronics keys that come from site configuration
//! rather than the live controller, then re-applies the caller's extras so
//! they always win.

use archon_core::data::{DetectorDescriptor, Geometry};
use archon_core::ports::default_header;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A rectangular bias (overscan) region within the cropped detector image,
/// in pixel coordinates, for the `BIASSEC` header keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasSection {
    /// Left edge, inclusive.
    pub x0: u32,
    /// Bottom edge, inclusive.
    pub y0: u32,
    /// Right edge, exclusive.
    pub x1: u32,
    /// Top edge, exclusive.
    pub y1: u32,
}

impl BiasSection {
    /// Renders as FITS's 1-indexed, inclusive `[x0:x1,y0:y1]` section
    /// notation.
    #[must_use]
    pub fn to_fits_notation(self) -> String {
        format!(
            "[{}:{},{}:{}]",
            self.x0 + 1,
            self.x1,
            self.y0 + 1,
            self.y1
        )
    }
}

/// Per-tap electronics characterization, sourced from site configuration
/// (not the controller, which has no notion of calibrated gain/readnoise).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TapCharacterization {
    /// Electrons per ADU.
    pub gain_e_per_adu: f64,
    /// Read noise, in electrons RMS.
    pub read_noise_e: f64,
}

/// Everything [`build_detector_header`] needs beyond what
/// [`default_header`] already computes from the exposure and geometry.
#[derive(Debug, Clone)]
pub struct DetectorHeaderContext<'a> {
    /// The detector this header describes.
    pub detector: &'a DetectorDescriptor,
    /// Identifies the controller backplane hardware revision, e.g. from
    /// the controller's `SYSTEM` section `BACKPLANE_TYPE`.
    pub backplane_id: &'a str,
    /// Per-tap gain/read-noise, if configured for this detector's sensor
    /// tap. Absent when the site has not characterized the tap.
    pub tap: Option<TapCharacterization>,
    /// The overscan/bias region within the cropped image, if any.
    pub bias_section: Option<BiasSection>,
}

/// Builds the full default FITS header for one detector's cropped image:
/// [`default_header`]'s geometry/identity keys, plus `BACKPLANE`,
/// `GAIN`/`RDNOISE` (when characterized), and `BIASSEC` (when present),
/// with `extras` applied last so caller-supplied values always win.
#[must_use]
pub fn build_detector_header(
    exposure_no: u64,
    controller: &str,
    geometry: &Geometry,
    exposed_at: DateTime<Utc>,
    software_version: &str,
    ctx: &DetectorHeaderContext<'_>,
    extras: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut header = default_header(
        exposure_no,
        controller,
        &ctx.detector.name,
        geometry,
        exposed_at,
        software_version,
        &BTreeMap::new(),
    );
    header.insert("BACKPLANE".to_string(), ctx.backplane_id.to_string());
    header.insert("TAPID".to_string(), ctx.detector.sensor_tap.to_string());
    if let Some(tap) = ctx.tap {
        header.insert("GAIN".to_string(), format!("{:.4}", tap.gain_e_per_adu));
        header.insert("RDNOISE".to_string(), format!("{:.4}", tap.read_noise_e));
    }
    if let Some(bias) = ctx.bias_section {
        header.insert("BIASSEC".to_string(), bias.to_fits_notation());
    }
    for (k, v) in extras {
        header.insert(k.clone(), v.clone());
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> DetectorDescriptor {
        DetectorDescriptor {
            name: "red".into(),
            x0: 0,
            y0: 0,
            x1: 100,
            y1: 100,
            sensor_tap: 'A',
        }
    }

    #[test]
    fn bias_section_uses_one_indexed_fits_notation() {
        let bias = BiasSection {
            x0: 0,
            y0: 90,
            x1: 100,
            y1: 100,
        };
        assert_eq!(bias.to_fits_notation(), "[1:100,91:100]");
    }

    #[test]
    fn header_includes_tap_and_bias_when_present() {
        let det = detector();
        let ctx = DetectorHeaderContext {
            detector: &det,
            backplane_id: "X16",
            tap: Some(TapCharacterization {
                gain_e_per_adu: 1.8,
                read_noise_e: 3.2,
            }),
            bias_section: Some(BiasSection {
                x0: 0,
                y0: 90,
                x1: 100,
                y1: 100,
            }),
        };
        let header = build_detector_header(
            7,
            "ccd1",
            &Geometry::default(),
            Utc::now(),
            "0.1.0",
            &ctx,
            &BTreeMap::new(),
        );
        assert_eq!(header["BACKPLANE"], "X16");
        assert_eq!(header["GAIN"], "1.8000");
        assert_eq!(header["RDNOISE"], "3.2000");
        assert_eq!(header["BIASSEC"], "[1:100,91:100]");
        assert_eq!(header["TAPID"], "A");
    }

    #[test]
    fn extras_override_everything_including_backplane() {
        let det = detector();
        let ctx = DetectorHeaderContext {
            detector: &det,
            backplane_id: "X16",
            tap: None,
            bias_section: None,
        };
        let mut extras = BTreeMap::new();
        extras.insert("BACKPLANE".to_string(), "custom".to_string());
        let header = build_detector_header(
            1,
            "ccd1",
            &Geometry::default(),
            Utc::now(),
            "0.1.0",
            &ctx,
            &extras,
        );
        assert_eq!(header["BACKPLANE"], "custom");
        assert!(!header.contains_key("GAIN"));
    }
}
