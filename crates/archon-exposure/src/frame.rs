//! Reshapes a raw `FETCH` byte buffer into byte-order-corrected samples
//! (`spec.md` §4.5 `fetch`: "re-shapes into a 2-D array, byte-order
//! corrected").

use archon_core::data::FrameData;
use archon_core::error::{ArchonError, ArchonResult};

/// Reinterprets `raw` as `bit_width`-wide big-endian unsigned samples.
///
/// # Errors
///
/// Returns [`ArchonError::Fetch`] if `raw`'s length does not divide evenly
/// by the sample width, or `bit_width` is neither 16 nor 32.
pub fn decode_frame(raw: &[u8], bit_width: u8, controller: &str) -> ArchonResult<FrameData> {
    match bit_width {
        16 => {
            if raw.len() % 2 != 0 {
                return Err(mismatch(controller, raw.len(), 2));
            }
            Ok(FrameData::U16(
                raw.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            ))
        }
        32 => {
            if raw.len() % 4 != 0 {
                return Err(mismatch(controller, raw.len(), 4));
            }
            Ok(FrameData::U32(
                raw.chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ))
        }
        other => Err(ArchonError::Fetch {
            controller: controller.to_string(),
            message: format!("unsupported pixel bit width {other}"),
        }),
    }
}

fn mismatch(controller: &str, len: usize, width: usize) -> ArchonError {
    ArchonError::Fetch {
        controller: controller.to_string(),
        message: format!("FETCH_MISMATCH: {len} bytes not divisible by sample width {width}"),
    }
}
