//! Crops a controller's full fetched buffer down to one detector's
//! rectangle (`spec.md` §4.6 step 5: "for each detector region defined in
//! the controller descriptor, crop the corresponding rectangle from the
//! fetched array").

use archon_core::data::{DetectorDescriptor, FetchedFrame, FrameData};
use archon_core::error::ArchonError;

/// Crops `frame` to `detector`'s rectangle, returning a new frame with the
/// detector's width/height and the same geometry metadata (geometry
/// describes the controller's clocking, not any one detector's crop).
///
/// # Errors
///
/// Returns [`ArchonError::Fetch`] if the detector's rectangle does not fit
/// within the fetched buffer's bounds.
pub fn crop_frame(frame: &FetchedFrame, detector: &DetectorDescriptor) -> Result<FetchedFrame, ArchonError> {
    if detector.x1 > frame.width || detector.y1 > frame.height {
        return Err(ArchonError::Fetch {
            controller: frame.controller.clone(),
            message: format!(
                "detector {} region [{},{},{},{}] exceeds fetched buffer bounds {}x{}",
                detector.name, detector.x0, detector.y0, detector.x1, detector.y1, frame.width, frame.height
            ),
        });
    }

    let data = match &frame.data {
        FrameData::U16(samples) => FrameData::U16(crop_rows(samples, frame.width, detector)),
        FrameData::U32(samples) => FrameData::U32(crop_rows(samples, frame.width, detector)),
    };

    Ok(FetchedFrame {
        controller: frame.controller.clone(),
        data,
        width: detector.width(),
        height: detector.height(),
        geometry: frame.geometry.clone(),
    })
}

fn crop_rows<T: Copy>(samples: &[T], full_width: u32, detector: &DetectorDescriptor) -> Vec<T> {
    let mut out = Vec::with_capacity((detector.width() * detector.height()) as usize);
    for y in detector.y0..detector.y1 {
        let row_start = (y * full_width + detector.x0) as usize;
        let row_end = (y * full_width + detector.x1) as usize;
        out.extend_from_slice(&samples[row_start..row_end]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use archon_core::data::Geometry;

    fn buffer_4x4() -> FetchedFrame {
        #[rustfmt::skip]
        let samples = vec![
             0,  1,  2,  3,
            10, 11, 12, 13,
            20, 21, 22, 23,
            30, 31, 32, 33,
        ];
        FetchedFrame {
            controller: "ccd1".to_string(),
            data: FrameData::U16(samples),
            width: 4,
            height: 4,
            geometry: Geometry::default(),
        }
    }

    #[test]
    fn crops_the_requested_rectangle_row_major() {
        let frame = buffer_4x4();
        let detector = DetectorDescriptor {
            name: "red".to_string(),
            x0: 1,
            y0: 1,
            x1: 3,
            y1: 3,
            sensor_tap: 'A',
        };
        let cropped = crop_frame(&frame, &detector).unwrap();
        assert_eq!(cropped.width, 2);
        assert_eq!(cropped.height, 2);
        match cropped.data {
            FrameData::U16(samples) => assert_eq!(samples, vec![11, 12, 21, 22]),
            other => panic!("expected U16, got {other:?}"),
        }
    }

    #[test]
    fn rejects_a_detector_rectangle_that_exceeds_the_buffer() {
        let frame = buffer_4x4();
        let detector = DetectorDescriptor {
            name: "red".to_string(),
            x0: 0,
            y0: 0,
            x1: 5,
            y1: 4,
            sensor_tap: 'A',
        };
        let err = crop_frame(&frame, &detector).unwrap_err();
        assert!(matches!(err, ArchonError::Fetch { .. }));
    }
}
