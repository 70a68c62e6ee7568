// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use crate::camera::Frame;

/// Snapshot of the capture filter thresholds, taken once per handler pass.
/// Percentages are percent in 0..=100. A bound of zero disables its check.
#[derive(Copy, Clone, Debug, Default)]
pub struct FilterThresholds {
    pub lower_bound: u8,
    pub lower_percentage: u8,
    pub upper_bound: u8,
    pub upper_percentage: u8,
}

/// Accept/reject a capture before archival. Cheaply eliminates frames that
/// are all dark (obscured aperture) or all bright (sun in the field).
pub fn frame_passes(frame: &Frame, thresholds: &FilterThresholds) -> bool {
    if thresholds.lower_bound == 0 && thresholds.upper_bound == 0 {
        return true;
    }

    let gray = frame.to_gray();
    let total = gray.as_raw().len() as f64;

    // Enough pixels must be brighter than the lower bound.
    if thresholds.lower_bound > 0 {
        let lit = gray
            .as_raw()
            .iter()
            .filter(|&&v| v > thresholds.lower_bound)
            .count() as f64;
        if lit / total * 100.0 < thresholds.lower_percentage as f64 {
            return false;
        }
    }

    // Enough pixels must be dimmer than the upper bound.
    if thresholds.upper_bound > 0 {
        let dim = gray
            .as_raw()
            .iter()
            .filter(|&&v| v < thresholds.upper_bound)
            .count() as f64;
        if dim / total * 100.0 < thresholds.upper_percentage as f64 {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn flat_frame(value: u8) -> Frame {
        Frame::Gray(GrayImage::from_pixel(10, 10, image::Luma([value])))
    }

    #[test]
    fn test_no_bounds_accepts_everything() {
        let thresholds = FilterThresholds::default();
        assert!(frame_passes(&flat_frame(0), &thresholds));
        assert!(frame_passes(&flat_frame(255), &thresholds));
    }

    #[test]
    fn test_lower_bound_rejects_dark_frame() {
        let thresholds = FilterThresholds {
            lower_bound: 10,
            lower_percentage: 50,
            ..Default::default()
        };
        assert!(!frame_passes(&flat_frame(0), &thresholds));
        assert!(frame_passes(&flat_frame(100), &thresholds));
    }

    #[test]
    fn test_upper_bound_rejects_bright_frame() {
        let thresholds = FilterThresholds {
            upper_bound: 200,
            upper_percentage: 50,
            ..Default::default()
        };
        assert!(!frame_passes(&flat_frame(255), &thresholds));
        assert!(frame_passes(&flat_frame(0), &thresholds));
    }

    #[test]
    fn test_percentage_boundaries() {
        // Half of the pixels are bright; passes at 50%, fails just above.
        let mut img = GrayImage::new(10, 10);
        for y in 0..5 {
            for x in 0..10 {
                img.put_pixel(x, y, image::Luma([200]));
            }
        }
        let frame = Frame::Gray(img);
        let passing = FilterThresholds {
            lower_bound: 100,
            lower_percentage: 50,
            ..Default::default()
        };
        assert!(frame_passes(&frame, &passing));
        let failing = FilterThresholds {
            lower_bound: 100,
            lower_percentage: 51,
            ..Default::default()
        };
        assert!(!frame_passes(&frame, &failing));
    }

    #[test]
    fn test_both_bounds_must_pass() {
        // Flat mid-gray: bright enough for the lower check, dim enough for
        // the upper check.
        let frame = flat_frame(128);
        let thresholds = FilterThresholds {
            lower_bound: 100,
            lower_percentage: 90,
            upper_bound: 200,
            upper_percentage: 90,
        };
        assert!(frame_passes(&frame, &thresholds));

        // Raising the upper bound's percentage cannot fail a frame that is
        // entirely below the bound; lowering the bound below the frame
        // value does.
        let thresholds = FilterThresholds {
            lower_bound: 100,
            lower_percentage: 90,
            upper_bound: 64,
            upper_percentage: 10,
        };
        assert!(!frame_passes(&frame, &thresholds));
    }
}  // mod tests.
