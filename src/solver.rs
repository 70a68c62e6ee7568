// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{not_found_error, CanonicalError};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::point::Point;
use log::debug;

use crate::camera::Frame;

/// Constellation matches below this probability are discarded.
pub const P_MATCH_THRESH: f64 = 0.99;

/// A star detected in a capture, in image-centre-relative coordinates of
/// the calibration frame.
#[derive(Clone, Debug)]
pub struct ImageStar {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
}

/// A candidate identification of the field of view.
#[derive(Clone, Debug)]
pub struct ConstellationMatch {
    pub probability: f64,
    pub star_count: usize,
    /// (declination, right ascension, roll), degrees. Declination is the
    /// rotation about the y axis, right ascension about the z axis, roll
    /// about the camera axis.
    pub orientation: (f64, f64, f64),
}

/// Query contract of the attitude identification library. Implementations
/// load the star catalogue and build their constellation index out of band;
/// that construction is slow (tens of seconds) and its failure is fatal to
/// the service.
pub trait StarCatalog: Send + Sync {
    /// (width, height) of the calibration frame the catalogue was built for.
    fn calibration_size(&self) -> (u32, u32);

    /// Pixel threshold separating star contours from background, on the
    /// median-subtracted grayscale image.
    fn detection_threshold(&self) -> f64;

    fn required_stars(&self) -> usize;

    fn max_false_stars(&self) -> usize;

    /// Match an image constellation built from the brightest stars against
    /// the whole-sky index.
    fn match_sky(&self, stars: &[ImageStar]) -> Result<ConstellationMatch, CanonicalError>;

    /// Refine `coarse` with a search bounded to its field of view, matched
    /// against the full star list.
    fn match_near(
        &self,
        coarse: &ConstellationMatch,
        stars: &[ImageStar],
    ) -> Result<ConstellationMatch, CanonicalError>;
}

/// Facade over the attitude library: turns a frame into centroids and runs
/// the two-stage constellation match.
pub struct Solver {
    catalog: Box<dyn StarCatalog>,

    // Calibrated median dark frame, resized to the calibration geometry.
    median_dark: Option<RgbImage>,
}

impl Solver {
    pub fn new(catalog: Box<dyn StarCatalog>, median_dark: Option<RgbImage>) -> Self {
        let (cal_width, cal_height) = catalog.calibration_size();
        let median_dark = median_dark
            .map(|img| imageops::resize(&img, cal_width, cal_height, FilterType::Triangle));
        Solver {
            catalog,
            median_dark,
        }
    }

    /// Derives (declination, right ascension, roll) in degrees from a single
    /// frame. A NotFound result means no high-confidence identification;
    /// callers log it and move on.
    pub fn solve(&self, frame: &Frame) -> Result<(f64, f64, f64), CanonicalError> {
        let gray = self.preprocess(frame);
        let stars = extract_stars(&gray, self.catalog.detection_threshold());
        debug!("{} star candidates", stars.len());

        // Only the brightest few stars go into the whole-sky match; false
        // detections beyond the budget would poison it.
        let budget = self.catalog.max_false_stars() + self.catalog.required_stars();
        let brightest: Vec<ImageStar> = stars.iter().take(budget).cloned().collect();

        let coarse = self.catalog.match_sky(&brightest)?;
        if coarse.probability <= P_MATCH_THRESH
            || coarse.star_count < self.catalog.required_stars()
        {
            return Err(not_found_error(
                format!(
                    "whole-sky match too weak (p={:.3}, {} stars)",
                    coarse.probability, coarse.star_count
                )
                .as_str(),
            ));
        }

        let refined = self.catalog.match_near(&coarse, &stars)?;
        if refined.probability <= P_MATCH_THRESH {
            return Err(not_found_error(
                format!("refined match too weak (p={:.3})", refined.probability).as_str(),
            ));
        }

        let (dec, ra, roll) = refined.orientation;
        debug!("solved: dec:{:.2} ra:{:.2} roll:{:.2}", dec, ra, roll);
        Ok((dec, ra, roll))
    }

    // Resizes to the calibration geometry, subtracts the median dark frame
    // (clipped at zero) and collapses to a single channel.
    fn preprocess(&self, frame: &Frame) -> GrayImage {
        let (cal_width, cal_height) = self.catalog.calibration_size();
        let resized = imageops::resize(
            &frame.to_rgb(),
            cal_width,
            cal_height,
            FilterType::Triangle,
        );
        let subtracted = match &self.median_dark {
            Some(dark) => {
                let data: Vec<u8> = resized
                    .as_raw()
                    .iter()
                    .zip(dark.as_raw().iter())
                    .map(|(&v, &d)| v.saturating_sub(d))
                    .collect();
                RgbImage::from_raw(cal_width, cal_height, data).unwrap()
            }
            None => resized,
        };
        imageops::grayscale(&subtracted)
    }
}

/// Thresholds `gray`, extracts outer contours and reduces each to a star
/// candidate: contour centroid in centre-relative coordinates, with the
/// underlying grayscale intensity sampled as flux. Sorted brightest first.
pub fn extract_stars(gray: &GrayImage, threshold: f64) -> Vec<ImageStar> {
    let (width, height) = gray.dimensions();
    let binary = GrayImage::from_raw(
        width,
        height,
        gray.as_raw()
            .iter()
            .map(|&v| if v as f64 > threshold { 255 } else { 0 })
            .collect(),
    )
    .unwrap();

    let mut stars = Vec::new();
    for contour in find_contours::<i32>(&binary) {
        if contour.border_type != BorderType::Outer {
            continue;
        }
        let Some((_area, cx, cy)) = contour_moments(&contour.points) else {
            continue;
        };
        // The centre pixel approximates the brightest pixel.
        let px = (cx.round() as u32).min(width - 1);
        let py = (cy.round() as u32).min(height - 1);
        let flux = gray.get_pixel(px, py).0[0] as f64;
        stars.push(ImageStar {
            x: cx - width as f64 / 2.0,
            y: cy - height as f64 / 2.0,
            flux,
        });
    }
    stars.sort_by(|a, b| b.flux.total_cmp(&a.flux));
    stars
}

// Zeroth moment (signed area made positive) and centroid of a closed
// boundary polygon, by Green's theorem. Degenerate contours (points and
// lines, which enclose no area) yield None.
fn contour_moments(points: &[Point<i32>]) -> Option<(f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    let mut twice_area = 0.0;
    let mut cx_sum = 0.0;
    let mut cy_sum = 0.0;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        let cross = (p.x as f64) * (q.y as f64) - (q.x as f64) * (p.y as f64);
        twice_area += cross;
        cx_sum += (p.x + q.x) as f64 * cross;
        cy_sum += (p.y + q.y) as f64 * cross;
    }
    if twice_area == 0.0 {
        return None;
    }
    let area = (twice_area / 2.0).abs();
    let cx = cx_sum / (3.0 * twice_area);
    let cy = cy_sum / (3.0 * twice_area);
    Some((area, cx, cy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn blob(img: &mut GrayImage, left: u32, top: u32, size: u32, value: u8) {
        for y in top..top + size {
            for x in left..left + size {
                img.put_pixel(x, y, image::Luma([value]));
            }
        }
    }

    #[test]
    fn test_contour_moments_of_square() {
        // Boundary of a 3x3 pixel block: a 2x2 square in coordinate space.
        let points = vec![
            Point::new(10, 20),
            Point::new(12, 20),
            Point::new(12, 22),
            Point::new(10, 22),
        ];
        let (area, cx, cy) = contour_moments(&points).unwrap();
        assert_abs_diff_eq!(area, 4.0);
        assert_abs_diff_eq!(cx, 11.0);
        assert_abs_diff_eq!(cy, 21.0);
    }

    #[test]
    fn test_contour_moments_degenerate() {
        assert!(contour_moments(&[Point::new(5, 5)]).is_none());
        assert!(
            contour_moments(&[Point::new(5, 5), Point::new(6, 5), Point::new(7, 5)]).is_none()
        );
    }

    #[test]
    fn test_extract_stars_finds_blobs_brightest_first() {
        let mut img = GrayImage::new(64, 48);
        blob(&mut img, 10, 20, 3, 120); // centred at (11, 21)
        blob(&mut img, 40, 8, 3, 240); // centred at (41, 9)

        let stars = extract_stars(&img, 100.0);
        assert_eq!(stars.len(), 2);
        // Brightest first.
        assert_abs_diff_eq!(stars[0].flux, 240.0);
        assert_abs_diff_eq!(stars[0].x, 41.0 - 32.0, epsilon = 0.01);
        assert_abs_diff_eq!(stars[0].y, 9.0 - 24.0, epsilon = 0.01);
        assert_abs_diff_eq!(stars[1].flux, 120.0);
        assert_abs_diff_eq!(stars[1].x, 11.0 - 32.0, epsilon = 0.01);
        assert_abs_diff_eq!(stars[1].y, 21.0 - 24.0, epsilon = 0.01);
    }

    #[test]
    fn test_extract_stars_ignores_background() {
        let img = GrayImage::from_pixel(32, 32, image::Luma([10u8]));
        assert!(extract_stars(&img, 100.0).is_empty());
    }

    // Catalogue double that records what it was asked and answers with a
    // configurable match.
    struct FakeCatalog {
        required: usize,
        max_false: usize,
        sky_probability: f64,
        near_probability: f64,
        sky_calls: AtomicUsize,
        near_calls: AtomicUsize,
    }

    impl FakeCatalog {
        fn new(sky_probability: f64, near_probability: f64) -> Self {
            FakeCatalog {
                required: 2,
                max_false: 1,
                sky_probability,
                near_probability,
                sky_calls: AtomicUsize::new(0),
                near_calls: AtomicUsize::new(0),
            }
        }
    }

    impl StarCatalog for FakeCatalog {
        fn calibration_size(&self) -> (u32, u32) {
            (64, 48)
        }
        fn detection_threshold(&self) -> f64 {
            100.0
        }
        fn required_stars(&self) -> usize {
            self.required
        }
        fn max_false_stars(&self) -> usize {
            self.max_false
        }
        fn match_sky(&self, stars: &[ImageStar]) -> Result<ConstellationMatch, CanonicalError> {
            self.sky_calls.fetch_add(1, Ordering::Relaxed);
            assert!(stars.len() <= self.required + self.max_false);
            Ok(ConstellationMatch {
                probability: self.sky_probability,
                star_count: stars.len(),
                orientation: (20.5, 10.5, 30.5),
            })
        }
        fn match_near(
            &self,
            coarse: &ConstellationMatch,
            _stars: &[ImageStar],
        ) -> Result<ConstellationMatch, CanonicalError> {
            self.near_calls.fetch_add(1, Ordering::Relaxed);
            Ok(ConstellationMatch {
                probability: self.near_probability,
                ..coarse.clone()
            })
        }
    }

    fn starry_frame() -> Frame {
        let mut img = GrayImage::new(64, 48);
        blob(&mut img, 10, 20, 3, 200);
        blob(&mut img, 40, 8, 3, 240);
        blob(&mut img, 30, 30, 3, 150);
        blob(&mut img, 5, 5, 3, 130);
        Frame::Gray(img)
    }

    #[test]
    fn test_solve_success() {
        let solver = Solver::new(Box::new(FakeCatalog::new(1.0, 1.0)), None);
        let (dec, ra, roll) = solver.solve(&starry_frame()).unwrap();
        assert_abs_diff_eq!(dec, 20.5);
        assert_abs_diff_eq!(ra, 10.5);
        assert_abs_diff_eq!(roll, 30.5);
    }

    #[test]
    fn test_solve_rejects_weak_sky_match() {
        let catalog = Box::new(FakeCatalog::new(0.5, 1.0));
        let solver = Solver::new(catalog, None);
        assert!(solver.solve(&starry_frame()).is_err());
    }

    #[test]
    fn test_solve_rejects_weak_refined_match() {
        let catalog = Box::new(FakeCatalog::new(1.0, 0.5));
        let solver = Solver::new(catalog, None);
        assert!(solver.solve(&starry_frame()).is_err());
    }

    #[test]
    fn test_solve_requires_enough_matched_stars() {
        // High probability but too few stars in the winning constellation.
        let mut catalog = FakeCatalog::new(1.0, 1.0);
        catalog.required = 5;
        catalog.max_false = 0;
        // Only 4 blobs in the frame; star_count echoes what was offered.
        let solver = Solver::new(Box::new(catalog), None);
        assert!(solver.solve(&starry_frame()).is_err());
    }

    #[test]
    fn test_median_dark_subtraction() {
        // A dark frame equal to the image cancels every star.
        let frame = starry_frame();
        let dark = frame.to_rgb();
        let solver = Solver::new(Box::new(FakeCatalog::new(1.0, 1.0)), Some(dark));
        let gray = solver.preprocess(&frame);
        assert!(gray.as_raw().iter().all(|&v| v == 0));
    }
}  // mod tests.
