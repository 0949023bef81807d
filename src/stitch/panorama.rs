use super::homography::{find_homography_ransac, GeometryError, Homography, RansacConfig};
use crate::features::{detect_and_compute, match_descriptors, OrbConfig, RATIO_THRESHOLD};
use crate::geometry::Point2;
use image::{imageops, DynamicImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// Fewest ratio-test survivors a homography is fitted to
pub const MIN_MATCHES: usize = 4;

/// Result of a two-image stitch
#[derive(Debug, Clone)]
pub enum StitchOutcome {
    /// Wide composite of both inputs
    Stitched(RgbImage),
    /// Too few reliable matches; carries the unchanged left image
    InsufficientMatches { image: RgbImage, matches: usize },
    /// Geometry could not be estimated; carries the unchanged left image
    Failed { image: RgbImage, reason: String },
}

impl StitchOutcome {
    pub fn is_stitched(&self) -> bool {
        matches!(self, StitchOutcome::Stitched(_))
    }

    /// The composite, or the left image on a degraded outcome
    pub fn into_image(self) -> RgbImage {
        match self {
            StitchOutcome::Stitched(image) => image,
            StitchOutcome::InsufficientMatches { image, .. } => image,
            StitchOutcome::Failed { image, .. } => image,
        }
    }
}

/// Two-image panorama builder
#[derive(Debug, Clone, Default)]
pub struct Stitcher {
    pub features: OrbConfig,
    pub ransac: RansacConfig,
}

impl Stitcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stitch `right` onto the plane of `left`.
    ///
    /// Never fails hard: degraded outcomes carry a copy of `left`.
    pub fn stitch(&self, left: &RgbImage, right: &RgbImage) -> StitchOutcome {
        let _span = tracing::debug_span!("stitch").entered();

        let gray_left = DynamicImage::ImageRgb8(left.clone()).to_luma8();
        let gray_right = DynamicImage::ImageRgb8(right.clone()).to_luma8();

        let (kps_left, desc_left) = detect_and_compute(&gray_left, &self.features);
        let (kps_right, desc_right) = detect_and_compute(&gray_right, &self.features);
        tracing::debug!(
            "Keypoints: left={}, right={}",
            kps_left.len(),
            kps_right.len()
        );

        if kps_left.len() < 2 || kps_right.len() < 2 {
            tracing::warn!("Too few keypoints to stitch");
            return StitchOutcome::InsufficientMatches {
                image: left.clone(),
                matches: 0,
            };
        }

        // Right descriptors query the left set
        let matches = match_descriptors(&desc_right, &desc_left, RATIO_THRESHOLD);
        if matches.len() < MIN_MATCHES {
            tracing::warn!("Only {} good matches, returning left image", matches.len());
            return StitchOutcome::InsufficientMatches {
                image: left.clone(),
                matches: matches.len(),
            };
        }

        let pts_right: Vec<Point2> = matches
            .iter()
            .map(|m| Point2::new(kps_right[m.query_idx].x, kps_right[m.query_idx].y))
            .collect();
        let pts_left: Vec<Point2> = matches
            .iter()
            .map(|m| Point2::new(kps_left[m.train_idx].x, kps_left[m.train_idx].y))
            .collect();

        let homography = match find_homography_ransac(&pts_right, &pts_left, &self.ransac) {
            Ok((h, _)) => h,
            Err(e) => return failed(left, e),
        };

        match compose_panorama(left, right, &homography) {
            Ok(panorama) => {
                tracing::info!(
                    "Stitched {}x{} panorama from {} matches",
                    panorama.width(),
                    panorama.height(),
                    matches.len()
                );
                StitchOutcome::Stitched(panorama)
            }
            Err(e) => failed(left, e),
        }
    }
}

fn failed(left: &RgbImage, error: GeometryError) -> StitchOutcome {
    tracing::warn!("Stitch failed: {}", error);
    StitchOutcome::Failed {
        image: left.clone(),
        reason: error.to_string(),
    }
}

/// Warp `right` by `homography` (right plane to left plane) onto a canvas of
/// `(wl + wr) x max(hl, hr)` and paste `left` over it at the origin.
///
/// The left image wins everywhere it covers; there is no blending.
pub fn compose_panorama(
    left: &RgbImage,
    right: &RgbImage,
    homography: &Homography,
) -> Result<RgbImage, GeometryError> {
    let (wl, hl) = left.dimensions();
    let (wr, hr) = right.dimensions();

    // Reject singular transforms before handing them to the warper
    homography.inverse()?;
    let projection =
        Projection::from_matrix(homography.to_row_major_f32()).ok_or(GeometryError::Singular)?;

    let mut canvas = RgbImage::new(wl + wr, hl.max(hr));
    warp_into(
        right,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut canvas,
    );
    imageops::replace(&mut canvas, left, 0, 0);
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn mix(mut v: u32) -> u32 {
        v ^= v >> 16;
        v = v.wrapping_mul(0x7feb_352d);
        v ^= v >> 15;
        v = v.wrapping_mul(0x846c_a68b);
        v ^ (v >> 16)
    }

    /// 16px blocks of pseudo-random color
    fn scene(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let h = mix((x / 16) * 7919 + (y / 16) * 104_729 + 17);
            Rgb([(h & 0xff) as u8, ((h >> 8) & 0xff) as u8, ((h >> 16) & 0xff) as u8])
        })
    }

    #[test]
    fn test_compose_canvas_size_and_left_precedence() {
        let left = RgbImage::from_fn(100, 80, |x, y| Rgb([x as u8, y as u8, 200]));
        let right = RgbImage::from_fn(60, 90, |x, y| Rgb([50, x as u8, y as u8]));
        let h = Homography::translation(80.0, 0.0);

        let pano = compose_panorama(&left, &right, &h).unwrap();
        assert_eq!(pano.dimensions(), (160, 90));

        for y in 0..80 {
            for x in 0..100 {
                assert_eq!(pano.get_pixel(x, y), left.get_pixel(x, y));
            }
        }

        // Below the left image the warped right image shows through
        let p = pano.get_pixel(120, 85);
        let expected = right.get_pixel(40, 85);
        for c in 0..3 {
            assert!((p[c] as i32 - expected[c] as i32).abs() <= 1);
        }
        // Outside both images the canvas stays black
        assert_eq!(*pano.get_pixel(150, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_singular_homography_is_rejected() {
        let left = RgbImage::new(10, 10);
        let right = RgbImage::new(10, 10);
        let h = Homography {
            matrix: nalgebra::Matrix3::zeros(),
        };
        assert!(compose_panorama(&left, &right, &h).is_err());
    }

    #[test]
    fn test_flat_images_degrade_to_left() {
        let left = RgbImage::from_pixel(120, 100, Rgb([10, 20, 30]));
        let right = RgbImage::from_pixel(90, 100, Rgb([40, 50, 60]));
        let outcome = Stitcher::new().stitch(&left, &right);
        assert!(matches!(
            outcome,
            StitchOutcome::InsufficientMatches { matches: 0, .. }
        ));
        assert_eq!(outcome.into_image(), left);
    }

    #[test]
    fn test_overlapping_crops_stitch() {
        let full = scene(320, 200);
        let left = full.view(0, 0, 200, 200).to_image();
        let right = full.view(120, 0, 200, 200).to_image();

        let outcome = Stitcher::new().stitch(&left, &right);
        assert!(outcome.is_stitched());
        let pano = outcome.into_image();
        assert_eq!(pano.dimensions(), (400, 200));

        for y in 0..200 {
            for x in 0..200 {
                assert_eq!(pano.get_pixel(x, y), left.get_pixel(x, y));
            }
        }
        // Block centers right of the overlap come from the warped right image
        for (x, y) in [(248, 104), (296, 40), (232, 184)] {
            let got = pano.get_pixel(x, y);
            let want = full.get_pixel(x, y);
            for c in 0..3 {
                assert!((got[c] as i32 - want[c] as i32).abs() <= 1, "pixel ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_rotated_perspective_view_stitches() {
        let full = scene(360, 220);
        let left = full.view(0, 0, 240, 220).to_image();

        // Shift left by 130px, turn 5 degrees about (110, 110), then tilt
        // the image plane slightly
        let (sin, cos) = 5f64.to_radians().sin_cos();
        let (cx, cy, tx) = (110.0, 110.0, -130.0);
        let view = nalgebra::Matrix3::new(
            cos,
            -sin,
            cos * (tx - cx) + sin * cy + cx,
            sin,
            cos,
            sin * (tx - cx) - cos * cy + cy,
            1e-5,
            0.0,
            1.0,
        );
        let view = Homography::from_matrix(view).unwrap();
        let projection = Projection::from_matrix(view.to_row_major_f32()).unwrap();
        let mut right = RgbImage::new(220, 220);
        warp_into(&full, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut right);

        let outcome = Stitcher::new().stitch(&left, &right);
        assert!(outcome.is_stitched());
        let pano = outcome.into_image();
        assert_eq!(pano.dimensions(), (460, 220));

        for (x, y) in [(0, 0), (120, 100), (239, 219)] {
            assert_eq!(pano.get_pixel(x, y), left.get_pixel(x, y));
        }
        // Block centers past the left edge come back to their scene position
        for (x, y) in [(264, 104), (312, 56), (296, 152), (280, 184)] {
            let got = pano.get_pixel(x, y);
            let want = full.get_pixel(x, y);
            for c in 0..3 {
                assert!((got[c] as i32 - want[c] as i32).abs() <= 1, "pixel ({}, {})", x, y);
            }
        }
    }
}
