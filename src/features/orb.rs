use super::{Descriptor, Keypoint};
use image::{imageops, GrayImage};
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Radius of the patch used for the intensity-centroid orientation
const PATCH_RADIUS: i32 = 15;

/// Largest offset of a test pair before rotation
const PATTERN_EXTENT: i32 = 13;

/// Keypoints closer than this to a level border are discarded so that both
/// the orientation patch and every rotated test pair stay inside the image
const EDGE_THRESHOLD: u32 = 20;

const PATTERN_SEED: u64 = 0x0b5e_55ed;

/// Detector/descriptor configuration
#[derive(Debug, Clone)]
pub struct OrbConfig {
    /// Upper bound on keypoints over all pyramid levels
    pub max_features: usize,
    /// Number of pyramid levels
    pub levels: u32,
    /// Downscale factor between consecutive levels
    pub scale_factor: f32,
    /// FAST intensity threshold
    pub fast_threshold: u8,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            max_features: 1000,
            levels: 8,
            scale_factor: 1.2,
            fast_threshold: 20,
        }
    }
}

/// Detect oriented FAST keypoints on a scale pyramid and compute rotated
/// BRIEF descriptors for them.
///
/// The two returned vectors are index-aligned.
pub fn detect_and_compute(gray: &GrayImage, config: &OrbConfig) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let _span = tracing::debug_span!("orb_detect").entered();

    let pattern = sampling_pattern();
    let levels = build_pyramid(gray, config);
    let total_area: f32 = levels.iter().map(|(img, _)| (img.width() * img.height()) as f32).sum();

    let mut keypoints = Vec::new();
    let mut descriptors = Vec::new();

    for (octave, (level, scale)) in levels.iter().enumerate() {
        let (w, h) = level.dimensions();
        if w <= 2 * EDGE_THRESHOLD || h <= 2 * EDGE_THRESHOLD || total_area == 0.0 {
            break;
        }

        // Share of the feature budget proportional to the level area
        let budget = ((config.max_features as f32) * (w * h) as f32 / total_area).ceil() as usize;
        let corners = strongest_corners(level, config.fast_threshold, budget);
        let smoothed = gaussian_blur_f32(level, 2.0);

        for (x, y, response) in corners {
            let angle = intensity_centroid_angle(level, x as i32, y as i32);
            let descriptor = rotated_brief(&smoothed, x as i32, y as i32, angle, &pattern);
            keypoints.push(Keypoint {
                x: x as f32 / scale,
                y: y as f32 / scale,
                octave: octave as u32,
                scale: *scale,
                angle,
                response,
            });
            descriptors.push(descriptor);
        }
    }

    tracing::debug!("Detected {} keypoints", keypoints.len());
    (keypoints, descriptors)
}

/// Pyramid of (image, scale relative to input)
fn build_pyramid(gray: &GrayImage, config: &OrbConfig) -> Vec<(GrayImage, f32)> {
    let mut levels = vec![(gray.clone(), 1.0f32)];
    let mut scale = 1.0f32;
    for _ in 1..config.levels.max(1) {
        scale /= config.scale_factor;
        let w = (gray.width() as f32 * scale).round() as u32;
        let h = (gray.height() as f32 * scale).round() as u32;
        if w <= 2 * EDGE_THRESHOLD || h <= 2 * EDGE_THRESHOLD {
            break;
        }
        levels.push((imageops::resize(gray, w, h, imageops::FilterType::Triangle), scale));
    }
    levels
}

/// FAST corners after 3x3 non-maximum suppression, strongest first
fn strongest_corners(level: &GrayImage, threshold: u8, budget: usize) -> Vec<(u32, u32, f32)> {
    let (w, h) = level.dimensions();
    let corners = corners_fast9(level, threshold);

    let mut score_map = vec![0f32; (w * h) as usize];
    for c in &corners {
        score_map[(c.y * w + c.x) as usize] = c.score;
    }

    let mut kept: Vec<(u32, u32, f32)> = corners
        .iter()
        .filter(|c| {
            c.x >= EDGE_THRESHOLD
                && c.y >= EDGE_THRESHOLD
                && c.x < w - EDGE_THRESHOLD
                && c.y < h - EDGE_THRESHOLD
        })
        .filter(|c| {
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (c.x as i32 + dx) as u32;
                    let ny = (c.y as i32 + dy) as u32;
                    if score_map[(ny * w + nx) as usize] > c.score {
                        return false;
                    }
                }
            }
            true
        })
        .map(|c| (c.x, c.y, c.score))
        .collect();

    kept.sort_by(|a, b| b.2.total_cmp(&a.2));
    kept.truncate(budget);
    kept
}

/// Orientation from the intensity centroid of a circular patch
fn intensity_centroid_angle(img: &GrayImage, cx: i32, cy: i32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    let r2 = PATCH_RADIUS * PATCH_RADIUS;
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = img.get_pixel((cx + dx) as u32, (cy + dy) as u32)[0] as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

fn rotated_brief(
    smoothed: &GrayImage,
    cx: i32,
    cy: i32,
    angle: f32,
    pattern: &[(i32, i32, i32, i32); 256],
) -> Descriptor {
    let (s, c) = angle.sin_cos();
    let sample = |dx: i32, dy: i32| {
        let rx = (c * dx as f32 - s * dy as f32).round() as i32;
        let ry = (s * dx as f32 + c * dy as f32).round() as i32;
        smoothed.get_pixel((cx + rx) as u32, (cy + ry) as u32)[0]
    };

    let mut d = [0u8; 32];
    for (i, &(x1, y1, x2, y2)) in pattern.iter().enumerate() {
        let bit = (sample(x1, y1) < sample(x2, y2)) as u8;
        d[i / 8] |= bit << (i % 8);
    }
    d
}

/// Fixed pseudo-random test pairs; identical on every run
fn sampling_pattern() -> [(i32, i32, i32, i32); 256] {
    let mut rng = ChaCha8Rng::seed_from_u64(PATTERN_SEED);
    let mut pattern = [(0, 0, 0, 0); 256];
    for pair in pattern.iter_mut() {
        *pair = (
            rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
            rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
            rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
            rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
        );
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{hamming_distance, match_descriptors, RATIO_THRESHOLD};
    use image::Luma;

    /// Scattered bright blocks on a dark background
    fn blocks(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let (bx, by) = (x / 16, y / 16);
            let hash = bx.wrapping_mul(73_856_093) ^ by.wrapping_mul(19_349_663);
            if hash % 3 == 0 {
                Luma([220])
            } else {
                Luma([30])
            }
        })
    }

    #[test]
    fn test_flat_image_has_no_keypoints() {
        let flat = GrayImage::from_pixel(128, 128, Luma([90]));
        let (kps, desc) = detect_and_compute(&flat, &OrbConfig::default());
        assert!(kps.is_empty());
        assert!(desc.is_empty());
    }

    #[test]
    fn test_keypoints_stay_inside_border() {
        let img = blocks(200, 160);
        let (kps, desc) = detect_and_compute(&img, &OrbConfig::default());
        assert!(!kps.is_empty());
        assert_eq!(kps.len(), desc.len());
        for kp in &kps {
            assert!(kp.x >= 0.0 && kp.x < 200.0);
            assert!(kp.y >= 0.0 && kp.y < 160.0);
        }
    }

    #[test]
    fn test_pattern_is_deterministic() {
        assert_eq!(sampling_pattern(), sampling_pattern());
    }

    #[test]
    fn test_identical_images_give_identical_descriptors() {
        let a = blocks(240, 160);
        let b = blocks(240, 160);
        let config = OrbConfig::default();
        let (_, da) = detect_and_compute(&a, &config);
        let (_, db) = detect_and_compute(&b, &config);
        assert_eq!(da.len(), db.len());
        for (x, y) in da.iter().zip(db.iter()) {
            assert_eq!(hamming_distance(x, y), 0);
        }
        // Identical inputs also produce identical descriptor sets, so every
        // unique descriptor has an exact partner
        let matches = match_descriptors(&db, &da, RATIO_THRESHOLD);
        assert!(matches.iter().all(|m| m.distance == 0));
    }
}
