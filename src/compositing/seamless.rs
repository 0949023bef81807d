use crate::geometry::{fit_scale, scaled_size};
use image::{imageops, RgbImage};

/// Largest share of the target either side of the scaled source may take
pub const SOURCE_FRACTION: f64 = 0.3;

const MAX_SWEEPS: usize = 5000;
const TOLERANCE: f32 = 0.01;

/// How the guidance field of the Poisson blend is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// Source gradients everywhere
    #[default]
    Normal,
    /// Per edge, whichever of the source and target gradients is stronger
    Mixed,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BlendError {
    #[error("source patch {width}x{height} is too small to blend")]
    TooSmall { width: u32, height: u32 },

    #[error("patch at ({x}, {y}) of size {width}x{height} does not fit inside the target")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },

    #[error("Poisson solve produced non-finite values")]
    NonFinite,
}

/// Resize `source` so its larger relative side is 30% of `target`
pub fn scale_source(source: &RgbImage, target: &RgbImage) -> RgbImage {
    let scale = SOURCE_FRACTION * fit_scale(source.dimensions(), target.dimensions());
    let (w, h) = scaled_size(source.dimensions(), scale);
    if w == 0 || h == 0 {
        return RgbImage::new(w, h);
    }
    imageops::resize(source, w, h, imageops::FilterType::Triangle)
}

/// Gradient-domain paste of all of `source`, centered at `center` in
/// `target`. The outer ring of the patch keeps target values.
pub fn seamless_clone(
    source: &RgbImage,
    target: &RgbImage,
    center: (i32, i32),
    mode: BlendMode,
) -> Result<RgbImage, BlendError> {
    let _span = tracing::debug_span!("seamless_clone").entered();

    let (w, h) = source.dimensions();
    if w < 3 || h < 3 {
        return Err(BlendError::TooSmall { width: w, height: h });
    }
    let x0 = center.0 as i64 - (w / 2) as i64;
    let y0 = center.1 as i64 - (h / 2) as i64;
    let (tw, th) = target.dimensions();
    if x0 < 0 || y0 < 0 || x0 + w as i64 > tw as i64 || y0 + h as i64 > th as i64 {
        return Err(BlendError::OutOfBounds {
            x: x0,
            y: y0,
            width: w,
            height: h,
        });
    }
    let (x0, y0) = (x0 as u32, y0 as u32);

    let mut result = target.clone();
    let omega = 2.0 / (1.0 + (std::f32::consts::PI / w.max(h) as f32).sin());

    for channel in 0..3 {
        let src = |x: u32, y: u32| source.get_pixel(x, y)[channel] as f32;
        let dst = |x: u32, y: u32| target.get_pixel(x0 + x, y0 + y)[channel] as f32;

        let (wu, hu) = (w as usize, h as usize);
        let mut field: Vec<f32> = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| dst(x, y))
            .collect();

        // Divergence of the guidance field at each interior pixel
        let mut guidance = vec![0f32; wu * hu];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let mut sum = 0.0;
                for (nx, ny) in [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)] {
                    let s = src(x, y) - src(nx, ny);
                    sum += match mode {
                        BlendMode::Normal => s,
                        BlendMode::Mixed => {
                            let t = dst(x, y) - dst(nx, ny);
                            if t.abs() > s.abs() {
                                t
                            } else {
                                s
                            }
                        }
                    };
                }
                guidance[y as usize * wu + x as usize] = sum;
            }
        }

        let mut converged = false;
        for _ in 0..MAX_SWEEPS {
            let mut largest = 0f32;
            for y in 1..hu - 1 {
                for x in 1..wu - 1 {
                    let i = y * wu + x;
                    let neighbours = field[i - 1] + field[i + 1] + field[i - wu] + field[i + wu];
                    let gauss_seidel = (neighbours + guidance[i]) / 4.0;
                    let update = omega * (gauss_seidel - field[i]);
                    field[i] += update;
                    largest = largest.max(update.abs());
                }
            }
            if !largest.is_finite() {
                return Err(BlendError::NonFinite);
            }
            if largest < TOLERANCE {
                converged = true;
                break;
            }
        }
        if !converged {
            tracing::debug!("Poisson solve hit the sweep limit on channel {}", channel);
        }

        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let v = field[y as usize * wu + x as usize];
                if !v.is_finite() {
                    return Err(BlendError::NonFinite);
                }
                result.get_pixel_mut(x0 + x, y0 + y)[channel] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    Ok(result)
}

/// Seamless cloning with a source, a target and a click position
#[derive(Debug, Clone, Default)]
pub struct SeamlessCloneSession {
    source: Option<RgbImage>,
    target: Option<RgbImage>,
    center: Option<(i32, i32)>,
    mode: BlendMode,
}

impl SeamlessCloneSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_source(&mut self, image: RgbImage) {
        self.source = Some(image);
    }

    pub fn set_target(&mut self, image: RgbImage) {
        self.target = Some(image);
    }

    /// Patch center in target pixel coordinates
    pub fn set_center(&mut self, x: i32, y: i32) {
        self.center = Some((x, y));
    }

    pub fn set_mode(&mut self, mode: BlendMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    /// Blend the scaled source into the target, or `None` when an input
    /// is missing or the blend fails
    pub fn apply(&self) -> Option<RgbImage> {
        let source = self.source.as_ref()?;
        let target = self.target.as_ref()?;
        let center = self.center?;

        let scaled = scale_source(source, target);
        match seamless_clone(&scaled, target, center, self.mode) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!("Seamless clone failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn stripes(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| {
            if (x / 4) % 2 == 0 {
                Rgb([20, 20, 20])
            } else {
                Rgb([220, 220, 220])
            }
        })
    }

    fn assert_close(a: &RgbImage, b: &RgbImage) {
        for (p, q) in a.pixels().zip(b.pixels()) {
            for c in 0..3 {
                assert!((p[c] as i32 - q[c] as i32).abs() <= 1, "{:?} vs {:?}", p, q);
            }
        }
    }

    #[test]
    fn test_constant_source_keeps_harmonic_target() {
        let target = RgbImage::from_fn(40, 30, |x, y| Rgb([(2 * x + y) as u8, 100, (x + 3 * y) as u8]));
        let source = RgbImage::from_pixel(15, 11, Rgb([250, 0, 250]));
        let out = seamless_clone(&source, &target, (20, 15), BlendMode::Normal).unwrap();
        assert_close(&out, &target);
    }

    #[test]
    fn test_source_texture_is_transferred() {
        let target = RgbImage::from_pixel(40, 40, Rgb([100, 100, 100]));
        let source = stripes(21, 21);
        let out = seamless_clone(&source, &target, (20, 20), BlendMode::Normal).unwrap();

        // Across a stripe edge in the middle of the patch the jump is kept
        let left = out.get_pixel(21, 20)[0] as i32;
        let right = out.get_pixel(22, 20)[0] as i32;
        assert!((right - left - 200).abs() <= 30, "jump {}", right - left);
        // Outside the patch the target is untouched
        assert_eq!(*out.get_pixel(2, 2), Rgb([100, 100, 100]));
    }

    #[test]
    fn test_mixed_keeps_stronger_target_gradients() {
        let target = stripes(40, 40);
        let source = RgbImage::from_pixel(21, 21, Rgb([90, 90, 90]));

        let mixed = seamless_clone(&source, &target, (20, 20), BlendMode::Mixed).unwrap();
        assert_close(&mixed, &target);

        let normal = seamless_clone(&source, &target, (20, 20), BlendMode::Normal).unwrap();
        assert_ne!(normal, target);
    }

    #[test]
    fn test_patch_outside_target_fails() {
        let target = RgbImage::new(40, 40);
        let source = RgbImage::new(10, 10);
        assert!(matches!(
            seamless_clone(&source, &target, (2, 20), BlendMode::Normal),
            Err(BlendError::OutOfBounds { .. })
        ));
        assert!(seamless_clone(&source, &target, (37, 37), BlendMode::Normal).is_err());
    }

    #[test]
    fn test_source_scaled_to_thirty_percent() {
        let source = RgbImage::new(100, 50);
        let target = RgbImage::new(205, 400);
        assert_eq!(scale_source(&source, &target).dimensions(), (61, 30));
    }

    #[test]
    fn test_session_needs_all_inputs() {
        let mut session = SeamlessCloneSession::new();
        session.set_source(RgbImage::from_pixel(50, 50, Rgb([200, 10, 10])));
        session.set_target(RgbImage::from_pixel(100, 100, Rgb([10, 10, 200])));
        assert!(session.apply().is_none());

        session.set_center(50, 50);
        assert!(session.apply().is_some());

        // A patch hanging off the edge gives no result
        session.set_center(2, 2);
        assert!(session.apply().is_none());
    }
}
