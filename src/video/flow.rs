//! Corner seeding and sparse pyramidal Lucas-Kanade optical flow.

use crate::geometry::Point2;
use image::{imageops, GrayImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// Shi-Tomasi seeding parameters
#[derive(Debug, Clone)]
pub struct SeedConfig {
    pub max_corners: usize,
    /// Fraction of the strongest minimum eigenvalue a corner must reach
    pub quality_level: f32,
    /// Minimum Euclidean distance between returned corners
    pub min_distance: f32,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            max_corners: 200,
            quality_level: 0.01,
            min_distance: 10.0,
        }
    }
}

/// Pyramidal Lucas-Kanade parameters
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Side of the square integration window
    pub window: u32,
    /// Number of pyramid levels including full resolution
    pub levels: u32,
    pub max_iterations: u32,
    /// Stop iterating once the update is shorter than this
    pub epsilon: f32,
    /// Minimum eigenvalue of the window's gradient matrix, normalized by
    /// the window area; weaker windows are reported as lost
    pub min_eigen: f32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window: 21,
            levels: 3,
            max_iterations: 10,
            epsilon: 0.03,
            min_eigen: 1e-4,
        }
    }
}

/// Strong corners by the minimum eigenvalue of the 3x3 structure tensor,
/// strongest first.
pub fn good_features_to_track(gray: &GrayImage, config: &SeedConfig) -> Vec<Point2> {
    let _span = tracing::debug_span!("good_features").entered();

    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 || config.max_corners == 0 {
        return Vec::new();
    }

    let gx = horizontal_sobel(gray);
    let gy = vertical_sobel(gray);

    let (wu, hu) = (w as usize, h as usize);
    let mut xx = vec![0f32; wu * hu];
    let mut xy = vec![0f32; wu * hu];
    let mut yy = vec![0f32; wu * hu];
    for y in 0..h {
        for x in 0..w {
            let dx = gx.get_pixel(x, y)[0] as f32;
            let dy = gy.get_pixel(x, y)[0] as f32;
            let i = y as usize * wu + x as usize;
            xx[i] = dx * dx;
            xy[i] = dx * dy;
            yy[i] = dy * dy;
        }
    }

    let mut eigen = vec![0f32; wu * hu];
    let mut strongest = 0f32;
    for y in 1..hu - 1 {
        for x in 1..wu - 1 {
            let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    let i = ny * wu + nx;
                    a += xx[i];
                    b += xy[i];
                    c += yy[i];
                }
            }
            let half_trace = (a + c) / 2.0;
            let root = (((a - c) / 2.0).powi(2) + b * b).sqrt();
            let lambda = half_trace - root;
            eigen[y * wu + x] = lambda;
            strongest = strongest.max(lambda);
        }
    }

    if strongest <= 0.0 {
        return Vec::new();
    }
    let threshold = strongest * config.quality_level;

    let mut candidates = Vec::new();
    for y in 1..hu - 1 {
        for x in 1..wu - 1 {
            let v = eigen[y * wu + x];
            if v <= threshold {
                continue;
            }
            let is_peak = (y - 1..=y + 1)
                .all(|ny| (x - 1..=x + 1).all(|nx| eigen[ny * wu + nx] <= v));
            if is_peak {
                candidates.push((x as f32, y as f32, v));
            }
        }
    }
    candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

    let min_d2 = config.min_distance * config.min_distance;
    let mut corners: Vec<Point2> = Vec::new();
    for (x, y, _) in candidates {
        let far_enough = corners.iter().all(|c| {
            let (dx, dy) = (c.x - x, c.y - y);
            dx * dx + dy * dy >= min_d2
        });
        if far_enough {
            corners.push(Point2::new(x, y));
            if corners.len() == config.max_corners {
                break;
            }
        }
    }

    tracing::debug!("Seeded {} corners", corners.len());
    corners
}

/// Single-channel float image with clamped bilinear sampling
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.pixels().map(|p| p[0] as f32).collect(),
        }
    }

    fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    fn sample(&self, x: f32, y: f32) -> f32 {
        let (x0, y0) = (x.floor(), y.floor());
        let (fx, fy) = (x - x0, y - y0);
        let (ix, iy) = (x0 as isize, y0 as isize);
        let top = self.at(ix, iy) * (1.0 - fx) + self.at(ix + 1, iy) * fx;
        let bottom = self.at(ix, iy + 1) * (1.0 - fx) + self.at(ix + 1, iy + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

fn pyramid(gray: &GrayImage, levels: u32) -> Vec<Plane> {
    let mut planes = vec![Plane::from_gray(gray)];
    let mut current = gray.clone();
    for _ in 1..levels.max(1) {
        let (w, h) = (current.width() / 2, current.height() / 2);
        if w < 8 || h < 8 {
            break;
        }
        current = imageops::resize(&current, w, h, imageops::FilterType::Triangle);
        planes.push(Plane::from_gray(&current));
    }
    planes
}

/// Track `points` from `prev` into `next`.
///
/// The result is index-aligned with `points`; `None` marks a lost point.
pub fn calc_optical_flow_pyr_lk(
    prev: &GrayImage,
    next: &GrayImage,
    points: &[Point2],
    config: &FlowConfig,
) -> Vec<Option<Point2>> {
    let _span = tracing::debug_span!("optical_flow").entered();

    if prev.dimensions() != next.dimensions() || points.is_empty() {
        return vec![None; points.len()];
    }

    let prev_pyr = pyramid(prev, config.levels);
    let next_pyr = pyramid(next, config.levels);
    let levels = prev_pyr.len().min(next_pyr.len());

    points
        .iter()
        .map(|p| track_point(&prev_pyr[..levels], &next_pyr[..levels], *p, config))
        .collect()
}

fn track_point(prev: &[Plane], next: &[Plane], point: Point2, config: &FlowConfig) -> Option<Point2> {
    let half = (config.window / 2) as i32;
    let area = ((2 * half + 1) * (2 * half + 1)) as f32;
    let mut guess = (0f32, 0f32);

    for level in (0..prev.len()).rev() {
        let scale = 1.0 / (1u32 << level) as f32;
        let (px, py) = (point.x * scale, point.y * scale);
        let (i_prev, i_next) = (&prev[level], &next[level]);

        // Template and gradients around the point in the previous frame
        let mut samples = Vec::with_capacity(area as usize);
        let (mut gxx, mut gxy, mut gyy) = (0f32, 0f32, 0f32);
        for dy in -half..=half {
            for dx in -half..=half {
                let (x, y) = (px + dx as f32, py + dy as f32);
                let ix = (i_prev.sample(x + 1.0, y) - i_prev.sample(x - 1.0, y)) / 2.0;
                let iy = (i_prev.sample(x, y + 1.0) - i_prev.sample(x, y - 1.0)) / 2.0;
                gxx += ix * ix;
                gxy += ix * iy;
                gyy += iy * iy;
                samples.push((dx as f32, dy as f32, i_prev.sample(x, y), ix, iy));
            }
        }

        let det = gxx * gyy - gxy * gxy;
        let min_eig = ((gxx + gyy) - ((gxx - gyy).powi(2) + 4.0 * gxy * gxy).sqrt()) / 2.0;
        if min_eig / area < config.min_eigen || det.abs() < f32::EPSILON {
            return None;
        }

        let mut v = (0f32, 0f32);
        for _ in 0..config.max_iterations {
            let (mut bx, mut by) = (0f32, 0f32);
            for &(dx, dy, t, ix, iy) in &samples {
                let j = i_next.sample(px + guess.0 + v.0 + dx, py + guess.1 + v.1 + dy);
                let diff = t - j;
                bx += diff * ix;
                by += diff * iy;
            }
            let eta = ((gyy * bx - gxy * by) / det, (gxx * by - gxy * bx) / det);
            if !eta.0.is_finite() || !eta.1.is_finite() {
                return None;
            }
            v.0 += eta.0;
            v.1 += eta.1;
            if eta.0 * eta.0 + eta.1 * eta.1 < config.epsilon * config.epsilon {
                break;
            }
        }

        if level > 0 {
            guess = (2.0 * (guess.0 + v.0), 2.0 * (guess.1 + v.1));
        } else {
            guess = (guess.0 + v.0, guess.1 + v.1);
        }
    }

    let tracked = Point2::new(point.x + guess.0, point.y + guess.1);
    let (w, h) = (prev[0].width as f32, prev[0].height as f32);
    if tracked.x < 0.0 || tracked.y < 0.0 || tracked.x > w - 1.0 || tracked.y > h - 1.0 {
        return None;
    }
    Some(tracked)
}
