use crate::geometry::Point2;
use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

/// Determinants below this are treated as singular
const SINGULAR_EPS: f64 = 1e-10;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("need at least {needed} correspondences, got {got}")]
    NotEnoughPoints { needed: usize, got: usize },

    #[error("point sets differ in length ({0} vs {1})")]
    LengthMismatch(usize, usize),

    #[error("correspondences are degenerate (collinear or coincident)")]
    Degenerate,

    #[error("estimated homography is singular")]
    Singular,

    #[error("RANSAC found no consensus set")]
    NoConsensus,
}

/// Planar projective transform, normalized so that `h[(2, 2)] == 1`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    pub matrix: Matrix3<f64>,
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Wrap a matrix after checking that it is finite and invertible
    pub fn from_matrix(matrix: Matrix3<f64>) -> Result<Self, GeometryError> {
        if !matrix.iter().all(|v| v.is_finite()) {
            return Err(GeometryError::Singular);
        }
        let scale = matrix[(2, 2)];
        let matrix = if scale.abs() > SINGULAR_EPS {
            matrix / scale
        } else {
            matrix
        };
        if matrix.determinant().abs() < SINGULAR_EPS {
            return Err(GeometryError::Singular);
        }
        Ok(Self { matrix })
    }

    pub fn translation(tx: f64, ty: f64) -> Self {
        Self {
            matrix: Matrix3::new(1.0, 0.0, tx, 0.0, 1.0, ty, 0.0, 0.0, 1.0),
        }
    }

    /// Map a point; `None` for points sent to infinity
    pub fn apply(&self, p: Point2) -> Option<Point2> {
        let v = self.matrix * Vector3::new(p.x as f64, p.y as f64, 1.0);
        if v[2].abs() < SINGULAR_EPS {
            return None;
        }
        Some(Point2::new((v[0] / v[2]) as f32, (v[1] / v[2]) as f32))
    }

    pub fn inverse(&self) -> Result<Self, GeometryError> {
        let inv = self.matrix.try_inverse().ok_or(GeometryError::Singular)?;
        Self::from_matrix(inv)
    }

    /// Euclidean distance between `H * src` and `dst`
    pub fn reprojection_error(&self, src: Point2, dst: Point2) -> f64 {
        match self.apply(src) {
            Some(p) => p.distance(&dst) as f64,
            None => f64::INFINITY,
        }
    }

    /// Row-major coefficients
    pub fn to_row_major_f32(&self) -> [f32; 9] {
        let m = &self.matrix;
        [
            m[(0, 0)] as f32,
            m[(0, 1)] as f32,
            m[(0, 2)] as f32,
            m[(1, 0)] as f32,
            m[(1, 1)] as f32,
            m[(1, 2)] as f32,
            m[(2, 0)] as f32,
            m[(2, 1)] as f32,
            m[(2, 2)] as f32,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct RansacConfig {
    /// Maximum reprojection distance (pixels) for an inlier
    pub reprojection_threshold: f64,
    pub max_iterations: usize,
    /// Desired probability of drawing at least one outlier-free sample
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            reprojection_threshold: 4.0,
            max_iterations: 2000,
            confidence: 0.995,
            seed: 0x5717_c4e5,
        }
    }
}

/// Direct linear transform on all given correspondences (least squares for
/// more than four)
pub fn estimate_homography(src: &[Point2], dst: &[Point2]) -> Result<Homography, GeometryError> {
    if src.len() != dst.len() {
        return Err(GeometryError::LengthMismatch(src.len(), dst.len()));
    }
    if src.len() < 4 {
        return Err(GeometryError::NotEnoughPoints {
            needed: 4,
            got: src.len(),
        });
    }

    let (src_n, t_src) = normalize_points(src).ok_or(GeometryError::Degenerate)?;
    let (dst_n, t_dst) = normalize_points(dst).ok_or(GeometryError::Degenerate)?;

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (x, y) = (s.0, s.1);
        let (u, v) = (d.0, d.1);
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // The null vector of A is the eigenvector of A^T A with the smallest
    // eigenvalue; this also works for the minimal 8x9 system
    let ata = a.transpose() * &a;
    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(GeometryError::Degenerate)?;
    let h = eigen.eigenvectors.column(min_idx);

    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_dst_inv = t_dst.try_inverse().ok_or(GeometryError::Degenerate)?;
    Homography::from_matrix(t_dst_inv * hn * t_src)
}

/// Robust homography fit. Returns the model refit on its inliers together
/// with the inlier mask.
pub fn find_homography_ransac(
    src: &[Point2],
    dst: &[Point2],
    config: &RansacConfig,
) -> Result<(Homography, Vec<bool>), GeometryError> {
    if src.len() != dst.len() {
        return Err(GeometryError::LengthMismatch(src.len(), dst.len()));
    }
    let n = src.len();
    if n < 4 {
        return Err(GeometryError::NotEnoughPoints { needed: 4, got: n });
    }

    let _span = tracing::debug_span!("ransac_homography", points = n).entered();

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut best: Option<(Homography, Vec<bool>, usize)> = None;
    let mut iterations = config.max_iterations.max(1);
    let mut i = 0;

    while i < iterations {
        i += 1;
        let idx = sample(&mut rng, n, 4).into_vec();
        let s: Vec<Point2> = idx.iter().map(|&j| src[j]).collect();
        let d: Vec<Point2> = idx.iter().map(|&j| dst[j]).collect();
        if has_collinear_triple(&s) || has_collinear_triple(&d) {
            continue;
        }

        let h = match estimate_homography(&s, &d) {
            Ok(h) => h,
            Err(_) => continue,
        };

        let mask = inlier_mask(&h, src, dst, config.reprojection_threshold);
        let count = mask.iter().filter(|&&m| m).count();

        if best.as_ref().map_or(true, |b| count > b.2) {
            iterations = iterations.min(adaptive_iterations(count, n, config.confidence));
            best = Some((h, mask, count));
            if count == n {
                break;
            }
        }
    }

    let (h, mask, count) = best.ok_or(GeometryError::NoConsensus)?;
    if count < 4 {
        return Err(GeometryError::NoConsensus);
    }

    let in_src: Vec<Point2> = src.iter().zip(&mask).filter(|(_, &m)| m).map(|(p, _)| *p).collect();
    let in_dst: Vec<Point2> = dst.iter().zip(&mask).filter(|(_, &m)| m).map(|(p, _)| *p).collect();
    let refined = estimate_homography(&in_src, &in_dst).unwrap_or(h);
    let refined_mask = inlier_mask(&refined, src, dst, config.reprojection_threshold);

    // Keep whichever model explains more correspondences
    let (h, mask) = if refined_mask.iter().filter(|&&m| m).count() >= count {
        (refined, refined_mask)
    } else {
        (h, mask)
    };

    tracing::debug!(
        "RANSAC kept {} of {} correspondences after {} iterations",
        mask.iter().filter(|&&m| m).count(),
        n,
        i
    );
    Ok((h, mask))
}

fn inlier_mask(h: &Homography, src: &[Point2], dst: &[Point2], threshold: f64) -> Vec<bool> {
    src.iter()
        .zip(dst)
        .map(|(s, d)| h.reprojection_error(*s, *d) <= threshold)
        .collect()
}

fn adaptive_iterations(inliers: usize, total: usize, confidence: f64) -> usize {
    let ratio = inliers as f64 / total as f64;
    let p_good = ratio.powi(4);
    if p_good >= 1.0 - f64::EPSILON {
        return 1;
    }
    if p_good <= f64::EPSILON {
        return usize::MAX;
    }
    let k = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    k.ceil().max(1.0) as usize
}

fn has_collinear_triple(points: &[Point2]) -> bool {
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            for k in (j + 1)..points.len() {
                let (a, b, c) = (points[i], points[j], points[k]);
                let cross = (b.x - a.x) as f64 * (c.y - a.y) as f64
                    - (b.y - a.y) as f64 * (c.x - a.x) as f64;
                if cross.abs() < 1e-6 {
                    return true;
                }
            }
        }
    }
    false
}

/// Hartley normalization: centroid at the origin, mean distance sqrt(2)
fn normalize_points(points: &[Point2]) -> Option<(Vec<(f64, f64)>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x as f64).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y as f64).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x as f64 - cx).powi(2) + (p.y as f64 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| ((p.x as f64 - cx) * s, (p.y as f64 - cy) * s))
        .collect();
    Some((normalized, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn known() -> Homography {
        Homography::from_matrix(Matrix3::new(
            1.05, 0.02, 30.0, //
            -0.03, 0.98, 5.0, //
            0.0002, -0.0001, 1.0,
        ))
        .unwrap()
    }

    fn grid() -> Vec<Point2> {
        let mut pts = Vec::new();
        for y in 0..6 {
            for x in 0..7 {
                pts.push(Point2::new(15.0 + x as f32 * 40.0, 10.0 + y as f32 * 35.0));
            }
        }
        pts
    }

    #[test]
    fn test_four_point_recovery() {
        let h = known();
        let src = vec![
            Point2::new(0.0, 0.0),
            Point2::new(200.0, 0.0),
            Point2::new(200.0, 150.0),
            Point2::new(0.0, 150.0),
        ];
        let dst: Vec<Point2> = src.iter().map(|p| h.apply(*p).unwrap()).collect();
        let est = estimate_homography(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(est.reprojection_error(*s, *d) < 4.0);
            assert!(est.reprojection_error(*s, *d) < 1e-2);
        }
        assert_relative_eq!(est.matrix[(0, 2)], 30.0, epsilon = 1e-2);
    }

    #[test]
    fn test_ransac_ignores_outliers() {
        let h = known();
        let src = grid();
        let mut dst: Vec<Point2> = src.iter().map(|p| h.apply(*p).unwrap()).collect();
        // Corrupt a fifth of the correspondences
        for (i, d) in dst.iter_mut().enumerate() {
            if i % 5 == 0 {
                d.x += 80.0 + i as f32;
                d.y -= 45.0;
            }
        }
        let (est, mask) = find_homography_ransac(&src, &dst, &RansacConfig::default()).unwrap();
        for (i, &inlier) in mask.iter().enumerate() {
            assert_eq!(inlier, i % 5 != 0, "point {}", i);
        }
        for (i, (s, d)) in src.iter().zip(&dst).enumerate() {
            if i % 5 != 0 {
                assert!(est.reprojection_error(*s, *d) < 0.1);
            }
        }
    }

    #[test]
    fn test_too_few_points() {
        let p = vec![Point2::new(0.0, 0.0); 3];
        assert_eq!(
            estimate_homography(&p, &p),
            Err(GeometryError::NotEnoughPoints { needed: 4, got: 3 })
        );
    }

    #[test]
    fn test_coincident_points_are_degenerate() {
        let p = vec![Point2::new(5.0, 5.0); 6];
        assert_eq!(estimate_homography(&p, &p), Err(GeometryError::Degenerate));
        assert!(find_homography_ransac(&p, &p, &RansacConfig::default()).is_err());
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let m = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 0.0, 0.0, 1.0);
        assert_eq!(Homography::from_matrix(m), Err(GeometryError::Singular));
    }

    #[test]
    fn test_inverse_round_trip() {
        let h = known();
        let inv = h.inverse().unwrap();
        let p = Point2::new(120.0, 80.0);
        let back = inv.apply(h.apply(p).unwrap()).unwrap();
        assert!(back.distance(&p) < 1e-3);
    }
}
