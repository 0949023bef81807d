//! Document scanning: find the dominant quadrilateral in a photo and
//! rectify it to a fronto-parallel view.

use crate::geometry::{order_corners, quad_output_size, Point2};
use crate::stitch::{estimate_homography, GeometryError};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::{arc_length, contour_area};
use imageproc::morphology::dilate;

const CANNY_LOW: f32 = 75.0;
const CANNY_HIGH: f32 = 200.0;

/// Douglas-Peucker tolerance as a fraction of the contour perimeter
const APPROX_FRACTION: f64 = 0.02;

/// Share of each side ignored at both ends when fitting its line
const SIDE_TRIM: f32 = 0.15;

/// Edge pixels further than this from a side's rough line are not used to
/// fit it
const SIDE_BAND: f32 = 3.0;

/// Corners of the largest four-sided outline in the image, if any
pub fn detect_document(image: &RgbImage) -> Option<[Point2; 4]> {
    let _span = tracing::debug_span!("detect_document").entered();

    let gray = DynamicImage::ImageRgb8(image.clone()).to_luma8();
    let blurred = gaussian_blur_f32(&gray, 1.1);
    let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
    // Close single-pixel gaps Canny leaves at corners before tracing
    let closed = dilate(&edges, Norm::LInf, 1);

    let largest = find_contours::<i32>(&closed)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.points.len() >= 4)
        .max_by(|a, b| contour_area(&a.points).total_cmp(&contour_area(&b.points)))?;

    let epsilon = APPROX_FRACTION * arc_length(&largest.points, true);
    if epsilon <= 0.0 {
        return None;
    }
    let outline: Vec<Point2> = largest
        .points
        .iter()
        .map(|p| Point2::new(p.x as f32, p.y as f32))
        .collect();
    let vertices = approximate_closed(&outline, epsilon as f32);
    if vertices.len() != 4 {
        tracing::debug!("Largest outline has {} vertices, not a document", vertices.len());
        return None;
    }

    let rough = [
        outline[vertices[0]],
        outline[vertices[1]],
        outline[vertices[2]],
        outline[vertices[3]],
    ];
    match refine_corners(&edges, &outline, &vertices) {
        Some(corners) => Some(corners),
        None => {
            tracing::debug!("Could not fit document sides, using outline vertices");
            Some(rough)
        }
    }
}

/// Douglas-Peucker over a closed outline, anchored at two mutually distant
/// points so the split never starts in the middle of a side. Returns
/// indices into `outline` in loop order.
fn approximate_closed(outline: &[Point2], epsilon: f32) -> Vec<usize> {
    let n = outline.len();
    if n < 3 {
        return (0..n).collect();
    }

    let centroid = Point2::new(
        outline.iter().map(|p| p.x).sum::<f32>() / n as f32,
        outline.iter().map(|p| p.y).sum::<f32>() / n as f32,
    );
    let farthest_from = |origin: Point2| {
        (0..n)
            .max_by(|&a, &b| {
                outline[a]
                    .distance(&origin)
                    .total_cmp(&outline[b].distance(&origin))
            })
            .unwrap_or(0)
    };
    let start = farthest_from(centroid);
    let opposite = farthest_from(outline[start]);

    let walk: Vec<usize> = (0..=n).map(|k| (start + k) % n).collect();
    let split = (opposite + n - start) % n;
    if split == 0 {
        return vec![start];
    }

    let mut vertices = vec![start];
    douglas_peucker(outline, &walk[..=split], epsilon, &mut vertices);
    vertices.push(walk[split]);
    douglas_peucker(outline, &walk[split..], epsilon, &mut vertices);
    vertices
}

/// Push the interior vertices of `run` that survive simplification
fn douglas_peucker(outline: &[Point2], run: &[usize], epsilon: f32, out: &mut Vec<usize>) {
    if run.len() < 3 {
        return;
    }
    let first = outline[run[0]];
    let last = outline[run[run.len() - 1]];
    let farthest = run[1..run.len() - 1]
        .iter()
        .enumerate()
        .map(|(k, &i)| (k + 1, segment_distance(outline[i], first, last)))
        .max_by(|a, b| a.1.total_cmp(&b.1));

    if let Some((k, distance)) = farthest {
        if distance > epsilon {
            douglas_peucker(outline, &run[..=k], epsilon, out);
            out.push(run[k]);
            douglas_peucker(outline, &run[k..], epsilon, out);
        }
    }
}

fn segment_distance(p: Point2, a: Point2, b: Point2) -> f32 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let length_sq = dx * dx + dy * dy;
    if length_sq == 0.0 {
        return p.distance(&a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / length_sq).clamp(0.0, 1.0);
    p.distance(&Point2::new(a.x + t * dx, a.y + t * dy))
}

/// Total least squares line through a point set
#[derive(Debug, Clone, Copy)]
struct Line {
    centroid: Point2,
    /// Unit direction
    dx: f32,
    dy: f32,
}

impl Line {
    fn fit(points: &[Point2]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f32;
        let cx = points.iter().map(|p| p.x).sum::<f32>() / n;
        let cy = points.iter().map(|p| p.y).sum::<f32>() / n;
        let (mut sxx, mut sxy, mut syy) = (0.0f32, 0.0f32, 0.0f32);
        for p in points {
            let (x, y) = (p.x - cx, p.y - cy);
            sxx += x * x;
            sxy += x * y;
            syy += y * y;
        }
        if sxx + syy == 0.0 {
            return None;
        }
        let angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        Some(Self {
            centroid: Point2::new(cx, cy),
            dx: angle.cos(),
            dy: angle.sin(),
        })
    }

    /// Position of `p` along the line, relative to the centroid
    fn along(&self, p: Point2) -> f32 {
        (p.x - self.centroid.x) * self.dx + (p.y - self.centroid.y) * self.dy
    }

    fn distance(&self, p: Point2) -> f32 {
        ((p.y - self.centroid.y) * self.dx - (p.x - self.centroid.x) * self.dy).abs()
    }

    fn intersect(&self, other: &Line) -> Option<Point2> {
        let det = self.dx * other.dy - self.dy * other.dx;
        if det.abs() < 1e-3 {
            return None;
        }
        let (wx, wy) = (
            other.centroid.x - self.centroid.x,
            other.centroid.y - self.centroid.y,
        );
        let t = (wx * other.dy - wy * other.dx) / det;
        Some(Point2::new(
            self.centroid.x + t * self.dx,
            self.centroid.y + t * self.dy,
        ))
    }
}

/// Fit each side to the undilated edge pixels next to it and intersect
/// neighbouring sides. The traced outline sits outside the true border by
/// the dilation radius, and its vertices round off at the corners.
fn refine_corners(
    edges: &GrayImage,
    outline: &[Point2],
    vertices: &[usize],
) -> Option<[Point2; 4]> {
    let n = outline.len();
    let mut sides = Vec::with_capacity(4);

    for i in 0..4 {
        let from = vertices[i];
        let to = vertices[(i + 1) % 4];
        let length = (to + n - from) % n;
        let trim = (length as f32 * SIDE_TRIM) as usize;
        let middle: Vec<Point2> = (trim..=length.saturating_sub(trim))
            .map(|k| outline[(from + k) % n])
            .collect();
        let rough = Line::fit(&middle)?;

        let (lo, hi) = middle
            .iter()
            .map(|p| rough.along(*p))
            .fold((f32::MAX, f32::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));
        let (x0, x1, y0, y1) = middle.iter().fold(
            (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
            |(x0, x1, y0, y1), p| (x0.min(p.x), x1.max(p.x), y0.min(p.y), y1.max(p.y)),
        );

        let (width, height) = edges.dimensions();
        let clamp_x = |v: f32| (v.max(0.0) as u32).min(width.saturating_sub(1));
        let clamp_y = |v: f32| (v.max(0.0) as u32).min(height.saturating_sub(1));
        let mut support = Vec::new();
        for y in clamp_y(y0 - SIDE_BAND)..=clamp_y(y1 + SIDE_BAND) {
            for x in clamp_x(x0 - SIDE_BAND)..=clamp_x(x1 + SIDE_BAND) {
                if edges.get_pixel(x, y)[0] == 0 {
                    continue;
                }
                let p = Point2::new(x as f32, y as f32);
                let t = rough.along(p);
                if rough.distance(p) <= SIDE_BAND && t >= lo && t <= hi {
                    support.push(p);
                }
            }
        }
        sides.push(Line::fit(&support).unwrap_or(rough));
    }

    let mut corners = [Point2::default(); 4];
    for (k, corner) in corners.iter_mut().enumerate() {
        *corner = sides[(k + 3) % 4].intersect(&sides[k])?;
    }
    let (width, height) = edges.dimensions();
    let inside = |p: &Point2| {
        p.x >= -1.0 && p.y >= -1.0 && p.x <= width as f32 && p.y <= height as f32
    };
    corners.iter().all(inside).then_some(corners)
}

/// Perspective-correct the quadrilateral spanned by `corners` (any order)
pub fn rectify(image: &RgbImage, corners: &[Point2; 4]) -> Result<RgbImage, GeometryError> {
    let ordered = order_corners(corners);
    let (width, height) = quad_output_size(&ordered);
    if width < 2 || height < 2 {
        return Err(GeometryError::Degenerate);
    }

    let (w, h) = ((width - 1) as f32, (height - 1) as f32);
    let target = [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ];
    let homography = estimate_homography(&ordered, &target)?;
    let projection =
        Projection::from_matrix(homography.to_row_major_f32()).ok_or(GeometryError::Singular)?;

    let mut out = RgbImage::new(width, height);
    warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
    Ok(out)
}

/// Detect and rectify; returns a copy of the input when no document is
/// found or the outline is degenerate
pub fn scan(image: &RgbImage) -> RgbImage {
    let Some(corners) = detect_document(image) else {
        tracing::info!("No document outline found");
        return image.clone();
    };
    match rectify(image, &corners) {
        Ok(rectified) => rectified,
        Err(e) => {
            tracing::warn!("Could not rectify document: {}", e);
            image.clone()
        }
    }
}
