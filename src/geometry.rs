//! Small geometric helpers shared by the stitcher, scanner and compositing
//! sessions.

/// 2-D point in image pixel space (sub-pixel allowed)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned region of interest.
///
/// Width and height are signed because an interactive drag from the
/// bottom-right towards the top-left produces negative extents. Call
/// [`Roi::normalized`] before handing a region to an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a region from the drag anchor and the current pointer position
    pub fn from_drag(anchor: (i32, i32), pointer: (i32, i32)) -> Self {
        Self::new(
            anchor.0,
            anchor.1,
            pointer.0.saturating_sub(anchor.0),
            pointer.1.saturating_sub(anchor.1),
        )
    }

    /// Same region with non-negative width and height. Extents that would
    /// overflow saturate at the `i32` range.
    pub fn normalized(&self) -> Self {
        let (x, width) = if self.width < 0 {
            (self.x.saturating_add(self.width), self.width.saturating_neg())
        } else {
            (self.x, self.width)
        };
        let (y, height) = if self.height < 0 {
            (self.y.saturating_add(self.height), self.height.saturating_neg())
        } else {
            (self.y, self.height)
        };
        Self::new(x, y, width, height)
    }

    /// Normalize and intersect with an image of the given size
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Self {
        let r = self.normalized();
        let max_x = i32::try_from(image_width).unwrap_or(i32::MAX);
        let max_y = i32::try_from(image_height).unwrap_or(i32::MAX);
        let x0 = r.x.clamp(0, max_x);
        let y0 = r.y.clamp(0, max_y);
        let x1 = r.x.saturating_add(r.width).clamp(0, max_x);
        let y1 = r.y.saturating_add(r.height).clamp(0, max_y);
        Self::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        let r = self.normalized();
        x >= r.x && x < r.x.saturating_add(r.width) && y >= r.y && y < r.y.saturating_add(r.height)
    }
}

/// Order four corners as top-left, top-right, bottom-right, bottom-left.
///
/// Top-left has the smallest `x + y`, bottom-right the largest; top-right
/// has the smallest `y - x` and bottom-left the largest.
pub fn order_corners(points: &[Point2; 4]) -> [Point2; 4] {
    let by = |key: fn(&Point2) -> f32, max: bool| {
        let mut best = points[0];
        for p in &points[1..] {
            let better = if max { key(p) > key(&best) } else { key(p) < key(&best) };
            if better {
                best = *p;
            }
        }
        best
    };

    let sum = |p: &Point2| p.x + p.y;
    let diff = |p: &Point2| p.y - p.x;

    [
        by(sum, false),
        by(diff, false),
        by(sum, true),
        by(diff, true),
    ]
}

/// Output size of a rectified quadrilateral given ordered corners.
///
/// Width is the longer of the top and bottom edges, height the longer of
/// the left and right edges.
pub fn quad_output_size(ordered: &[Point2; 4]) -> (u32, u32) {
    let [tl, tr, br, bl] = ordered;
    let width = br.distance(bl).max(tr.distance(tl));
    let height = tr.distance(br).max(tl.distance(bl));
    (width as u32, height as u32)
}

/// Largest uniform scale that makes `src` fit inside `bounds`
pub fn fit_scale(src: (u32, u32), bounds: (u32, u32)) -> f64 {
    if src.0 == 0 || src.1 == 0 {
        return 0.0;
    }
    (bounds.0 as f64 / src.0 as f64).min(bounds.1 as f64 / src.1 as f64)
}

/// Dimensions after a uniform scale, truncated like an integer resize target
pub fn scaled_size(src: (u32, u32), scale: f64) -> (u32, u32) {
    (
        (src.0 as f64 * scale) as u32,
        (src.1 as f64 * scale) as u32,
    )
}

/// Top-left offset that centers `inner` inside `outer`
pub fn centered_offset(inner: (u32, u32), outer: (u32, u32)) -> (u32, u32) {
    (
        outer.0.saturating_sub(inner.0) / 2,
        outer.1.saturating_sub(inner.1) / 2,
    )
}

/// Maps pointer positions on a display widget to image pixel coordinates.
///
/// The image is assumed to be drawn aspect-preserving and centered inside
/// the widget, the way a label scales a pixmap with "keep aspect ratio".
#[derive(Debug, Clone, Copy)]
pub struct ViewportMapping {
    widget: (u32, u32),
    image: (u32, u32),
    drawn: (u32, u32),
}

impl ViewportMapping {
    pub fn new(widget: (u32, u32), image: (u32, u32)) -> Self {
        let drawn = scaled_size(image, fit_scale(image, widget));
        Self {
            widget,
            image,
            drawn,
        }
    }

    /// Image pixel under the widget position, or `None` when the position
    /// falls on the letterbox margin
    pub fn to_image(&self, wx: i32, wy: i32) -> Option<(u32, u32)> {
        if self.drawn.0 == 0 || self.drawn.1 == 0 {
            return None;
        }
        let off_x = (self.widget.0 as i32 - self.drawn.0 as i32) / 2;
        let off_y = (self.widget.1 as i32 - self.drawn.1 as i32) / 2;
        let x = wx - off_x;
        let y = wy - off_y;
        if x < 0 || y < 0 || x >= self.drawn.0 as i32 || y >= self.drawn.1 as i32 {
            return None;
        }
        let sx = self.image.0 as f64 / self.drawn.0 as f64;
        let sy = self.image.1 as f64 / self.drawn.1 as f64;
        Some(((x as f64 * sx) as u32, (y as f64 * sy) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_drag_normalizes() {
        let dragged = Roi::from_drag((50, 40), (10, 5));
        assert_eq!(dragged, Roi::new(50, 40, -40, -35));
        assert_eq!(dragged.normalized(), Roi::new(10, 5, 40, 35));
        assert_eq!(Roi::new(10, 5, 40, 35).normalized(), Roi::new(10, 5, 40, 35));
    }

    #[test]
    fn test_clamp_to_image() {
        let r = Roi::new(-10, 20, 50, 100).clamp_to(30, 60);
        assert_eq!(r, Roi::new(0, 20, 30, 40));
        assert!(Roi::new(100, 100, 5, 5).clamp_to(30, 30).is_empty());
    }

    #[test]
    fn test_extreme_extents_saturate() {
        let far = Roi::new(2_147_483_000, 0, 1000, 10);
        assert!(far.clamp_to(320, 240).is_empty());
        assert!(!far.contains(0, 5));

        let widest = Roi::new(0, 0, i32::MIN, 5).normalized();
        assert_eq!(widest, Roi::new(i32::MIN, 0, i32::MAX, 5));
        assert_eq!(Roi::new(0, 0, i32::MIN, 5).clamp_to(100, 100), Roi::new(0, 0, 0, 5));

        let dragged = Roi::from_drag((i32::MAX, 0), (i32::MIN, 10));
        assert_eq!(dragged.normalized().clamp_to(50, 50), Roi::new(0, 0, 50, 10));
    }

    #[test]
    fn test_order_corners() {
        let shuffled = [
            Point2::new(90.0, 110.0),
            Point2::new(10.0, 5.0),
            Point2::new(5.0, 100.0),
            Point2::new(95.0, 8.0),
        ];
        let [tl, tr, br, bl] = order_corners(&shuffled);
        assert_eq!(tl, Point2::new(10.0, 5.0));
        assert_eq!(tr, Point2::new(95.0, 8.0));
        assert_eq!(br, Point2::new(90.0, 110.0));
        assert_eq!(bl, Point2::new(5.0, 100.0));
    }

    #[test]
    fn test_quad_output_size() {
        let rect = [
            Point2::new(0.0, 0.0),
            Point2::new(40.0, 0.0),
            Point2::new(40.0, 30.0),
            Point2::new(0.0, 30.0),
        ];
        assert_eq!(quad_output_size(&rect), (40, 30));
    }

    #[test]
    fn test_fit_and_center() {
        let scale = fit_scale((400, 200), (100, 100));
        assert!((scale - 0.25).abs() < 1e-12);
        let size = scaled_size((400, 200), scale);
        assert_eq!(size, (100, 50));
        assert_eq!(centered_offset(size, (100, 100)), (0, 25));
    }

    #[test]
    fn test_viewport_mapping_letterbox() {
        // 200x100 image drawn at 400x200 inside a 400x400 widget: 100px bars
        let map = ViewportMapping::new((400, 400), (200, 100));
        assert_eq!(map.to_image(0, 50), None);
        assert_eq!(map.to_image(0, 100), Some((0, 0)));
        assert_eq!(map.to_image(399, 299), Some((199, 99)));
        assert_eq!(map.to_image(200, 300), None);
    }
}
