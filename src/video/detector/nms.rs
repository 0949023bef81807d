/// Axis-aligned box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0) as i64 * (y2 - y1).max(0) as i64;
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}

/// A detection candidate before or after suppression
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub confidence: f32,
}

/// Turn raw network rows `[cx, cy, w, h, objectness, p_0 .. p_n]` into
/// candidates whose top class probability exceeds `confidence_threshold`.
///
/// Geometry is normalized to the frame and scaled to `frame_size`.
pub fn decode_rows<'a, I>(rows: I, frame_size: (u32, u32), confidence_threshold: f32) -> Vec<Candidate>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let (fw, fh) = (frame_size.0 as f32, frame_size.1 as f32);
    let mut candidates = Vec::new();

    for row in rows {
        if row.len() < 6 {
            continue;
        }
        let scores = &row[5..];
        let Some((class_id, &confidence)) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if !(confidence > confidence_threshold) {
            continue;
        }

        let center_x = (row[0] * fw) as i32;
        let center_y = (row[1] * fh) as i32;
        let width = (row[2] * fw) as i32;
        let height = (row[3] * fh) as i32;
        candidates.push(Candidate {
            bbox: BoundingBox {
                x: (center_x as f32 - width as f32 / 2.0) as i32,
                y: (center_y as f32 - height as f32 / 2.0) as i32,
                width,
                height,
            },
            class_id,
            confidence,
        });
    }

    candidates
}

/// Greedy non-maximum suppression over all classes.
///
/// Candidates scoring at or below `score_threshold` are dropped; the rest
/// are visited by descending score and kept unless they overlap an already
/// kept box by more than `iou_threshold`.
pub fn non_max_suppression(
    candidates: &[Candidate],
    score_threshold: f32,
    iou_threshold: f32,
) -> Vec<Candidate> {
    let mut order: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.confidence > score_threshold)
        .collect();
    order.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in order {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate.clone());
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn candidate(x: i32, y: i32, w: i32, h: i32, confidence: f32) -> Candidate {
        Candidate {
            bbox: BoundingBox {
                x,
                y,
                width: w,
                height: h,
            },
            class_id: 0,
            confidence,
        }
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        let b = BoundingBox { x: 5, y: 0, width: 10, height: 10 };
        assert_relative_eq!(a.iou(&b), 50.0 / 150.0);
        assert_relative_eq!(a.iou(&a), 1.0);
        let far = BoundingBox { x: 100, y: 100, width: 5, height: 5 };
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_overlapping_boxes_collapse() {
        let boxes = [
            candidate(10, 10, 100, 100, 0.8),
            candidate(15, 12, 100, 100, 0.9),
            candidate(300, 300, 50, 50, 0.7),
        ];
        let kept = non_max_suppression(&boxes, 0.5, 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].bbox.x, 300);
    }

    #[test]
    fn test_low_scores_never_survive() {
        let boxes = [
            candidate(0, 0, 10, 10, 0.5),
            candidate(50, 50, 10, 10, 0.3),
            candidate(90, 90, 10, 10, 0.51),
        ];
        let kept = non_max_suppression(&boxes, 0.5, 0.4);
        assert_eq!(kept.len(), 1);
        assert!(kept.iter().all(|c| c.confidence > 0.5));
    }

    #[test]
    fn test_decode_scales_and_filters() {
        let keep = [0.5, 0.5, 0.2, 0.4, 0.9, 0.1, 0.7, 0.2];
        let weak = [0.1, 0.1, 0.1, 0.1, 0.9, 0.5, 0.2, 0.3];
        let short = [0.5, 0.5, 0.2];
        let rows: Vec<&[f32]> = vec![&keep, &weak, &short];
        let out = decode_rows(rows, (200, 100), 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert_eq!(
            out[0].bbox,
            BoundingBox { x: 80, y: 30, width: 40, height: 40 }
        );
    }
}
