mod config;
mod nms;
mod preprocess;
mod yolo;

pub use config::{DetectorConfig, ModelFiles};
pub use nms::{decode_rows, non_max_suppression, BoundingBox, Candidate};
pub use preprocess::Preprocessor;
pub use yolo::YoloOnnx;

use ab_glyph::{Font, FontRef, PxScale, ScaleFont};
use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("inference failed: {0}")]
    Inference(#[from] ort::Error),

    #[error("unexpected model output shape {0:?}")]
    OutputShape(Vec<i64>),
}

/// Trait for detection networks
/// Allows swapping the ONNX backend for another runtime, or a fake in tests
pub trait DetectionModel {
    /// Run the network on a frame and return its raw output rows
    fn forward(&mut self, frame: &RgbImage) -> Result<Vec<Vec<f32>>, DetectorError>;

    /// Get the network's input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32);
}

/// A surviving detection with its class name
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
}

static LABEL_FONT: &[u8] = include_bytes!("../../../assets/DejaVuSansMono.ttf");
const LABEL_SCALE: f32 = 14.0;
const LABEL_PADDING: u32 = 2;

fn label_font() -> Option<FontRef<'static>> {
    match FontRef::try_from_slice(LABEL_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!("Label font unusable, drawing boxes only: {}", e);
            None
        }
    }
}

/// Per-frame object detector with an on/off toggle.
///
/// A detector whose model failed to load stays disabled for its lifetime.
pub struct ObjectDetector {
    model: Option<Box<dyn DetectionModel>>,
    labels: Vec<String>,
    colors: Vec<Rgb<u8>>,
    config: DetectorConfig,
    font: Option<FontRef<'static>>,
    enabled: bool,
}

impl ObjectDetector {
    /// Load the model files; on any failure log once and return a
    /// permanently disabled detector
    pub fn load(files: &ModelFiles) -> Self {
        match Self::try_load(files) {
            Ok(detector) => detector,
            Err(e) => {
                tracing::warn!("Object detection unavailable: {:#}", e);
                Self::unavailable()
            }
        }
    }

    fn try_load(files: &ModelFiles) -> Result<Self> {
        let config = DetectorConfig::from_file(&files.config)?;
        let labels = files.read_labels()?;
        let model = YoloOnnx::new(&files.weights, &config)?;
        Ok(Self::with_model(Box::new(model), labels, config))
    }

    pub fn with_model(
        model: Box<dyn DetectionModel>,
        labels: Vec<String>,
        config: DetectorConfig,
    ) -> Self {
        let colors = class_colors(&labels);
        Self {
            model: Some(model),
            labels,
            colors,
            config,
            font: label_font(),
            enabled: false,
        }
    }

    /// A detector with no model
    pub fn unavailable() -> Self {
        Self {
            model: None,
            labels: Vec::new(),
            colors: Vec::new(),
            config: DetectorConfig::default(),
            font: None,
            enabled: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Flip detection on or off and return the new flag; stays off when no
    /// model is loaded
    pub fn toggle(&mut self) -> bool {
        self.enabled = self.model.is_some() && !self.enabled;
        self.enabled
    }

    /// Detections on `frame` after thresholding and suppression
    pub fn detections(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let Some(model) = self.model.as_mut() else {
            return Ok(Vec::new());
        };
        let _span = tracing::debug_span!("detect").entered();

        let rows = model.forward(frame)?;
        let candidates = decode_rows(
            rows.iter().map(Vec::as_slice),
            frame.dimensions(),
            self.config.confidence_threshold,
        );
        let kept = non_max_suppression(
            &candidates,
            self.config.score_threshold,
            self.config.nms_threshold,
        );
        tracing::debug!("{} candidates, {} after NMS", candidates.len(), kept.len());

        Ok(kept
            .into_iter()
            .map(|c| Detection {
                label: self
                    .labels
                    .get(c.class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("class {}", c.class_id)),
                bbox: c.bbox,
                class_id: c.class_id,
                confidence: c.confidence,
            })
            .collect())
    }

    /// Frame with detection overlays, or an unchanged copy when disabled.
    /// Inference errors are logged and leave the frame unchanged.
    pub fn detect(&mut self, frame: &RgbImage) -> RgbImage {
        if !self.enabled {
            return frame.clone();
        }
        match self.detections(frame) {
            Ok(detections) => {
                let mut out = frame.clone();
                for detection in &detections {
                    tracing::info!(
                        label = %detection.label,
                        confidence = %format!("{:.2}", detection.confidence),
                        "Detected object"
                    );
                    let color = self
                        .colors
                        .get(detection.class_id)
                        .copied()
                        .unwrap_or(Rgb([255, 255, 255]));
                    draw_detection(&mut out, detection, color, self.font.as_ref());
                }
                out
            }
            Err(e) => {
                tracing::warn!("Detection failed: {}", e);
                frame.clone()
            }
        }
    }
}

/// 2px box with a "label confidence" tab on top of it
fn draw_detection(
    canvas: &mut RgbImage,
    detection: &Detection,
    color: Rgb<u8>,
    font: Option<&FontRef<'static>>,
) {
    let b = detection.bbox;
    if b.width <= 0 || b.height <= 0 {
        return;
    }
    draw_hollow_rect_mut(
        canvas,
        Rect::at(b.x, b.y).of_size(b.width as u32, b.height as u32),
        color,
    );
    if b.width > 2 && b.height > 2 {
        draw_hollow_rect_mut(
            canvas,
            Rect::at(b.x + 1, b.y + 1).of_size(b.width as u32 - 2, b.height as u32 - 2),
            color,
        );
    }

    let Some(font) = font else {
        return;
    };
    let text = format!("{} {:.2}", detection.label, detection.confidence);
    let (tab_width, tab_height) = label_tab_size(font, &text);

    // Above the box, or just inside its top edge when there is no room
    let tab_y = if b.y >= tab_height as i32 {
        b.y - tab_height as i32
    } else {
        b.y
    };
    draw_filled_rect_mut(
        canvas,
        Rect::at(b.x, tab_y).of_size(tab_width, tab_height),
        color,
    );
    draw_text_mut(
        canvas,
        text_color(color),
        b.x + LABEL_PADDING as i32,
        tab_y + LABEL_PADDING as i32,
        PxScale::from(LABEL_SCALE),
        font,
        &text,
    );
}

/// Tab size fitting `text` plus padding; the height covers the full
/// ascent-to-descent line so descenders stay on the tab
fn label_tab_size(font: &FontRef<'static>, text: &str) -> (u32, u32) {
    let scale = PxScale::from(LABEL_SCALE);
    let (text_width, _) = text_size(scale, font, text);
    let line_height = font.as_scaled(scale).height().ceil() as u32;
    (text_width + 2 * LABEL_PADDING, line_height + 2 * LABEL_PADDING)
}

/// Black on light tabs, white on dark ones
fn text_color(background: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = background.0;
    let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    if luma > 140.0 {
        Rgb([0, 0, 0])
    } else {
        Rgb([255, 255, 255])
    }
}

/// FNV-1a over the class names, so colors depend only on the label list
fn label_hash(labels: &[String]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for label in labels {
        for byte in label.bytes().chain(std::iter::once(b'\n')) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

/// One deterministic color per class
pub fn class_colors(labels: &[String]) -> Vec<Rgb<u8>> {
    let mut rng = ChaCha8Rng::seed_from_u64(label_hash(labels));
    labels
        .iter()
        .map(|_| Rgb([rng.gen(), rng.gen(), rng.gen()]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns the same rows for every frame
    struct FakeModel {
        rows: Vec<Vec<f32>>,
    }

    impl DetectionModel for FakeModel {
        fn forward(&mut self, _frame: &RgbImage) -> Result<Vec<Vec<f32>>, DetectorError> {
            Ok(self.rows.clone())
        }

        fn input_size(&self) -> (u32, u32) {
            (416, 416)
        }
    }

    fn labels() -> Vec<String> {
        vec!["person".to_string(), "dog".to_string()]
    }

    fn detector(rows: Vec<Vec<f32>>) -> ObjectDetector {
        ObjectDetector::with_model(
            Box::new(FakeModel { rows }),
            labels(),
            DetectorConfig::default(),
        )
    }

    #[test]
    fn test_disabled_by_default_and_passthrough() {
        let mut det = detector(vec![vec![0.5, 0.5, 0.5, 0.5, 1.0, 0.9, 0.0]]);
        assert!(!det.is_enabled());
        let frame = RgbImage::from_pixel(100, 100, Rgb([7, 7, 7]));
        assert_eq!(det.detect(&frame), frame);
        assert!(det.toggle());
        assert_ne!(det.detect(&frame), frame);
        assert!(!det.toggle());
    }

    #[test]
    fn test_overlapping_rows_collapse_to_one() {
        let mut det = detector(vec![
            vec![0.50, 0.50, 0.4, 0.4, 1.0, 0.80, 0.1],
            vec![0.52, 0.51, 0.4, 0.4, 1.0, 0.95, 0.1],
            vec![0.10, 0.10, 0.1, 0.1, 1.0, 0.10, 0.45],
        ]);
        let frame = RgbImage::new(200, 200);
        let found = det.detections(&frame).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].label, "person");
        assert!(found.iter().all(|d| d.confidence > 0.5));
    }

    #[test]
    fn test_missing_files_leave_detector_disabled() {
        let mut det = ObjectDetector::load(&ModelFiles::in_dir("/nonexistent/retouch/models"));
        assert!(!det.is_available());
        assert!(!det.toggle());
        assert!(!det.toggle());
        let frame = RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]));
        assert_eq!(det.detect(&frame), frame);
    }

    #[test]
    fn test_label_text_drawn_above_box() {
        let mut det = detector(vec![vec![0.5, 0.5, 0.4, 0.4, 1.0, 0.9, 0.0]]);
        det.toggle();
        let frame = RgbImage::new(200, 200);
        let found = det.detections(&frame).unwrap();
        assert_eq!(found[0].bbox, BoundingBox { x: 60, y: 60, width: 80, height: 80 });

        let out = det.detect(&frame);
        let color = class_colors(&labels())[0];
        let above: Vec<Rgb<u8>> = (0..60)
            .flat_map(|y| (60..200).map(move |x| (x, y)))
            .map(|(x, y)| *out.get_pixel(x, y))
            .collect();
        // A tab in the class color with glyphs rendered on it
        assert!(above.contains(&color));
        assert!(above.iter().any(|p| *p != color && *p != Rgb([0, 0, 0])));
    }

    #[test]
    fn test_label_moves_inside_box_at_top_edge() {
        let mut det = detector(vec![vec![0.5, 0.2, 0.4, 0.4, 1.0, 0.9, 0.0]]);
        det.toggle();
        let frame = RgbImage::new(200, 200);
        let found = det.detections(&frame).unwrap();
        assert_eq!(found[0].bbox.y, 0);

        let out = det.detect(&frame);
        let color = class_colors(&labels())[0];
        let font = label_font().unwrap();
        let (tab_w, tab_h) = label_tab_size(&font, "person 0.90");
        // Bottom-right padding of the tab, inside the box
        assert_eq!(*out.get_pixel(60 + tab_w - 1, tab_h - 1), color);
        assert_eq!(*out.get_pixel(60 + tab_w, tab_h + 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_text_color_contrasts_with_tab() {
        assert_eq!(text_color(Rgb([250, 250, 90])), Rgb([0, 0, 0]));
        assert_eq!(text_color(Rgb([20, 30, 120])), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_class_colors_deterministic() {
        assert_eq!(class_colors(&labels()), class_colors(&labels()));
        assert_eq!(class_colors(&labels()).len(), 2);
    }
}
