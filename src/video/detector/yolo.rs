use super::config::DetectorConfig;
use super::preprocess::Preprocessor;
use super::{DetectionModel, DetectorError};
use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

/// YOLO-family detector exported to ONNX.
///
/// The first graph output must be a `[.., rows, 5 + classes]` tensor of
/// normalized `[cx, cy, w, h, objectness, class scores..]` rows.
pub struct YoloOnnx {
    session: Session,
    preprocessor: Preprocessor,
}

impl YoloOnnx {
    pub fn new<P: AsRef<Path>>(model_path: P, config: &DetectorConfig) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading detection model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!(
            "Detection model loaded, input {}x{}",
            config.input_width,
            config.input_height
        );

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(config.input_width, config.input_height),
        })
    }
}

impl DetectionModel for YoloOnnx {
    fn forward(&mut self, frame: &RgbImage) -> Result<Vec<Vec<f32>>, DetectorError> {
        let input = self.preprocessor.preprocess(frame);

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self.session.run(ort::inputs![Tensor::from_array(input)?])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        let row_len = match shape.last() {
            Some(&n) if n >= 6 => n as usize,
            _ => return Err(DetectorError::OutputShape(shape.to_vec())),
        };
        if data.len() % row_len != 0 {
            return Err(DetectorError::OutputShape(shape.to_vec()));
        }

        Ok(data.chunks_exact(row_len).map(<[f32]>::to_vec).collect())
    }

    fn input_size(&self) -> (u32, u32) {
        self.preprocessor.target_size()
    }
}
