use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Network input size and thresholds, read from the model's TOML config
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub input_width: u32,
    pub input_height: u32,
    /// Minimum top-class probability for a row to become a candidate
    pub confidence_threshold: f32,
    /// NMS score cut-off
    pub score_threshold: f32,
    /// Boxes overlapping a kept box by more than this IoU are suppressed
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: 416,
            input_height: 416,
            confidence_threshold: 0.5,
            score_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

impl DetectorConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Invalid detector config")?;
        anyhow::ensure!(
            config.input_width > 0 && config.input_height > 0,
            "Detector input size must be non-zero"
        );
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read detector config {}", path.display()))?;
        Self::from_toml(&text)
    }
}

/// The three files a detection model is loaded from
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// ONNX graph
    pub weights: PathBuf,
    /// TOML [`DetectorConfig`]
    pub config: PathBuf,
    /// Newline-delimited class names
    pub labels: PathBuf,
}

impl ModelFiles {
    /// Conventional file names inside a models directory
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            weights: dir.join("yolov3-tiny.onnx"),
            config: dir.join("yolov3-tiny.toml"),
            labels: dir.join("coco.names"),
        }
    }

    pub fn read_labels(&self) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(&self.labels)
            .with_context(|| format!("Failed to read labels {}", self.labels.display()))?;
        let labels: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        anyhow::ensure!(!labels.is_empty(), "Label file {} is empty", self.labels.display());
        Ok(labels)
    }
}
