use super::detector::ObjectDetector;
use super::source::{open_source, VideoSource};
use super::tracker::TrackerState;
use anyhow::Result;
use image::RgbImage;
use std::path::Path;

/// Seek, decode, then the optional tracking and detection overlays
pub struct VideoPipeline {
    source: Option<Box<dyn VideoSource>>,
    tracker: TrackerState,
    detector: ObjectDetector,
}

impl VideoPipeline {
    pub fn new(detector: ObjectDetector) -> Self {
        Self {
            source: None,
            tracker: TrackerState::Disabled,
            detector,
        }
    }

    /// Replace the current source. Tracking restarts from the first frame
    /// read, with an empty trail.
    pub fn load(&mut self, source: Box<dyn VideoSource>) {
        self.release();
        tracing::info!("Loaded video with {} frames", source.frame_count());
        self.source = Some(source);
        if self.tracker.is_enabled() {
            self.tracker = TrackerState::Seeding;
        }
    }

    /// Open a video file or a frame directory as the source
    pub fn load_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let source = open_source(path)?;
        self.load(source);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.source.is_some()
    }

    pub fn frame_count(&self) -> usize {
        self.source.as_ref().map_or(0, |s| s.frame_count())
    }

    /// Frame `index` with the enabled overlays, or `None` when nothing is
    /// loaded or the frame cannot be read
    pub fn frame(&mut self, index: usize) -> Option<RgbImage> {
        let source = self.source.as_mut()?;
        let _span = tracing::debug_span!("frame", index).entered();

        let frame = match source.seek(index).and_then(|_| source.read_frame()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Failed to read frame {}: {:#}", index, e);
                return None;
            }
        };

        let (tracker, frame) = std::mem::take(&mut self.tracker).advance(&frame);
        self.tracker = tracker;

        Some(self.detector.detect(&frame))
    }

    pub fn toggle_tracking(&mut self) -> bool {
        self.tracker = std::mem::take(&mut self.tracker).toggle();
        let enabled = self.tracker.is_enabled();
        tracing::info!("Tracking {}", if enabled { "enabled" } else { "disabled" });
        enabled
    }

    pub fn toggle_detection(&mut self) -> bool {
        let enabled = self.detector.toggle();
        tracing::info!("Detection {}", if enabled { "enabled" } else { "disabled" });
        enabled
    }

    pub fn tracker(&self) -> &TrackerState {
        &self.tracker
    }

    /// Release the source. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.release();
        }
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.release();
    }
}
