#[cfg(feature = "ffmpeg")]
mod decoder;
pub mod detector;
pub mod flow;
mod pipeline;
mod source;
pub mod tracker;

pub use pipeline::VideoPipeline;
#[cfg(feature = "ffmpeg")]
pub use decoder::VideoFile;
pub use source::{open_source, FrameSequence, VideoError, VideoSource};
pub use tracker::TrackerState;
