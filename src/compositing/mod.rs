//! Interactive foreground extraction and compositing.

mod chromakey;
mod gmm;
mod grabcut;
mod hsv;
mod maxflow;
mod seamless;

pub use chromakey::{chroma_key, key_mask, ChromaKeySession, HueRange, DEFAULT_OFFSET};
pub use grabcut::{cutout, grab_cut, GrabCutSession, GrabLabel, MAX_ITERATIONS, MIN_ITERATIONS};
pub use hsv::rgb_to_hsv;
pub use maxflow::FlowGraph;
pub use seamless::{scale_source, seamless_clone, BlendError, BlendMode, SeamlessCloneSession};
