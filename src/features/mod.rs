mod matcher;
mod orb;

pub use matcher::{hamming_distance, match_descriptors, passes_ratio_test, Match, RATIO_THRESHOLD};
pub use orb::{detect_and_compute, OrbConfig};

/// 256-bit binary descriptor
pub type Descriptor = [u8; 32];

/// A salient image location in level-0 pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the keypoint was found on
    pub octave: u32,
    /// Scale of that level relative to the input image
    pub scale: f32,
    /// Dominant orientation in radians
    pub angle: f32,
    pub response: f32,
}
