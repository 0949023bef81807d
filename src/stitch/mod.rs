mod homography;
mod panorama;

pub use homography::{
    estimate_homography, find_homography_ransac, GeometryError, Homography, RansacConfig,
};
pub use panorama::{compose_panorama, StitchOutcome, Stitcher, MIN_MATCHES};
