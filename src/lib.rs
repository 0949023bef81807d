//! Vision core of a raster image and video editor: panorama stitching,
//! document scanning, motion tracking with object detection, and
//! interactive compositing.

pub mod compositing;
pub mod features;
pub mod geometry;
pub mod scan;
pub mod stitch;
pub mod video;
