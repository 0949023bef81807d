use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Extensions picked up when a directory is opened as a frame sequence
const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("no frames found in {0}")]
    Empty(PathBuf),

    #[error("seek to frame {index} out of range (frame count {count})")]
    SeekOutOfRange { index: usize, count: usize },

    #[error("video source has been released")]
    Released,

    #[error("failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("no video stream in {0}")]
    NoVideoStream(PathBuf),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{0} is a video file; rebuild with the `ffmpeg` feature to play it")]
    Unsupported(PathBuf),
}

/// Open `path` as a frame source: a directory plays its still images, a
/// file is decoded as video
pub fn open_source<P: AsRef<Path>>(path: P) -> Result<Box<dyn VideoSource>> {
    let path = path.as_ref();
    if path.is_dir() {
        return Ok(Box::new(FrameSequence::open(path)?));
    }
    open_video_file(path)
}

#[cfg(feature = "ffmpeg")]
fn open_video_file(path: &Path) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(super::decoder::VideoFile::open(path)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video_file(path: &Path) -> Result<Box<dyn VideoSource>> {
    std::fs::metadata(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Err(VideoError::Unsupported(path.to_path_buf()).into())
}

/// Trait for seekable frame sources
pub trait VideoSource {
    /// Total number of frames
    fn frame_count(&self) -> usize;

    /// Position the source so the next `read_frame` returns frame `index`
    fn seek(&mut self, index: usize) -> Result<()>;

    /// Decode the frame at the current position and advance.
    ///
    /// Returns `Ok(None)` past the last frame.
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Drop any held resources. Safe to call more than once.
    fn release(&mut self);
}

enum Frames {
    Files(Vec<PathBuf>),
    Memory(Vec<RgbImage>),
}

/// Ordered sequence of still frames, either files in a directory or images
/// held in memory
pub struct FrameSequence {
    frames: Frames,
    position: usize,
    released: bool,
}

impl FrameSequence {
    /// Open every image file in `dir`, ordered by file name
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to list {}", dir.display()))?
                .path();
            let is_frame = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_frame {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(VideoError::Empty(dir.to_path_buf()).into());
        }

        tracing::info!("Opened {} frames from {}", files.len(), dir.display());
        Ok(Self {
            frames: Frames::Files(files),
            position: 0,
            released: false,
        })
    }

    pub fn from_frames(frames: Vec<RgbImage>) -> Self {
        Self {
            frames: Frames::Memory(frames),
            position: 0,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl VideoSource for FrameSequence {
    fn frame_count(&self) -> usize {
        if self.released {
            return 0;
        }
        match &self.frames {
            Frames::Files(files) => files.len(),
            Frames::Memory(frames) => frames.len(),
        }
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        if self.released {
            return Err(VideoError::Released.into());
        }
        let count = self.frame_count();
        if index >= count {
            return Err(VideoError::SeekOutOfRange { index, count }.into());
        }
        self.position = index;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.released {
            return Err(VideoError::Released.into());
        }

        let frame = match &self.frames {
            Frames::Files(files) => match files.get(self.position) {
                Some(path) => {
                    let _span = tracing::debug_span!("decode").entered();
                    let img = image::open(path)
                        .with_context(|| format!("Failed to decode frame {}", path.display()))?;
                    Some(img.to_rgb8())
                }
                None => None,
            },
            Frames::Memory(frames) => frames.get(self.position).cloned(),
        };

        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        tracing::info!("Releasing frame sequence");
        self.frames = Frames::Memory(Vec::new());
        self.position = 0;
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(v: u8) -> RgbImage {
        RgbImage::from_pixel(4, 3, Rgb([v, v, v]))
    }

    #[test]
    fn test_read_advances_and_ends() {
        let mut seq = FrameSequence::from_frames(vec![solid(1), solid(2)]);
        assert_eq!(seq.frame_count(), 2);
        assert_eq!(seq.read_frame().unwrap().unwrap(), solid(1));
        assert_eq!(seq.read_frame().unwrap().unwrap(), solid(2));
        assert!(seq.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_seek_bounds() {
        let mut seq = FrameSequence::from_frames(vec![solid(1), solid(2), solid(3)]);
        seq.seek(2).unwrap();
        assert_eq!(seq.read_frame().unwrap().unwrap(), solid(3));
        assert!(seq.seek(3).is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut seq = FrameSequence::from_frames(vec![solid(1)]);
        seq.release();
        seq.release();
        assert!(seq.is_released());
        assert_eq!(seq.frame_count(), 0);
        assert!(seq.read_frame().is_err());
    }

    #[test]
    fn test_open_directory_orders_by_name() {
        let dir = std::env::temp_dir().join(format!("retouch-frames-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        solid(20).save(dir.join("b.png")).unwrap();
        solid(10).save(dir.join("a.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "skip me").unwrap();

        let mut seq = FrameSequence::open(&dir).unwrap();
        assert_eq!(seq.frame_count(), 2);
        assert_eq!(seq.read_frame().unwrap().unwrap(), solid(10));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_open_source_plays_directories() {
        let dir = std::env::temp_dir().join(format!("retouch-source-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        solid(5).save(dir.join("0001.png")).unwrap();

        let source = open_source(&dir).unwrap();
        assert_eq!(source.frame_count(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
        assert!(open_source(&dir).is_err());
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_video_file_needs_decoder_feature() {
        let path = std::env::temp_dir().join(format!("retouch-clip-{}.mp4", std::process::id()));
        std::fs::write(&path, b"not decoded").unwrap();
        let err = open_source(&path).err().unwrap();
        std::fs::remove_file(&path).ok();
        assert!(matches!(
            err.downcast_ref::<VideoError>(),
            Some(VideoError::Unsupported(_))
        ));
    }

    #[test]
    fn test_open_missing_directory_fails() {
        assert!(FrameSequence::open("/nonexistent/retouch/frames").is_err());
    }
}
