//! Video files decoded through FFmpeg.

use super::source::{VideoError, VideoSource};
use anyhow::{Context, Result};
use image::RgbImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use ffmpeg::format;
use ffmpeg::media;
use ffmpeg::software::scaling::{context::Context as ScalingContext, flag::Flags as ScalingFlags};
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::util::frame;

/// Container plus decoder state for one pass through the file
struct Decoding {
    input: format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: ScalingContext,
    pending: VecDeque<RgbImage>,
    flushed: bool,
}

impl Decoding {
    fn open(path: &Path) -> Result<Self> {
        let input = format::input(&path).map_err(|e| open_failed(path, e))?;
        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| VideoError::NoVideoStream(path.to_path_buf()))?;
        let stream_index = stream.index();

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(|e| VideoError::Decode(e.to_string()))?;

        let scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ScalingFlags::BILINEAR,
        )
        .map_err(|e| VideoError::Decode(e.to_string()))?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            pending: VecDeque::new(),
            flushed: false,
        })
    }

    /// Next frame in presentation order, `None` at the end of the stream
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        if self.flushed {
            return Ok(None);
        }

        let mut decoded = frame::Video::empty();
        let Decoding {
            input,
            stream_index,
            decoder,
            scaler,
            pending,
            flushed,
        } = self;

        for (stream, packet) in input.packets() {
            if stream.index() != *stream_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .map_err(|e| VideoError::Decode(e.to_string()))?;
            while decoder.receive_frame(&mut decoded).is_ok() {
                pending.push_back(to_rgb(scaler, &decoded)?);
            }
            if let Some(frame) = pending.pop_front() {
                return Ok(Some(frame));
            }
        }

        decoder
            .send_eof()
            .map_err(|e| VideoError::Decode(e.to_string()))?;
        *flushed = true;
        while decoder.receive_frame(&mut decoded).is_ok() {
            pending.push_back(to_rgb(scaler, &decoded)?);
        }
        Ok(pending.pop_front())
    }
}

fn to_rgb(scaler: &mut ScalingContext, decoded: &frame::Video) -> Result<RgbImage> {
    let mut rgb = frame::Video::empty();
    scaler
        .run(decoded, &mut rgb)
        .map_err(|e| VideoError::Decode(e.to_string()))?;

    let (width, height) = (rgb.width(), rgb.height());
    let stride = rgb.stride(0);
    let row = width as usize * 3;
    let mut pixels = Vec::with_capacity(row * height as usize);
    for line in rgb.data(0).chunks(stride).take(height as usize) {
        pixels.extend_from_slice(&line[..row]);
    }
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| VideoError::Decode("short RGB frame".to_string()).into())
}

fn open_failed(path: &Path, error: ffmpeg::Error) -> VideoError {
    VideoError::Open {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

/// Seekable video file.
///
/// Seeking forward decodes and drops the frames in between; seeking
/// backwards reopens the file and decodes from the start.
pub struct VideoFile {
    path: PathBuf,
    frame_count: usize,
    decoding: Option<Decoding>,
    /// Index of the frame the next `read_frame` returns
    position: usize,
}

impl VideoFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        validate_file(&path)?;
        ffmpeg::init().map_err(|e| open_failed(&path, e))?;

        let mut decoding = Decoding::open(&path)?;
        let reported = decoding
            .input
            .stream(decoding.stream_index)
            .map_or(0, |s| s.frames());
        let frame_count = if reported > 0 {
            reported as usize
        } else {
            // Container has no frame count; count packets and rewind
            let stream_index = decoding.stream_index;
            let counted = decoding
                .input
                .packets()
                .filter(|(stream, _)| stream.index() == stream_index)
                .count();
            decoding = Decoding::open(&path)?;
            counted
        };
        if frame_count == 0 {
            return Err(VideoError::Empty(path).into());
        }

        tracing::info!(
            "Opened {} ({}x{}, {} frames)",
            path.display(),
            decoding.decoder.width(),
            decoding.decoder.height(),
            frame_count
        );
        Ok(Self {
            path,
            frame_count,
            decoding: Some(decoding),
            position: 0,
        })
    }

    fn decoding(&mut self) -> Result<&mut Decoding> {
        self.decoding
            .as_mut()
            .ok_or_else(|| VideoError::Released.into())
    }
}

impl VideoSource for VideoFile {
    fn frame_count(&self) -> usize {
        if self.decoding.is_none() {
            return 0;
        }
        self.frame_count
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        self.decoding()?;
        if index >= self.frame_count {
            return Err(VideoError::SeekOutOfRange {
                index,
                count: self.frame_count,
            }
            .into());
        }

        if index < self.position {
            tracing::debug!("Rewinding {} to frame {}", self.path.display(), index);
            self.decoding = Some(Decoding::open(&self.path)?);
            self.position = 0;
        }
        while self.position < index {
            let skipped = self.decoding()?.next_frame()?;
            if skipped.is_none() {
                return Err(VideoError::SeekOutOfRange {
                    index,
                    count: self.position,
                }
                .into());
            }
            self.position += 1;
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let _span = tracing::debug_span!("decode", index = self.position).entered();
        let frame = self
            .decoding()?
            .next_frame()
            .with_context(|| format!("Failed to decode {}", self.path.display()))?;
        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if self.decoding.take().is_some() {
            tracing::info!("Released {}", self.path.display());
        }
        self.position = 0;
    }
}

fn validate_file(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to open video {}", path.display()))?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(VideoError::Empty(path.to_path_buf()).into());
    }
    Ok(())
}
