use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use image::RgbImage;
use retouch::compositing::{BlendMode, ChromaKeySession, GrabCutSession, SeamlessCloneSession};
use retouch::geometry::Roi;
use retouch::scan;
use retouch::stitch::{StitchOutcome, Stitcher};
use retouch::video::detector::{ModelFiles, ObjectDetector};
use retouch::video::VideoPipeline;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stitch two overlapping photos into a panorama
    Stitch {
        left: PathBuf,
        right: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Find a document in a photo and flatten it
    Scan {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Extract the foreground inside a rectangle, painting the rest white
    Cutout {
        input: PathBuf,
        /// Selection as x,y,width,height; negative extents are allowed
        #[arg(long, value_parser = parse_roi, allow_hyphen_values = true)]
        rect: Roi,
        /// Graph-cut iterations (1-10)
        #[arg(long, default_value_t = 5)]
        iterations: u32,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Blend a source image into a target around a center point
    Clone {
        source: PathBuf,
        target: PathBuf,
        /// Center in target pixels as x,y
        #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
        center: (i32, i32),
        #[arg(long, value_enum, default_value_t = Mode::Normal)]
        mode: Mode,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Replace the key color of a foreground with a background
    Chromakey {
        foreground: PathBuf,
        background: PathBuf,
        /// Hue tolerance around the sampled key color (1-50)
        #[arg(long, default_value_t = 20)]
        offset: i32,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Play a video with optional tracking and detection
    Track {
        /// Video file, or a directory of still frames played in file name order
        input: PathBuf,

        /// Enable optical-flow motion trails
        #[arg(long)]
        track: bool,

        /// Enable object detection
        #[arg(long)]
        detect: bool,

        /// Directory holding yolov3-tiny.onnx, yolov3-tiny.toml and coco.names
        #[arg(long, default_value = "models")]
        models: PathBuf,

        /// Target frames per second
        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Write processed frames here as PNG
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Normal,
    Mixed,
}

impl From<Mode> for BlendMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => BlendMode::Normal,
            Mode::Mixed => BlendMode::Mixed,
        }
    }
}

fn parse_numbers(s: &str, count: usize) -> Result<Vec<i32>, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<i32>().map_err(|e| format!("{}: {}", v, e)))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != count {
        return Err(format!("expected {} comma-separated integers", count));
    }
    Ok(values)
}

fn parse_roi(s: &str) -> Result<Roi, String> {
    let v = parse_numbers(s, 4)?;
    Ok(Roi::new(v[0], v[1], v[2], v[3]))
}

fn parse_point(s: &str) -> Result<(i32, i32), String> {
    let v = parse_numbers(s, 2)?;
    Ok((v[0], v[1]))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match args.command {
        Command::Stitch {
            left,
            right,
            output,
        } => {
            let left = load(&left)?;
            let right = load(&right)?;
            let outcome = Stitcher::new().stitch(&left, &right);
            match &outcome {
                StitchOutcome::Stitched(_) => {}
                StitchOutcome::InsufficientMatches { matches, .. } => {
                    tracing::warn!("Not enough matches ({}), writing the left image", matches)
                }
                StitchOutcome::Failed { reason, .. } => {
                    tracing::warn!("Stitch failed ({}), writing the left image", reason)
                }
            }
            save(&outcome.into_image(), &output)
        }

        Command::Scan { input, output } => {
            let image = load(&input)?;
            save(&scan::scan(&image), &output)
        }

        Command::Cutout {
            input,
            rect,
            iterations,
            output,
        } => {
            let mut session = GrabCutSession::new();
            session.set_image(load(&input)?);
            session.set_rect(rect);
            let result = session
                .apply(iterations)
                .context("Foreground extraction produced no result")?;
            save(&result, &output)
        }

        Command::Clone {
            source,
            target,
            center,
            mode,
            output,
        } => {
            let mut session = SeamlessCloneSession::new();
            session.set_source(load(&source)?);
            session.set_target(load(&target)?);
            session.set_center(center.0, center.1);
            session.set_mode(mode.into());
            let result = session.apply().context("Seamless clone produced no result")?;
            save(&result, &output)
        }

        Command::Chromakey {
            foreground,
            background,
            offset,
            output,
        } => {
            let mut session = ChromaKeySession::new();
            session.set_foreground(load(&foreground)?);
            session.set_background(load(&background)?);
            session.set_offset(offset);
            let result = session.apply().context("Chroma key produced no result")?;
            save(&result, &output)
        }

        Command::Track {
            input,
            track,
            detect,
            models,
            fps,
            output_dir,
        } => {
            let detector = if detect {
                ObjectDetector::load(&ModelFiles::in_dir(&models))
            } else {
                ObjectDetector::unavailable()
            };

            let mut pipeline = VideoPipeline::new(detector);
            pipeline
                .load_path(&input)
                .with_context(|| format!("Failed to open {}", input.display()))?;
            if track {
                pipeline.toggle_tracking();
            }
            if detect {
                pipeline.toggle_detection();
            }
            if let Some(dir) = &output_dir {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }

            let result = run_pipeline(&mut pipeline, fps, output_dir.as_deref());
            pipeline.release();
            result
        }
    }
}

fn load(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(image.to_rgb8())
}

fn save(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("Wrote {}x{} image to {}", image.width(), image.height(), path.display());
    Ok(())
}

fn run_pipeline(pipeline: &mut VideoPipeline, target_fps: u32, output_dir: Option<&Path>) -> Result<()> {
    let frame_duration = Duration::from_secs_f32(1.0 / target_fps.max(1) as f32);
    let mut frame_count = 0u64;
    let mut total_process_time = Duration::ZERO;
    let mut total_output_time = Duration::ZERO;

    tracing::info!("Starting playback of {} frames", pipeline.frame_count());

    for index in 0..pipeline.frame_count() {
        let loop_start = Instant::now();

        let process_start = Instant::now();
        let Some(frame) = pipeline.frame(index) else {
            tracing::warn!("Stopping at unreadable frame {}", index);
            break;
        };
        total_process_time += process_start.elapsed();

        let output_start = Instant::now();
        if let Some(dir) = output_dir {
            let path = dir.join(format!("frame_{:06}.png", index));
            frame
                .save(&path)
                .with_context(|| format!("Failed to write frame {}", path.display()))?;
        }
        total_output_time += output_start.elapsed();

        frame_count += 1;

        // Log stats every 30 frames
        if frame_count % 30 == 0 {
            let avg_process_ms = total_process_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let avg_output_ms = total_output_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let total_ms = avg_process_ms + avg_output_ms;
            let actual_fps = 1000.0 / total_ms;
            tracing::info!(
                "Frame {}: process={:.1}ms, output={:.1}ms, total={:.1}ms, fps={:.1}, points={}",
                frame_count,
                avg_process_ms,
                avg_output_ms,
                total_ms,
                actual_fps,
                pipeline.tracker().points().len()
            );
        }

        // Frame rate limiting
        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    tracing::info!("Played {} frames", frame_count);
    Ok(())
}
