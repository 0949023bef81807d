use super::flow::{calc_optical_flow_pyr_lk, good_features_to_track, FlowConfig, SeedConfig};
use crate::geometry::Point2;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Number of distinct trail colors; equals the seeding cap
pub const PALETTE_SIZE: usize = 200;

const PALETTE_SEED: u64 = 0x7ac4_e125;
const MARKER_RADIUS: i32 = 5;

/// A corner being followed, with the color it was given when seeded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedPoint {
    pub position: Point2,
    pub color_index: usize,
}

/// Live tracking data carried from one frame to the next
#[derive(Debug, Clone)]
pub struct TrackSession {
    prev_gray: GrayImage,
    points: Vec<TrackedPoint>,
    trail: RgbImage,
}

impl TrackSession {
    pub fn points(&self) -> &[TrackedPoint] {
        &self.points
    }

    pub fn trail(&self) -> &RgbImage {
        &self.trail
    }
}

/// Motion-trail tracker as an explicit state value.
///
/// `Seeding` is the enabled state before any points exist; a `Tracking`
/// state whose point set ran empty reseeds on the next frame.
#[derive(Debug, Clone, Default)]
pub enum TrackerState {
    #[default]
    Disabled,
    Seeding,
    Tracking(Box<TrackSession>),
}

impl TrackerState {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TrackerState::Disabled)
    }

    /// Flip between disabled and enabled. Disabling drops the previous
    /// frame, the points and the trail.
    pub fn toggle(self) -> Self {
        if self.is_enabled() {
            TrackerState::Disabled
        } else {
            TrackerState::Seeding
        }
    }

    pub fn points(&self) -> &[TrackedPoint] {
        match self {
            TrackerState::Tracking(session) => session.points(),
            _ => &[],
        }
    }

    /// Consume one frame and return the next state and the frame to show
    pub fn advance(self, frame: &RgbImage) -> (TrackerState, RgbImage) {
        self.advance_with(frame, &SeedConfig::default(), &FlowConfig::default())
    }

    pub fn advance_with(
        self,
        frame: &RgbImage,
        seed: &SeedConfig,
        flow: &FlowConfig,
    ) -> (TrackerState, RgbImage) {
        let _span = tracing::debug_span!("track").entered();

        match self {
            TrackerState::Disabled => (TrackerState::Disabled, frame.clone()),
            TrackerState::Seeding => seed_session(frame, seed),
            TrackerState::Tracking(session)
                if session.points.is_empty()
                    || session.prev_gray.dimensions() != frame.dimensions() =>
            {
                seed_session(frame, seed)
            }
            TrackerState::Tracking(session) => track_session(*session, frame, flow),
        }
    }
}

fn to_gray(frame: &RgbImage) -> GrayImage {
    DynamicImage::ImageRgb8(frame.clone()).to_luma8()
}

fn seed_session(frame: &RgbImage, config: &SeedConfig) -> (TrackerState, RgbImage) {
    let gray = to_gray(frame);
    let corners = good_features_to_track(&gray, config);
    tracing::debug!("Tracker seeded with {} points", corners.len());

    let points = corners
        .into_iter()
        .take(PALETTE_SIZE)
        .enumerate()
        .map(|(color_index, position)| TrackedPoint {
            position,
            color_index,
        })
        .collect();

    let session = TrackSession {
        prev_gray: gray,
        points,
        trail: RgbImage::new(frame.width(), frame.height()),
    };
    (TrackerState::Tracking(Box::new(session)), frame.clone())
}

fn track_session(
    mut session: TrackSession,
    frame: &RgbImage,
    config: &FlowConfig,
) -> (TrackerState, RgbImage) {
    let gray = to_gray(frame);
    let positions: Vec<Point2> = session.points.iter().map(|p| p.position).collect();
    let tracked = calc_optical_flow_pyr_lk(&session.prev_gray, &gray, &positions, config);

    let palette = palette();
    let mut survivors = Vec::with_capacity(session.points.len());
    for (point, next) in session.points.iter().zip(tracked) {
        let Some(next) = next else { continue };
        let color = palette[point.color_index % PALETTE_SIZE];
        draw_thick_line(&mut session.trail, point.position, next, color);
        draw_filled_circle_mut(
            &mut session.trail,
            (next.x as i32, next.y as i32),
            MARKER_RADIUS,
            color,
        );
        survivors.push(TrackedPoint {
            position: next,
            color_index: point.color_index,
        });
    }

    if survivors.len() < session.points.len() {
        tracing::debug!(
            "Lost {} of {} points",
            session.points.len() - survivors.len(),
            session.points.len()
        );
    }

    let output = saturating_add(frame, &session.trail);
    session.prev_gray = gray;
    session.points = survivors;
    (TrackerState::Tracking(Box::new(session)), output)
}

/// Two pixel wide segment, truncating endpoints to whole pixels
fn draw_thick_line(canvas: &mut RgbImage, from: Point2, to: Point2, color: Rgb<u8>) {
    let start = (from.x.trunc(), from.y.trunc());
    let end = (to.x.trunc(), to.y.trunc());
    draw_line_segment_mut(canvas, start, end, color);

    let (ox, oy) = if (end.0 - start.0).abs() >= (end.1 - start.1).abs() {
        (0.0, 1.0)
    } else {
        (1.0, 0.0)
    };
    draw_line_segment_mut(
        canvas,
        (start.0 + ox, start.1 + oy),
        (end.0 + ox, end.1 + oy),
        color,
    );
}

/// Per-channel saturating sum of two equally sized images
pub fn saturating_add(a: &RgbImage, b: &RgbImage) -> RgbImage {
    let mut out = a.clone();
    for (dst, src) in out.pixels_mut().zip(b.pixels()) {
        for c in 0..3 {
            dst[c] = dst[c].saturating_add(src[c]);
        }
    }
    out
}

/// Deterministic trail colors indexed by seed order
pub fn palette() -> Vec<Rgb<u8>> {
    let mut rng = ChaCha8Rng::seed_from_u64(PALETTE_SEED);
    (0..PALETTE_SIZE)
        .map(|_| Rgb([rng.gen_range(0..255), rng.gen_range(0..255), rng.gen_range(0..255)]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_at(x0: u32, y0: u32) -> RgbImage {
        RgbImage::from_fn(120, 120, |x, y| {
            if (x0..x0 + 30).contains(&x) && (y0..y0 + 30).contains(&y) {
                Rgb([220, 220, 220])
            } else {
                Rgb([20, 20, 20])
            }
        })
    }

    #[test]
    fn test_disabled_passes_frame_through() {
        let frame = square_at(40, 40);
        let (state, out) = TrackerState::Disabled.advance(&frame);
        assert!(!state.is_enabled());
        assert_eq!(out, frame);
    }

    #[test]
    fn test_zero_corners_gives_empty_set() {
        let flat = RgbImage::from_pixel(64, 64, Rgb([90, 90, 90]));
        let (state, out) = TrackerState::Seeding.advance(&flat);
        assert!(state.points().is_empty());
        assert_eq!(out, flat);

        // Still empty on the next frame, and no failure
        let (state, _) = state.advance(&flat);
        assert!(matches!(state, TrackerState::Tracking(_)));
        assert!(state.points().is_empty());
    }

    #[test]
    fn test_reseeds_only_when_empty() {
        let first = square_at(40, 40);
        let (state, _) = TrackerState::Seeding.advance(&first);
        let seeded = state.points().len();
        assert!(seeded >= 4);

        // A small motion keeps the existing points and their colors
        let second = square_at(42, 41);
        let (state, out) = state.advance(&second);
        assert!(!state.points().is_empty());
        assert!(state.points().len() <= seeded);
        assert!(state.points().iter().all(|p| p.color_index < seeded));
        assert_ne!(out, second);

        // An emptied set is reseeded from the current frame with a fresh trail
        let emptied = match state {
            TrackerState::Tracking(mut session) => {
                session.points.clear();
                TrackerState::Tracking(session)
            }
            other => other,
        };
        let (state, out) = emptied.advance(&second);
        assert_eq!(state.points().len(), seeded);
        assert_eq!(out, second);
        if let TrackerState::Tracking(session) = &state {
            assert!(session.trail().pixels().all(|p| p.0 == [0, 0, 0]));
        }
    }

    #[test]
    fn test_toggle_discards_state() {
        let (state, _) = TrackerState::Seeding.advance(&square_at(40, 40));
        let state = state.toggle();
        assert!(matches!(state, TrackerState::Disabled));
        assert!(matches!(state.toggle(), TrackerState::Seeding));
    }

    #[test]
    fn test_saturating_add_clamps() {
        let a = RgbImage::from_pixel(2, 2, Rgb([200, 10, 0]));
        let b = RgbImage::from_pixel(2, 2, Rgb([100, 10, 0]));
        assert_eq!(*saturating_add(&a, &b).get_pixel(1, 1), Rgb([255, 20, 0]));
    }

    #[test]
    fn test_palette_is_deterministic() {
        assert_eq!(palette(), palette());
        assert_eq!(palette().len(), PALETTE_SIZE);
    }
}
