use super::gmm::{kmeans, Color, Gmm, COMPONENTS};
use super::maxflow::FlowGraph;
use crate::geometry::Roi;
use image::{Rgb, RgbImage};

/// Smoothness weight between neighbouring pixels
const GAMMA: f64 = 50.0;

/// Terminal weight that pins user-fixed pixels to their side
const LAMBDA: f64 = 9.0 * GAMMA;

pub const MIN_ITERATIONS: u32 = 1;
pub const MAX_ITERATIONS: u32 = 10;

const KMEANS_SEED: u64 = 0x6c0_ffee;

/// Per-pixel segmentation label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabLabel {
    Background,
    Foreground,
    ProbableBackground,
    ProbableForeground,
}

impl GrabLabel {
    pub fn is_foreground(self) -> bool {
        matches!(self, GrabLabel::Foreground | GrabLabel::ProbableForeground)
    }

    fn is_fixed(self) -> bool {
        matches!(self, GrabLabel::Foreground | GrabLabel::Background)
    }
}

/// Edge weights to the left, up-left, up and up-right neighbours
struct Smoothness {
    left: Vec<f64>,
    up_left: Vec<f64>,
    up: Vec<f64>,
    up_right: Vec<f64>,
}

fn color_at(image: &RgbImage, x: u32, y: u32) -> Color {
    let p = image.get_pixel(x, y);
    Color::new(p[0] as f64, p[1] as f64, p[2] as f64)
}

fn neighbour_offsets() -> [(i64, i64, f64); 4] {
    let diag = GAMMA / std::f64::consts::SQRT_2;
    [(-1, 0, GAMMA), (-1, -1, diag), (0, -1, GAMMA), (1, -1, diag)]
}

fn smoothness(image: &RgbImage) -> Smoothness {
    let (w, h) = image.dimensions();
    let (w, h) = (w as i64, h as i64);

    // beta = 1 / (2 * mean squared color difference over neighbour pairs)
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for y in 0..h {
        for x in 0..w {
            let c = color_at(image, x as u32, y as u32);
            for (dx, dy, _) in neighbour_offsets() {
                let (nx, ny) = (x + dx, y + dy);
                if nx >= 0 && ny >= 0 && nx < w {
                    sum += (c - color_at(image, nx as u32, ny as u32)).norm_squared();
                    pairs += 1;
                }
            }
        }
    }
    let beta = if sum <= f64::EPSILON {
        0.0
    } else {
        1.0 / (2.0 * sum / pairs as f64)
    };

    let n = (w * h) as usize;
    let mut weights = [vec![0.0; n], vec![0.0; n], vec![0.0; n], vec![0.0; n]];
    for y in 0..h {
        for x in 0..w {
            let c = color_at(image, x as u32, y as u32);
            let i = (y * w + x) as usize;
            for (slot, (dx, dy, g)) in neighbour_offsets().into_iter().enumerate() {
                let (nx, ny) = (x + dx, y + dy);
                if nx >= 0 && ny >= 0 && nx < w {
                    let d2 = (c - color_at(image, nx as u32, ny as u32)).norm_squared();
                    weights[slot][i] = g * (-beta * d2).exp();
                }
            }
        }
    }

    let [left, up_left, up, up_right] = weights;
    Smoothness {
        left,
        up_left,
        up,
        up_right,
    }
}

/// Learn background and foreground mixtures from the current labels
fn learn_models(
    colors: &[Color],
    labels: &[GrabLabel],
    previous: Option<(&Gmm, &Gmm)>,
) -> (Gmm, Gmm) {
    let mut bg_samples = Vec::new();
    let mut fg_samples = Vec::new();
    for (c, l) in colors.iter().zip(labels) {
        if l.is_foreground() {
            fg_samples.push(*c);
        } else {
            bg_samples.push(*c);
        }
    }

    let assign = |samples: &[Color], model: Option<&Gmm>, seed: u64| match model {
        Some(gmm) => samples
            .iter()
            .map(|c| gmm.most_likely_component(c))
            .collect::<Vec<_>>(),
        None => kmeans(samples, COMPONENTS, seed),
    };

    let bg_assignment = assign(&bg_samples, previous.map(|p| p.0), KMEANS_SEED);
    let fg_assignment = assign(&fg_samples, previous.map(|p| p.1), KMEANS_SEED + 1);
    (
        Gmm::fit(&bg_samples, &bg_assignment),
        Gmm::fit(&fg_samples, &fg_assignment),
    )
}

fn neg_log(p: f64) -> f64 {
    -(p.max(1e-300)).ln()
}

fn cut(
    colors: &[Color],
    labels: &mut [GrabLabel],
    width: usize,
    bg: &Gmm,
    fg: &Gmm,
    smooth: &Smoothness,
) {
    let n = colors.len();
    let mut graph = FlowGraph::new(n);

    for i in 0..n {
        let (from_source, to_sink) = match labels[i] {
            GrabLabel::Background => (0.0, LAMBDA),
            GrabLabel::Foreground => (LAMBDA, 0.0),
            _ => (neg_log(bg.probability(&colors[i])), neg_log(fg.probability(&colors[i]))),
        };
        graph.add_terminal_weights(i, from_source, to_sink);

        let (x, y) = (i % width, i / width);
        if x > 0 {
            graph.add_edge(i, i - 1, smooth.left[i], smooth.left[i]);
            if y > 0 {
                graph.add_edge(i, i - width - 1, smooth.up_left[i], smooth.up_left[i]);
            }
        }
        if y > 0 {
            graph.add_edge(i, i - width, smooth.up[i], smooth.up[i]);
            if x + 1 < width {
                graph.add_edge(i, i - width + 1, smooth.up_right[i], smooth.up_right[i]);
            }
        }
    }

    let flow = graph.max_flow();
    tracing::debug!("Graph cut flow {:.1}", flow);

    for (i, label) in labels.iter_mut().enumerate() {
        if !label.is_fixed() {
            *label = if graph.in_source_segment(i) {
                GrabLabel::ProbableForeground
            } else {
                GrabLabel::ProbableBackground
            };
        }
    }
}

/// Iterated graph-cut segmentation seeded from a rectangle.
///
/// Pixels outside `rect` are fixed background; pixels inside start as
/// probable foreground. Returns `None` when the rectangle leaves no
/// background or no foreground samples.
pub fn grab_cut(image: &RgbImage, rect: Roi, iterations: u32) -> Option<Vec<GrabLabel>> {
    let _span = tracing::debug_span!("grab_cut").entered();

    let (w, h) = image.dimensions();
    let rect = rect.normalized().clamp_to(w, h);
    if rect.is_empty() {
        tracing::warn!("GrabCut rectangle is empty after clamping");
        return None;
    }

    let mut labels: Vec<GrabLabel> = (0..h as i32)
        .flat_map(|y| (0..w as i32).map(move |x| (x, y)))
        .map(|(x, y)| {
            if rect.contains(x, y) {
                GrabLabel::ProbableForeground
            } else {
                GrabLabel::Background
            }
        })
        .collect();

    let has_bg = labels.iter().any(|l| !l.is_foreground());
    let has_fg = labels.iter().any(|l| l.is_foreground());
    if !has_bg || !has_fg {
        tracing::warn!("GrabCut needs both background and foreground samples");
        return None;
    }

    let colors: Vec<Color> = image
        .pixels()
        .map(|p| Color::new(p[0] as f64, p[1] as f64, p[2] as f64))
        .collect();
    let smooth = smoothness(image);

    let iterations = iterations.clamp(MIN_ITERATIONS, MAX_ITERATIONS);
    let mut models: Option<(Gmm, Gmm)> = None;
    for _ in 0..iterations {
        let (bg, fg) = learn_models(&colors, &labels, models.as_ref().map(|(b, f)| (b, f)));
        cut(&colors, &mut labels, w as usize, &bg, &fg, &smooth);
        models = Some((bg, fg));
    }

    Some(labels)
}

/// Copy of `image` with every non-foreground pixel painted white
pub fn cutout(image: &RgbImage, labels: &[GrabLabel]) -> RgbImage {
    let mut out = image.clone();
    for (pixel, label) in out.pixels_mut().zip(labels) {
        if !label.is_foreground() {
            *pixel = Rgb([255, 255, 255]);
        }
    }
    out
}

/// Interactive foreground extraction: an image, a rectangle, and the
/// latest mask and result
#[derive(Debug, Clone, Default)]
pub struct GrabCutSession {
    image: Option<RgbImage>,
    rect: Option<Roi>,
    mask: Option<Vec<GrabLabel>>,
    result: Option<RgbImage>,
}

impl GrabCutSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a new image; clears any previous selection and result
    pub fn set_image(&mut self, image: RgbImage) {
        self.reset();
        self.image = Some(image);
    }

    /// Selection rectangle, possibly with negative extents from a drag
    pub fn set_rect(&mut self, rect: Roi) {
        self.rect = Some(rect);
    }

    pub fn rect(&self) -> Option<Roi> {
        self.rect
    }

    pub fn mask(&self) -> Option<&[GrabLabel]> {
        self.mask.as_deref()
    }

    pub fn result(&self) -> Option<&RgbImage> {
        self.result.as_ref()
    }

    /// The unmodified source image
    pub fn image(&self) -> Option<&RgbImage> {
        self.image.as_ref()
    }

    /// What a viewer should show: the latest cutout, else the source
    pub fn display(&self) -> Option<&RgbImage> {
        self.result.as_ref().or(self.image.as_ref())
    }

    /// Segment with a fresh mask and return the cutout
    pub fn apply(&mut self, iterations: u32) -> Option<RgbImage> {
        let image = self.image.as_ref()?;
        let rect = self.rect?;

        let labels = grab_cut(image, rect, iterations)?;
        let result = cutout(image, &labels);
        tracing::info!(
            "Foreground extracted: {} of {} pixels",
            labels.iter().filter(|l| l.is_foreground()).count(),
            labels.len()
        );
        self.mask = Some(labels);
        self.result = Some(result.clone());
        Some(result)
    }

    /// Clear mask, rectangle and result and hand back the unmodified
    /// source, which stays loaded
    pub fn reset(&mut self) -> Option<&RgbImage> {
        self.rect = None;
        self.mask = None;
        self.result = None;
        self.image.as_ref()
    }
}
