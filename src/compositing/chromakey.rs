use super::hsv::rgb_to_hsv;
use crate::geometry::{centered_offset, fit_scale, scaled_size};
use image::{imageops, GrayImage, Luma, RgbImage};

pub const MIN_OFFSET: i32 = 1;
pub const MAX_OFFSET: i32 = 50;
pub const DEFAULT_OFFSET: i32 = 20;

/// Side of the top-left patch the key color is sampled from
pub const REFERENCE_PATCH: u32 = 10;

/// Saturation and value floor for keyed pixels
const MIN_SATURATION: u8 = 50;
const MIN_VALUE: u8 = 50;

/// Inclusive hue band sampled from the reference patch, widened by
/// `offset` on both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HueRange {
    pub lower: i32,
    pub upper: i32,
}

impl HueRange {
    pub fn from_reference(foreground: &RgbImage, offset: i32) -> Option<Self> {
        let (w, h) = foreground.dimensions();
        let (pw, ph) = (w.min(REFERENCE_PATCH), h.min(REFERENCE_PATCH));
        let hues = (0..ph)
            .flat_map(|y| (0..pw).map(move |x| (x, y)))
            .map(|(x, y)| rgb_to_hsv(*foreground.get_pixel(x, y))[0] as i32);

        let (min, max) = hues.fold(None, |acc: Option<(i32, i32)>, h| match acc {
            None => Some((h, h)),
            Some((lo, hi)) => Some((lo.min(h), hi.max(h))),
        })?;
        Some(Self {
            lower: min - offset,
            upper: max + offset,
        })
    }

    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        let h = hsv[0] as i32;
        h >= self.lower && h <= self.upper && hsv[1] >= MIN_SATURATION && hsv[2] >= MIN_VALUE
    }
}

/// 255 where the pixel matches the key, 0 elsewhere
pub fn key_mask(foreground: &RgbImage, range: HueRange) -> GrayImage {
    GrayImage::from_fn(foreground.width(), foreground.height(), |x, y| {
        if range.contains(rgb_to_hsv(*foreground.get_pixel(x, y))) {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Scale `foreground` to fit `background`, center it, and show the
/// background through every pixel matching the key color
pub fn chroma_key(foreground: &RgbImage, background: &RgbImage, offset: i32) -> RgbImage {
    let _span = tracing::debug_span!("chroma_key").entered();

    let scale = fit_scale(foreground.dimensions(), background.dimensions());
    let (nw, nh) = scaled_size(foreground.dimensions(), scale);
    let mut result = background.clone();
    if nw == 0 || nh == 0 {
        return result;
    }

    let fg = imageops::resize(foreground, nw, nh, imageops::FilterType::Triangle);
    let Some(range) = HueRange::from_reference(&fg, offset) else {
        return result;
    };
    tracing::debug!("Key hue range {}..={}", range.lower, range.upper);

    let mask = key_mask(&fg, range);
    let (ox, oy) = centered_offset((nw, nh), background.dimensions());
    for (x, y, pixel) in fg.enumerate_pixels() {
        if mask.get_pixel(x, y)[0] == 0 {
            result.put_pixel(ox + x, oy + y, *pixel);
        }
    }
    result
}

/// Chroma-key compositing with a foreground, a background and an
/// adjustable hue tolerance
#[derive(Debug, Clone)]
pub struct ChromaKeySession {
    foreground: Option<RgbImage>,
    background: Option<RgbImage>,
    offset: i32,
}

impl Default for ChromaKeySession {
    fn default() -> Self {
        Self {
            foreground: None,
            background: None,
            offset: DEFAULT_OFFSET,
        }
    }
}

impl ChromaKeySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_foreground(&mut self, image: RgbImage) {
        self.foreground = Some(image);
    }

    pub fn set_background(&mut self, image: RgbImage) {
        self.background = Some(image);
    }

    /// Hue tolerance, clamped to 1..=50
    pub fn set_offset(&mut self, offset: i32) {
        self.offset = offset.clamp(MIN_OFFSET, MAX_OFFSET);
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn apply(&self) -> Option<RgbImage> {
        let foreground = self.foreground.as_ref()?;
        let background = self.background.as_ref()?;
        Some(chroma_key(foreground, background, self.offset))
    }
}
