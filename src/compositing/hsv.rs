use image::Rgb;

/// RGB to 8-bit HSV: hue in `[0, 180)`, saturation and value in `[0, 255]`
pub fn rgb_to_hsv(pixel: Rgb<u8>) -> [u8; 3] {
    let [r, g, b] = pixel.0.map(|c| c as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { 255.0 * delta / max } else { 0.0 };

    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }

    // 360 rounds back onto 0
    let hue = ((hue / 2.0).round() as u32 % 180) as u8;
    [hue, saturation.round() as u8, max as u8]
}
