// Dominant-color analysis
//
// Provider image-properties give dominant colors with pixel fractions; this
// module names them against a fixed palette and measures diversity as
// normalized entropy over the fraction distribution.

use crate::core::types::DominantColor;
use crate::vision::types::RawDominantColor;

/// Fixed naming palette. Nearest neighbor by squared RGB distance.
const PALETTE: &[(&str, u8, u8, u8)] = &[
    ("black", 0, 0, 0),
    ("white", 255, 255, 255),
    ("gray", 128, 128, 128),
    ("silver", 192, 192, 192),
    ("red", 200, 30, 30),
    ("dark red", 120, 10, 10),
    ("orange", 240, 140, 30),
    ("brown", 130, 90, 40),
    ("tan", 200, 170, 120),
    ("yellow", 240, 220, 50),
    ("olive", 120, 120, 40),
    ("green", 60, 160, 60),
    ("dark green", 20, 90, 30),
    ("light green", 140, 210, 130),
    ("teal", 30, 140, 140),
    ("cyan", 80, 200, 220),
    ("sky blue", 130, 190, 240),
    ("blue", 50, 90, 200),
    ("navy", 20, 30, 90),
    ("purple", 130, 60, 170),
    ("pink", 240, 150, 190),
];

pub fn nearest_color_name(r: u8, g: u8, b: u8) -> &'static str {
    PALETTE
        .iter()
        .min_by_key(|(_, pr, pg, pb)| {
            let dr = r as i32 - *pr as i32;
            let dg = g as i32 - *pg as i32;
            let db = b as i32 - *pb as i32;
            dr * dr + dg * dg + db * db
        })
        .map(|(name, _, _, _)| *name)
        .unwrap_or("unknown")
}

pub fn to_hex(r: u8, g: u8, b: u8) -> String {
    format!("#{r:02x}{g:02x}{b:02x}")
}

/// Convert raw dominant colors into the artifact form, ordered by pixel
/// fraction descending. Fractions are rescaled into percentages of the
/// reported total so they sum to 100 even when the provider's fractions
/// cover only part of the frame.
pub fn dominant_colors(raw: &[RawDominantColor]) -> Vec<DominantColor> {
    let total: f32 = raw.iter().map(|c| c.pixel_fraction).sum();
    if total <= 0.0 {
        return vec![];
    }
    let mut colors: Vec<DominantColor> = raw
        .iter()
        .map(|c| DominantColor {
            red: c.red,
            green: c.green,
            blue: c.blue,
            hex: to_hex(c.red, c.green, c.blue),
            name: nearest_color_name(c.red, c.green, c.blue).to_string(),
            pct: c.pixel_fraction / total * 100.0,
        })
        .collect();
    colors.sort_by(|a, b| b.pct.partial_cmp(&a.pct).unwrap_or(std::cmp::Ordering::Equal));
    colors
}

/// Diversity = 100 * entropy(pcts) / log2(k). One dominant color scores 0;
/// a perfectly even split scores 100.
pub fn diversity_score(colors: &[DominantColor]) -> f32 {
    let k = colors.len();
    if k < 2 {
        return 0.0;
    }
    let total: f32 = colors.iter().map(|c| c.pct).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let entropy: f32 = colors
        .iter()
        .filter_map(|c| {
            let p = c.pct / total;
            (p > 0.0).then(|| -p * p.log2())
        })
        .sum();
    (100.0 * entropy / (k as f32).log2()).clamp(0.0, 100.0)
}

/// Share of dominant-color mass that reads as healthy green: channels with
/// G dominant and at least moderately bright.
pub fn green_ratio(raw: &[RawDominantColor]) -> f32 {
    let total: f32 = raw.iter().map(|c| c.pixel_fraction).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let green: f32 = raw
        .iter()
        .filter(|c| c.green > c.red && c.green > c.blue && c.green >= 80)
        .map(|c| c.pixel_fraction)
        .sum();
    green / total
}
