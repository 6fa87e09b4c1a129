// Content addressing and parameter fingerprints
//
// Identity of stored pixels is the MD5 of the raw upload bytes (32-hex,
// lowercase). Visual similarity uses a 64-bit DCT signature compared by
// hamming distance. Cache fingerprints hash a canonical JSON rendering of
// the caller-visible parameters with xxh3.

use crate::core::errors::{ApiError, ApiResult};
use image::DynamicImage;
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

/// MD5 of the raw bytes, rendered as 32 lowercase hex chars.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// 64-bit perceptual signature rendered as 16 lowercase hex chars.
///
/// Pipeline: grayscale, resize to 32x32, 2D DCT-II, keep the low-frequency
/// 8x8 block, threshold each coefficient against the median of the non-DC
/// coefficients. Visually similar images land within a few bits of each
/// other.
pub fn perceptual_hash(img: &DynamicImage) -> String {
    const N: usize = 32;
    const K: usize = 8;

    let gray = img
        .resize_exact(N as u32, N as u32, image::imageops::FilterType::Triangle)
        .to_luma8();

    let mut pixels = [[0f64; N]; N];
    for (x, y, p) in gray.enumerate_pixels() {
        pixels[y as usize][x as usize] = p.0[0] as f64;
    }

    // Separable DCT-II, rows then columns. N=32 keeps the naive transform
    // well under a millisecond.
    let mut rows = [[0f64; N]; N];
    for y in 0..N {
        for u in 0..K {
            let mut sum = 0.0;
            for x in 0..N {
                sum += pixels[y][x]
                    * ((std::f64::consts::PI / N as f64) * (x as f64 + 0.5) * u as f64).cos();
            }
            rows[y][u] = sum;
        }
    }
    let mut coeffs = [[0f64; K]; K];
    for u in 0..K {
        for v in 0..K {
            let mut sum = 0.0;
            for y in 0..N {
                sum += rows[y][u]
                    * ((std::f64::consts::PI / N as f64) * (y as f64 + 0.5) * v as f64).cos();
            }
            coeffs[v][u] = sum;
        }
    }

    // Median over the AC coefficients; the DC term would swamp it.
    let mut ac: Vec<f64> = Vec::with_capacity(K * K - 1);
    for v in 0..K {
        for u in 0..K {
            if u != 0 || v != 0 {
                ac.push(coeffs[v][u]);
            }
        }
    }
    ac.sort_by(f64::total_cmp);
    let median = (ac[ac.len() / 2 - 1] + ac[ac.len() / 2]) / 2.0;

    let mut bits: u64 = 0;
    for v in 0..K {
        for u in 0..K {
            bits <<= 1;
            if coeffs[v][u] > median {
                bits |= 1;
            }
        }
    }
    format!("{:016x}", bits)
}

/// Hamming distance between two 16-hex signatures. Malformed input counts
/// as maximally distant rather than erroring.
pub fn hamming_distance(a: &str, b: &str) -> u32 {
    match (u64::from_str_radix(a, 16), u64::from_str_radix(b, 16)) {
        (Ok(a), Ok(b)) => (a ^ b).count_ones(),
        _ => u64::BITS,
    }
}

/// Stable fingerprint of a parameter record, 16 lowercase hex chars.
///
/// serde_json maps are BTree-backed, so object keys serialize sorted and
/// equivalent parameter objects (field order, 0.3 vs 0.30) produce the same
/// canonical bytes.
pub fn param_fingerprint<T: Serialize>(params: &T) -> ApiResult<String> {
    let value = serde_json::to_value(params)
        .map_err(|e| ApiError::processing("param_fingerprint", e.to_string()))?;
    let canonical = serde_json::to_vec(&value)
        .map_err(|e| ApiError::processing("param_fingerprint", e.to_string()))?;
    Ok(format!("{:016x}", xxh3_64(&canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use serde_json::json;

    fn gradient_image(seed: u8) -> DynamicImage {
        let mut img = RgbImage::new(64, 64);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([(x * 4) as u8, (y * 4) as u8, seed]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn content_hash_is_deterministic() {
        let a = content_hash(b"park bench under an oak");
        let b = content_hash(b"park bench under an oak");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, content_hash(b"park bench under an elm"));
    }

    #[test]
    fn content_hash_known_vector() {
        // RFC 1321 test vector
        assert_eq!(content_hash(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn perceptual_hash_stable_and_similar() {
        let img = gradient_image(10);
        let h1 = perceptual_hash(&img);
        let h2 = perceptual_hash(&img);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);

        // A mild color shift should stay within the similarity threshold
        let near = gradient_image(20);
        assert!(hamming_distance(&h1, &perceptual_hash(&near)) <= 5);

        // An inverted image should be far away
        let mut inverted = gradient_image(10);
        inverted.invert();
        assert!(hamming_distance(&h1, &perceptual_hash(&inverted)) > 5);
    }

    #[test]
    fn hamming_handles_garbage() {
        assert_eq!(hamming_distance("zzzz", "0000000000000000"), 64);
        assert_eq!(
            hamming_distance("0000000000000000", "0000000000000003"),
            2
        );
    }

    #[test]
    fn fingerprint_ignores_field_order_and_float_spelling() {
        let a = json!({"confidence_threshold": 0.3, "max_results": 50});
        let b = json!({"max_results": 50, "confidence_threshold": 0.30});
        assert_eq!(
            param_fingerprint(&a).unwrap(),
            param_fingerprint(&b).unwrap()
        );
    }

    #[test]
    fn fingerprint_differs_when_params_differ() {
        let a = json!({"confidence_threshold": 0.3});
        let b = json!({"confidence_threshold": 0.31});
        assert_ne!(
            param_fingerprint(&a).unwrap(),
            param_fingerprint(&b).unwrap()
        );
    }
}
