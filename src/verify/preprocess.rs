//! Deterministic image preprocessing for the verification judge.
//!
//! Encodes the photo as lossy WebP under a byte budget: quality steps down
//! first, then resolution, over a fixed number of attempts. The smallest
//! encoding produced so far is always kept, even when the budget is never
//! met, so verification still proceeds on pathological inputs.

use image::DynamicImage;
use image::GenericImageView;

/// Quality ladder, tried at the starting resolution.
const QUALITY_LADDER: &[f32] = &[80.0, 60.0, 40.0];

/// Resolution ladder (max dimension), tried at the lowest quality.
const RESOLUTION_LADDER: &[u32] = &[1024, 768, 512];

/// Default byte budget for an encoded image (768 KiB).
pub const DEFAULT_BYTE_BUDGET: usize = 786_432;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        source: image::ImageError,
    },
}

/// Read and encode a photo to WebP bytes under `byte_budget`.
///
/// The encoding sequence is fixed, so identical input bytes always produce
/// identical output bytes (the cache key depends on this).
pub fn preprocess(path: &std::path::Path, byte_budget: usize) -> Result<Vec<u8>, PreprocessError> {
    let bytes = std::fs::read(path).map_err(|source| PreprocessError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let img = image::load_from_memory(&bytes).map_err(|source| PreprocessError::Decode {
        path: path.display().to_string(),
        source,
    })?;

    Ok(encode_under_budget(&img, byte_budget))
}

/// Run the quality-then-resolution ladder, keeping the smallest encoding.
fn encode_under_budget(img: &DynamicImage, byte_budget: usize) -> Vec<u8> {
    let lowest_quality = *QUALITY_LADDER.last().unwrap_or(&40.0);

    let mut smallest: Option<Vec<u8>> = None;
    let mut within_budget = false;

    // quality steps at the starting resolution
    let base = scale_down(img, RESOLUTION_LADDER[0]);
    for &quality in QUALITY_LADDER {
        let encoded = encode_webp(&base, quality);
        within_budget = encoded.len() <= byte_budget;
        if smallest.as_ref().map(|s| encoded.len() < s.len()).unwrap_or(true) {
            smallest = Some(encoded);
        }
        if within_budget {
            break;
        }
    }

    // then resolution steps at the lowest quality
    if !within_budget {
        for &max_dim in &RESOLUTION_LADDER[1..] {
            let scaled = scale_down(img, max_dim);
            let encoded = encode_webp(&scaled, lowest_quality);
            within_budget = encoded.len() <= byte_budget;
            if smallest.as_ref().map(|s| encoded.len() < s.len()).unwrap_or(true) {
                smallest = Some(encoded);
            }
            if within_budget {
                break;
            }
        }
    }

    smallest.unwrap_or_default()
}

/// Scale so neither dimension exceeds `max_dimension`, preserving aspect.
fn scale_down(img: &DynamicImage, max_dimension: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w <= max_dimension && h <= max_dimension {
        return img.clone();
    }
    let scale = (max_dimension as f64) / (w.max(h) as f64);
    let new_w = (((w as f64) * scale).round() as u32).max(1);
    let new_h = (((h as f64) * scale).round() as u32).max(1);
    img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3)
}

fn encode_webp(img: &DynamicImage, quality: f32) -> Vec<u8> {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let encoder = webp::Encoder::from_rgba(&rgba, width, height);
    encoder.encode(quality).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy_image(width: u32, height: u32) -> DynamicImage {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([
                ((x * 7 + y * 13) % 256) as u8,
                ((x * 3 + y * 31) % 256) as u8,
                ((x ^ y) % 256) as u8,
                255,
            ])
        });
        DynamicImage::ImageRgba8(img)
    }

    fn write_png(img: &DynamicImage) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "fotoseek-preprocess-test-{}-{}.png",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();
        path
    }

    #[test]
    fn test_preprocess_deterministic() {
        let path = write_png(&noisy_image(64, 64));
        let a = preprocess(&path, DEFAULT_BYTE_BUDGET).unwrap();
        let b = preprocess(&path, DEFAULT_BYTE_BUDGET).unwrap();
        assert_eq!(a, b);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_preprocess_produces_webp() {
        let path = write_png(&noisy_image(32, 32));
        let out = preprocess(&path, DEFAULT_BYTE_BUDGET).unwrap();
        assert!(out.len() >= 12 && &out[0..4] == b"RIFF" && &out[8..12] == b"WEBP");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_tiny_budget_still_returns_smallest() {
        let path = write_png(&noisy_image(200, 200));
        // 1-byte budget can never be met; the ladder still yields bytes
        let out = preprocess(&path, 1).unwrap();
        assert!(!out.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_budget_steps_shrink_output() {
        let path = write_png(&noisy_image(300, 300));
        let generous = preprocess(&path, DEFAULT_BYTE_BUDGET).unwrap();
        let strained = preprocess(&path, 1).unwrap();
        assert!(strained.len() <= generous.len());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = preprocess(std::path::Path::new("/no/such/photo.jpg"), 1000);
        assert!(matches!(result, Err(PreprocessError::Read { .. })));
    }

    #[test]
    fn test_scale_down_preserves_aspect() {
        let img = noisy_image(400, 100);
        let scaled = scale_down(&img, 200);
        let (w, h) = scaled.dimensions();
        assert_eq!(w, 200);
        assert_eq!(h, 50);
    }
}
