use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::ImageFormat;
use image::DynamicImage;
use std::io::Cursor;

/// Asynchronously load an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large uploads, and must
/// not stall the async runtime.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> ApiResult<DynamicImage> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .map_err(|e| ApiError::validation(format!("image decode failed: {e}")))
    })
    .await
    .map_err(|e| ApiError::processing("decode", e.to_string()))?
}

/// Encode to the requested output format on the blocking pool.
///
/// Quality applies to JPEG only; PNG is lossless by definition and the WebP
/// encoder here is the lossless variant.
pub async fn encode_image_async(
    img: DynamicImage,
    format: ImageFormat,
    quality: u8,
) -> ApiResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_image_sync(&img, format, quality))
        .await
        .map_err(|e| ApiError::processing("encode", e.to_string()))?
}

pub fn encode_image_sync(img: &DynamicImage, format: ImageFormat, quality: u8) -> ApiResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut cursor = Cursor::new(&mut out);
    match format {
        ImageFormat::Png => {
            img.write_to(&mut cursor, image::ImageFormat::Png)
                .map_err(|e| ApiError::processing("encode_png", e.to_string()))?;
        }
        ImageFormat::Jpg => {
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100));
            img.to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| ApiError::processing("encode_jpg", e.to_string()))?;
        }
        ImageFormat::Webp => {
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut cursor);
            img.to_rgba8()
                .write_with_encoder(encoder)
                .map_err(|e| ApiError::processing("encode_webp", e.to_string()))?;
        }
    }
    Ok(out)
}

/// Asynchronously resize an image using spawn_blocking.
pub async fn resize_image_async(
    img: DynamicImage,
    new_width: u32,
    new_height: u32,
) -> ApiResult<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        img.resize(new_width, new_height, image::imageops::FilterType::Triangle)
    })
    .await
    .map_err(|e| ApiError::processing("resize", e.to_string()))
}

/// Decode just enough to report dimensions without holding the full decode.
pub fn probe_dimensions(bytes: &[u8]) -> ApiResult<(u32, u32)> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ApiError::validation(format!("unreadable image: {e}")))?;
    reader
        .into_dimensions()
        .map_err(|e| ApiError::validation(format!("image decode failed: {e}")))
}
