//! Prepare a base texture for upload: keep small files byte-for-byte, shrink big ones.

use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use tracing::{debug, info, warn};

use crate::data_url::encode_data_url;
use crate::error::{ErrorRecord, PipelineResult};

/// Default upload ceiling: 5 MiB.
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;
/// Longest edge after downscaling an oversized image.
pub const MAX_DIMENSION: u32 = 2048;
pub const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone)]
pub struct TransportPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub max_bytes: usize,
    pub original_size: usize,
    /// True when the bytes are a resized re-encode rather than the file as read.
    pub recompressed: bool,
}

impl TransportPayload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn within_budget(&self) -> bool {
        self.bytes.len() <= self.max_bytes
    }

    pub fn to_data_url(&self) -> String {
        encode_data_url(&self.mime_type, &self.bytes)
    }
}

/// MIME type from a file extension; unknown extensions are sent as PNG.
pub fn mime_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "image/png",
    }
}

/// File extension matching the encoded bytes, `png` when the format is not recognised.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("png")
}

/// Read `path` and make it fit `max_bytes` with a single resize and re-encode pass.
pub fn prepare_image(path: &Path, max_bytes: usize) -> PipelineResult<TransportPayload> {
    let bytes = std::fs::read(path).map_err(|e| {
        ErrorRecord::decode(format!("Failed to read image file {}: {e}", path.display()))
    })?;
    let original_size = bytes.len();

    if original_size <= max_bytes {
        debug!(path = %path.display(), bytes = original_size, "image within upload budget");
        return Ok(TransportPayload {
            bytes,
            mime_type: mime_type_for_path(path).to_string(),
            max_bytes,
            original_size,
            recompressed: false,
        });
    }

    info!(
        path = %path.display(),
        size_mb = %format!("{:.2}", original_size as f64 / 1024.0 / 1024.0),
        "image too large, compressing"
    );
    let img = image::load_from_memory(&bytes).map_err(|e| {
        ErrorRecord::decode(format!("Failed to decode image {}: {e}", path.display()))
    })?;
    let encoded = shrink_to_jpeg(&img)?;

    if encoded.len() >= original_size {
        warn!(
            original = original_size,
            reencoded = encoded.len(),
            "re-encoding did not reduce size; sending original bytes"
        );
        return Ok(TransportPayload {
            bytes,
            mime_type: mime_type_for_path(path).to_string(),
            max_bytes,
            original_size,
            recompressed: false,
        });
    }
    if encoded.len() > max_bytes {
        warn!(
            size = encoded.len(),
            max_bytes, "compressed image still exceeds upload budget"
        );
    }
    info!(
        size_mb = %format!("{:.2}", encoded.len() as f64 / 1024.0 / 1024.0),
        "compressed image"
    );

    Ok(TransportPayload {
        bytes: encoded,
        mime_type: "image/jpeg".to_string(),
        max_bytes,
        original_size,
        recompressed: true,
    })
}

/// Target size keeping aspect ratio so the longer edge is at most [`MAX_DIMENSION`].
pub fn scaled_dimensions(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= MAX_DIMENSION {
        return (width, height);
    }
    let scale = MAX_DIMENSION as f64 / longest as f64;
    let w = ((width as f64 * scale) as u32).max(1);
    let h = ((height as f64 * scale) as u32).max(1);
    (w, h)
}

fn shrink_to_jpeg(img: &DynamicImage) -> PipelineResult<Vec<u8>> {
    let (width, height) = img.dimensions();
    let (w, h) = scaled_dimensions(width, height);
    let resized = if (w, h) != (width, height) {
        debug!(from = ?(width, height), to = ?(w, h), "resizing");
        img.resize_exact(w, h, FilterType::Lanczos3)
    } else {
        img.clone()
    };

    let rgb = flatten_on_white(&resized);
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| ErrorRecord::decode(format!("Failed to encode JPEG: {e}")))?;
    Ok(out.into_inner())
}

/// Composite any alpha over a white background and drop to 3 channels.
fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let p = rgba.get_pixel(x, y).0;
        let a = p[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        image::Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
    })
}

#[cfg(test)]
mod tests {
    use image::ImageFormat;

    use super::*;

    fn noise_png(w: u32, h: u32, seed: u32) -> Vec<u8> {
        let mut state = seed.max(1);
        let img = RgbImage::from_fn(w, h, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let b = state.to_le_bytes();
            image::Rgb([b[0], b[1], b[2]])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn mime_table_covers_known_extensions() {
        assert_eq!(mime_type_for_path(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_type_for_path(Path::new("a.jpg")), "image/jpeg");
        assert_eq!(mime_type_for_path(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_type_for_path(Path::new("a.bmp")), "image/bmp");
        assert_eq!(mime_type_for_path(Path::new("a.tif")), "image/tiff");
        assert_eq!(mime_type_for_path(Path::new("a.tiff")), "image/tiff");
        assert_eq!(mime_type_for_path(Path::new("a.webp")), "image/png");
        assert_eq!(mime_type_for_path(Path::new("noext")), "image/png");
    }

    #[test]
    fn scale_never_upscales() {
        assert_eq!(scaled_dimensions(1024, 512), (1024, 512));
        assert_eq!(scaled_dimensions(4096, 4096), (2048, 2048));
        assert_eq!(scaled_dimensions(8192, 1024), (2048, 256));
        assert_eq!(scaled_dimensions(3000, 1), (2048, 1));
    }

    #[test]
    fn small_file_is_passed_through_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.png");
        let bytes = noise_png(16, 16, 7);
        std::fs::write(&path, &bytes).unwrap();

        let payload = prepare_image(&path, DEFAULT_MAX_BYTES).unwrap();
        assert_eq!(payload.bytes, bytes);
        assert_eq!(payload.mime_type, "image/png");
        assert!(!payload.recompressed);
        assert!(payload.to_data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn oversized_file_is_reencoded_as_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bmp");
        // Uncompressed gradient: large as BMP, tiny as JPEG.
        let img = RgbImage::from_fn(64, 64, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
        img.save_with_format(&path, ImageFormat::Bmp).unwrap();
        let original = std::fs::metadata(&path).unwrap().len() as usize;

        let payload = prepare_image(&path, original - 1).unwrap();
        assert!(payload.recompressed);
        assert_eq!(payload.mime_type, "image/jpeg");
        assert!(payload.len() < original);
        assert!(payload.within_budget());
        assert_eq!(image::guess_format(&payload.bytes).ok(), Some(ImageFormat::Jpeg));
    }

    #[test]
    fn reencode_that_does_not_shrink_keeps_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        // A few noisy pixels: smaller than any JPEG's header tables.
        let bytes = noise_png(4, 4, 11);
        std::fs::write(&path, &bytes).unwrap();

        let payload = prepare_image(&path, bytes.len() - 1).unwrap();
        assert!(!payload.recompressed);
        assert_eq!(payload.bytes, bytes);
        assert_eq!(payload.mime_type, "image/png");
        assert!(!payload.within_budget());
    }

    #[test]
    fn one_pass_only_even_when_still_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradient.bmp");
        let img = RgbImage::from_fn(64, 64, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 64]));
        img.save_with_format(&path, ImageFormat::Bmp).unwrap();
        let original = std::fs::metadata(&path).unwrap().len() as usize;

        let payload = prepare_image(&path, 100).unwrap();
        assert!(payload.recompressed);
        assert_eq!(payload.mime_type, "image/jpeg");
        assert!(payload.len() < original);
        assert!(payload.len() > 100);
        assert!(!payload.within_budget());
        assert_eq!(payload.original_size, original);
    }

    #[test]
    fn alpha_is_flattened_against_white() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            1,
            1,
            image::Rgba([0, 0, 0, 0]),
        ));
        assert_eq!(flatten_on_white(&img).get_pixel(0, 0).0, [255, 255, 255]);
        let opaque = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            1,
            1,
            image::Rgba([10, 20, 30, 255]),
        ));
        assert_eq!(flatten_on_white(&opaque).get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn corrupt_oversized_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let err = prepare_image(&path, 1024).unwrap_err();
        assert_eq!(err.class, crate::error::ErrorClass::Decode);
    }

    #[test]
    fn missing_file_is_a_decode_error() {
        let err = prepare_image(Path::new("/definitely/not/here.png"), 1024).unwrap_err();
        assert_eq!(err.class, crate::error::ErrorClass::Decode);
    }

    #[test]
    fn sniffed_extension_defaults_to_png() {
        assert_eq!(sniff_extension(&noise_png(2, 2, 3)), "png");
        assert_eq!(sniff_extension(b"garbage"), "png");
    }
}
