use std::io::Cursor;

use image::{GenericImageView, ImageFormat, RgbImage};
use pbr_map_forge::transport::{DEFAULT_MAX_BYTES, MAX_DIMENSION, prepare_image};

/// 4096x4096 gradient with two bits of per-channel noise: smooth enough to resize
/// well, noisy enough that PNG cannot squeeze it under 10 MiB.
fn large_noisy_png() -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    let img = RgbImage::from_fn(4096, 4096, |x, y| {
        let r = next();
        let base = [(x >> 4) as u8, (y >> 4) as u8, ((x + y) >> 5) as u8];
        image::Rgb([
            base[0] ^ (r & 3) as u8,
            base[1] ^ ((r >> 8) & 3) as u8,
            base[2] ^ ((r >> 16) & 3) as u8,
        ])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

#[test]
fn ten_mib_png_is_shrunk_to_budget() {
    let png = large_noisy_png();
    assert!(png.len() >= 10 * 1024 * 1024, "fixture only {} bytes", png.len());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge.png");
    std::fs::write(&path, &png).unwrap();

    let payload = prepare_image(&path, DEFAULT_MAX_BYTES).unwrap();
    assert!(payload.recompressed);
    assert_eq!(payload.mime_type, "image/jpeg");
    assert_eq!(payload.original_size, png.len());
    assert!(payload.len() <= 5_242_880, "payload {} bytes", payload.len());

    let decoded = image::load_from_memory(&payload.bytes).unwrap();
    let (w, h) = decoded.dimensions();
    assert_eq!(w.max(h), MAX_DIMENSION);
    assert_eq!(image::guess_format(&payload.bytes).unwrap(), ImageFormat::Jpeg);
}

#[test]
fn file_at_exact_budget_is_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exact.jpg");
    let bytes = vec![0xAB; 4096];
    std::fs::write(&path, &bytes).unwrap();

    let payload = prepare_image(&path, bytes.len()).unwrap();
    assert_eq!(payload.bytes, bytes);
    assert_eq!(payload.mime_type, "image/jpeg");
    assert!(!payload.recompressed);
}
