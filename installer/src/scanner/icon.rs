//! Preview rendering for font bitmaps.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::logger;

const MAX_ICON_WIDTH: u32 = 256;
const MAX_ICON_HEIGHT: u32 = 64;

/// Bounding box of pixels that are not fully transparent
fn visible_bounds(image: &DynamicImage) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = image.dimensions();
    let rgba = image.to_rgba8();
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in rgba.enumerate_pixels() {
        if pixel[3] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds.map(|(x0, y0, x1, y1)| (x0, y0, (x1 - x0 + 1).min(width), (y1 - y0 + 1).min(height)))
}

/// Crops the glyph strip of a font bitmap to a small PNG preview.
///
/// Returns `None` when the bitmap cannot be decoded; a missing icon never
/// fails detection.
pub fn render_font_icon(bitmap: &[u8]) -> Option<Vec<u8>> {
    let image = match image::load_from_memory(bitmap) {
        Ok(image) => image,
        Err(e) => {
            logger::log_info(&format!("Font bitmap is not readable: {}", e), Some("scanner"));
            return None;
        }
    };

    let (x, y, width, height) = visible_bounds(&image).unwrap_or((0, 0, image.width(), image.height()));
    let cropped = image.crop_imm(x, y, width.min(MAX_ICON_WIDTH), height.min(MAX_ICON_HEIGHT));

    let mut png = Cursor::new(Vec::new());
    cropped.write_to(&mut png, ImageFormat::Png).ok()?;
    Some(png.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn encode(image: RgbaImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image).write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_crops_to_visible_glyphs() {
        let mut bitmap = RgbaImage::from_pixel(100, 40, Rgba([0, 0, 0, 0]));
        for x in 10..30 {
            for y in 5..15 {
                bitmap.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        let icon = render_font_icon(&encode(bitmap, ImageFormat::Png)).unwrap();
        let decoded = image::load_from_memory(&icon).unwrap();
        assert_eq!(decoded.dimensions(), (20, 10));
    }

    #[test]
    fn test_opaque_bitmap_is_capped() {
        let bitmap = RgbaImage::from_pixel(1024, 512, Rgba([10, 10, 10, 255]));
        let icon = render_font_icon(&encode(bitmap, ImageFormat::Png)).unwrap();
        let decoded = image::load_from_memory(&icon).unwrap();
        assert_eq!(decoded.dimensions(), (MAX_ICON_WIDTH, MAX_ICON_HEIGHT));
    }

    #[test]
    fn test_garbage_yields_none() {
        assert!(render_font_icon(b"not an image").is_none());
    }
}
