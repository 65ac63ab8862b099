//! Clipped drawing primitives on RGB frames.
//!
//! Coordinates are signed so callers can position shapes partly or wholly
//! off-frame; every primitive clips to the image bounds.

use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut, draw_hollow_rect_mut,
};
use imageproc::rect::Rect;

use super::font::{self, ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH};

/// Clamps the half-open span `[start, start + len)` to `[0, limit)`.
fn clip(start: i32, len: i32, limit: u32) -> Option<(u32, u32)> {
    let lo = start.max(0);
    let hi = start.saturating_add(len).min(limit as i32);
    (lo < hi).then_some((lo as u32, hi as u32))
}

fn rect(x: i32, y: i32, w: i32, h: i32) -> Option<Rect> {
    (w > 0 && h > 0).then(|| Rect::at(x, y).of_size(w as u32, h as u32))
}

pub fn fill_rect(image: &mut RgbImage, x: i32, y: i32, w: i32, h: i32, color: Rgb<u8>) {
    if let Some(r) = rect(x, y, w, h) {
        draw_filled_rect_mut(image, r, color);
    }
}

/// Rectangle outline drawn inward from the given bounds.
pub fn stroke_rect(
    image: &mut RgbImage,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    thickness: i32,
    color: Rgb<u8>,
) {
    let t = thickness.min(w).min(h).max(1);
    for inset in 0..t {
        if let Some(r) = rect(x + inset, y + inset, w - 2 * inset, h - 2 * inset) {
            draw_hollow_rect_mut(image, r, color);
        }
    }
}

/// Mixes `color` over the region with weight `alpha` (0 keeps the frame,
/// 1 paints solid).
pub fn blend_rect(
    image: &mut RgbImage,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    color: Rgb<u8>,
    alpha: f32,
) {
    let (Some((x0, x1)), Some((y0, y1))) = (clip(x, w, image.width()), clip(y, h, image.height()))
    else {
        return;
    };
    let a = alpha.clamp(0.0, 1.0);
    for py in y0..y1 {
        for px in x0..x1 {
            let pixel = image.get_pixel_mut(px, py);
            for c in 0..3 {
                let mixed = color.0[c] as f32 * a + pixel.0[c] as f32 * (1.0 - a);
                pixel.0[c] = mixed.round() as u8;
            }
        }
    }
}

pub fn fill_circle(image: &mut RgbImage, cx: i32, cy: i32, radius: i32, color: Rgb<u8>) {
    draw_filled_circle_mut(image, (cx, cy), radius.max(0), color);
}

/// Circle outline of the given thickness, growing inward from `radius`.
pub fn ring(image: &mut RgbImage, cx: i32, cy: i32, radius: i32, thickness: i32, color: Rgb<u8>) {
    let inner = (radius - thickness.max(1) + 1).max(0);
    for r in inner..=radius {
        draw_hollow_circle_mut(image, (cx, cy), r, color);
    }
}

/// Draws `text` with its top-left corner at (`x`, `y`). Each font pixel
/// becomes a `scale`×`scale` block.
pub fn text(image: &mut RgbImage, x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    let scale = scale.max(1);
    let mut cursor = x;
    for ch in text.chars() {
        let rows = font::glyph(ch);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                    fill_rect(
                        image,
                        cursor + col * scale,
                        y + row as i32 * scale,
                        scale,
                        scale,
                        color,
                    );
                }
            }
        }
        cursor += ADVANCE * scale;
    }
}

pub fn text_height(scale: i32) -> i32 {
    GLYPH_HEIGHT * scale.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

    #[test]
    fn test_fill_rect_clips_off_frame() {
        let mut img = RgbImage::new(4, 4);
        fill_rect(&mut img, -2, -2, 4, 4, WHITE);
        fill_rect(&mut img, 100, 100, 4, 4, WHITE);

        assert_eq!(*img.get_pixel(0, 0), WHITE);
        assert_eq!(*img.get_pixel(1, 1), WHITE);
        assert_eq!(*img.get_pixel(2, 2), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_stroke_rect_is_hollow() {
        let mut img = RgbImage::new(10, 10);
        stroke_rect(&mut img, 0, 0, 10, 10, 2, WHITE);

        assert_eq!(*img.get_pixel(0, 5), WHITE);
        assert_eq!(*img.get_pixel(1, 5), WHITE);
        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_blend_rect_mixes() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([100, 100, 100]));
        blend_rect(&mut img, 0, 0, 2, 2, Rgb([0, 0, 0]), 0.7);
        assert_eq!(*img.get_pixel(1, 1), Rgb([30, 30, 30]));
    }

    #[test]
    fn test_ring_leaves_center_untouched() {
        let mut img = RgbImage::new(21, 21);
        ring(&mut img, 10, 10, 8, 2, WHITE);

        assert_eq!(*img.get_pixel(10, 10), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(18, 10), WHITE);
    }

    #[test]
    fn test_text_draws_inside_bounds_only() {
        let mut img = RgbImage::new(3, 3);
        text(&mut img, -1, -1, "HELLO WORLD", 2, WHITE);
        assert!(img.pixels().any(|p| *p == WHITE));
    }
}
