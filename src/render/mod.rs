//! Frame annotation and JPEG encoding.
//!
//! [`Renderer::render`] never touches the input frame: it paints detections
//! and the overlay onto a copy and encodes that copy.

mod draw;
mod font;

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use tracing::debug;

use crate::congestion::CongestionTier;
use crate::detect::{Detection, VehicleClass};
use crate::error::RenderError;
use crate::frame::Frame;
use crate::signal::Phase;
use crate::snapshot::SignalView;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Lowest quality tried when shrinking an oversized frame.
const MIN_QUALITY: u8 = 20;
const QUALITY_STEP: u8 = 15;
const COORD_LIMIT: f32 = 100_000.0;

pub fn class_color(class: VehicleClass) -> Rgb<u8> {
    match class {
        VehicleClass::Bicycle => Rgb([0, 255, 255]),
        VehicleClass::Car => Rgb([0, 255, 0]),
        VehicleClass::Motorcycle => Rgb([0, 0, 255]),
        VehicleClass::Bus => Rgb([255, 0, 0]),
        VehicleClass::Truck => Rgb([255, 255, 0]),
    }
}

/// Red channel of the LIVE badge at `t` seconds: `|sin(3t)|` scaled to
/// 0..=255, floored at 128.
pub fn pulse_intensity(t: f64) -> u8 {
    let raw = ((t * 3.0).sin().abs() * 255.0) as u8;
    raw.max(128)
}

/// Everything drawn on top of the frame besides detection boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub vehicle_count: u32,
    pub rolling_average: f64,
    pub tier: CongestionTier,
    pub signal: SignalView,
    pub fps: f64,
    pub frame_number: u64,
    pub loop_number: u64,
    pub pulse: u8,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    quality: u8,
    max_frame_bytes: usize,
}

impl Renderer {
    pub fn new(quality: u8, max_frame_bytes: usize) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            max_frame_bytes,
        }
    }

    /// Annotates a copy of `frame` and encodes it as JPEG.
    pub fn render(
        &self,
        frame: &Frame,
        detections: &[Detection],
        overlay: &Overlay,
    ) -> Result<Bytes, RenderError> {
        let canvas = self.compose(frame, detections, overlay);
        self.encode(&canvas)
    }

    /// Draws the annotated image without encoding it.
    pub fn compose(&self, frame: &Frame, detections: &[Detection], overlay: &Overlay) -> RgbImage {
        let mut canvas = frame.pixels.clone();
        for detection in detections {
            draw_detection(&mut canvas, detection);
        }
        draw_live_badge(&mut canvas, overlay);
        draw_info_panel(&mut canvas, overlay);
        draw_traffic_light(&mut canvas, &overlay.signal);
        draw_legend(&mut canvas);
        canvas
    }

    /// Encodes at the configured quality, stepping down while the result
    /// exceeds the size bound.
    pub fn encode(&self, canvas: &RgbImage) -> Result<Bytes, RenderError> {
        let mut quality = self.quality;
        loop {
            let mut out = Cursor::new(Vec::with_capacity(128 * 1024));
            JpegEncoder::new_with_quality(&mut out, quality).encode_image(canvas)?;
            let jpeg = out.into_inner();

            if jpeg.len() <= self.max_frame_bytes {
                return Ok(Bytes::from(jpeg));
            }
            if quality <= MIN_QUALITY {
                return Err(RenderError::Oversized {
                    bytes: jpeg.len(),
                    limit: self.max_frame_bytes,
                });
            }
            debug!(
                quality,
                bytes = jpeg.len(),
                limit = self.max_frame_bytes,
                "Frame over size limit; re-encoding"
            );
            quality = quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
        }
    }
}

fn draw_detection(canvas: &mut RgbImage, detection: &Detection) {
    let color = class_color(detection.class);
    // Detector boxes are untrusted; keep the integer math well inside i32.
    let px = |v: f32| v.round().clamp(-COORD_LIMIT, COORD_LIMIT) as i32;
    let b = detection.bbox;
    let (x, y) = (px(b.x), px(b.y));
    let (w, h) = (px(b.w).max(1), px(b.h).max(1));
    draw::stroke_rect(canvas, x, y, w, h, 2, color);

    let label = format!(
        "{} {:.0}%",
        detection.class,
        detection.confidence * 100.0
    );
    let label_h = draw::text_height(1) + 4;
    let label_w = font::text_width(&label, 1) + 4;
    let label_y = (y - label_h).max(0);
    draw::fill_rect(canvas, x, label_y, label_w, label_h, color);
    draw::text(canvas, x + 2, label_y + 2, &label, 1, BLACK);
}

fn draw_live_badge(canvas: &mut RgbImage, overlay: &Overlay) {
    let label = format!("LIVE  LOOP #{}", overlay.loop_number);
    let (x, y) = (20, 20);
    let w = (font::text_width(&label, 2) + 20).max(100);
    let h = 40;
    draw::fill_rect(canvas, x, y, w, h, Rgb([overlay.pulse, 0, 0]));
    draw::stroke_rect(canvas, x, y, w, h, 2, WHITE);
    draw::text(canvas, x + 10, y + (h - draw::text_height(2)) / 2, &label, 2, WHITE);
}

fn draw_info_panel(canvas: &mut RgbImage, overlay: &Overlay) {
    draw::blend_rect(canvas, 10, 80, 440, 175, BLACK, 0.7);

    let lines = [
        format!("VEHICLES: {}", overlay.vehicle_count),
        format!("AVERAGE: {:.1}", overlay.rolling_average),
        format!("FPS: {:.1}", overlay.fps),
        format!("FRAME: {}", overlay.frame_number),
        format!("SIGNAL: {}", overlay.signal.phase),
        format!("CONGESTION: {}", overlay.tier),
    ];
    for (i, line) in lines.iter().enumerate() {
        draw::text(canvas, 20, 92 + i as i32 * 26, line, 2, WHITE);
    }
}

fn lamp_colors(phase: Phase, active: Phase) -> Rgb<u8> {
    let lit = phase == active;
    match (phase, lit) {
        (Phase::Red, true) => Rgb([255, 0, 0]),
        (Phase::Red, false) => Rgb([80, 0, 0]),
        (Phase::Yellow, true) => Rgb([255, 255, 0]),
        (Phase::Yellow, false) => Rgb([80, 80, 0]),
        (Phase::Green, true) => Rgb([0, 255, 0]),
        (Phase::Green, false) => Rgb([0, 80, 0]),
    }
}

fn draw_traffic_light(canvas: &mut RgbImage, signal: &SignalView) {
    let (w, h) = (80, 200);
    let x = canvas.width() as i32 - 120;
    let y = 20;
    let radius = 25;

    draw::fill_rect(canvas, x, y, w, h, BLACK);
    draw::stroke_rect(canvas, x, y, w, h, 3, WHITE);

    let cx = x + w / 2;
    for (phase, cy) in [
        (Phase::Red, y + 40),
        (Phase::Yellow, y + 100),
        (Phase::Green, y + 160),
    ] {
        let color = lamp_colors(phase, signal.phase);
        draw::fill_circle(canvas, cx, cy, radius, color);
        draw::ring(canvas, cx, cy, radius, 2, WHITE);
        if phase == signal.phase {
            draw::ring(canvas, cx, cy, radius + 5, 2, color);
        }
    }

    let remaining = format!("{:.1}S", signal.remaining);
    draw::text(canvas, x, y + h + 10, &remaining, 2, WHITE);
}

fn draw_legend(canvas: &mut RgbImage) {
    let y = canvas.height() as i32 - 100;
    draw::text(canvas, 20, y, "VEHICLE TYPES:", 2, WHITE);
    for (i, class) in VehicleClass::ALL.iter().enumerate() {
        let x = 20 + i as i32 * 120;
        draw::fill_rect(canvas, x, y + 22, 15, 15, class_color(*class));
        draw::text(canvas, x + 20, y + 26, class.as_str(), 1, WHITE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;
    use chrono::Utc;

    fn frame(w: u32, h: u32) -> Frame {
        Frame {
            pixels: RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 40])),
            sequence: 1,
            frame_number: 1,
            loop_number: 1,
            captured_at: Utc::now(),
        }
    }

    fn overlay() -> Overlay {
        Overlay {
            vehicle_count: 3,
            rolling_average: 2.5,
            tier: CongestionTier::Low,
            signal: SignalView {
                phase: Phase::Green,
                remaining: 12.0,
                elapsed: 18.0,
                duration: 30.0,
            },
            fps: 30.0,
            frame_number: 1,
            loop_number: 2,
            pulse: 200,
        }
    }

    fn car(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            class: VehicleClass::Car,
            confidence: 0.87,
            bbox: BBox::new(x, y, w, h),
        }
    }

    #[test]
    fn test_render_produces_jpeg() {
        let renderer = Renderer::new(80, 2 * 1024 * 1024);
        let jpeg = renderer
            .render(&frame(960, 540), &[car(300.0, 300.0, 60.0, 40.0)], &overlay())
            .unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_render_leaves_input_untouched() {
        let renderer = Renderer::new(80, 2 * 1024 * 1024);
        let input = frame(320, 240);
        let before = input.pixels.clone();

        renderer.render(&input, &[car(10.0, 10.0, 50.0, 50.0)], &overlay()).unwrap();
        assert_eq!(input.pixels, before);
    }

    #[test]
    fn test_box_drawn_in_class_color() {
        let renderer = Renderer::new(80, 2 * 1024 * 1024);
        let canvas = renderer.compose(&frame(960, 540), &[car(300.0, 300.0, 50.0, 50.0)], &overlay());

        assert_eq!(*canvas.get_pixel(300, 320), class_color(VehicleClass::Car));
        assert_eq!(*canvas.get_pixel(349, 320), class_color(VehicleClass::Car));
    }

    #[test]
    fn test_active_lamp_is_lit() {
        let renderer = Renderer::new(80, 2 * 1024 * 1024);
        let canvas = renderer.compose(&frame(960, 540), &[], &overlay());

        // Lamp centres: x = 960 - 120 + 40; red/yellow/green at y = 60/120/180.
        assert_eq!(*canvas.get_pixel(880, 180), Rgb([0, 255, 0]));
        assert_eq!(*canvas.get_pixel(880, 60), Rgb([80, 0, 0]));
    }

    #[test]
    fn test_tiny_frame_and_offscreen_boxes_clip() {
        let renderer = Renderer::new(80, 2 * 1024 * 1024);
        let detections = [car(-50.0, -50.0, 500.0, 500.0), car(1e6, 1e6, 10.0, 10.0)];

        let jpeg = renderer.render(&frame(8, 8), &detections, &overlay()).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_oversized_frame_fails() {
        let renderer = Renderer::new(80, 64);
        let err = renderer.render(&frame(64, 64), &[], &overlay()).unwrap_err();

        assert!(matches!(err, RenderError::Oversized { limit: 64, .. }));
    }

    #[test]
    fn test_pulse_floor() {
        assert_eq!(pulse_intensity(0.0), 128);
        assert!(pulse_intensity(std::f64::consts::FRAC_PI_6) >= 254);
    }
}
