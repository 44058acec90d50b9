//! Detection overlays drawn onto the preview copy of a frame.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::geometry::RescaledBox;

/// Overlay colour, sky blue. In BGR channel order this is (255, 165, 20).
pub const OVERLAY_COLOR: Rgb<u8> = Rgb([20, 165, 255]);

/// Gap between the box top edge and the probability text, in glyph rows.
const TEXT_OFFSET_ROWS: i32 = 3;

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// Stroke and text scale derived from the frame width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlayStyle {
    pub thickness: u32,
    pub text_scale: u32,
}

impl OverlayStyle {
    pub fn for_width(width: u32) -> Self {
        Self {
            thickness: (width / 200).max(2),
            text_scale: (width / 320).max(1),
        }
    }
}

/// Probability label, e.g. `93.25%`.
pub fn probability_label(probability: f64) -> String {
    format!("{:.2}%", probability * 100.0)
}

/// Draw the box outline and its probability label.
pub fn draw_detection(image: &mut RgbImage, bbox: &RescaledBox, probability: f64) {
    let style = OverlayStyle::for_width(image.width());
    draw_box(image, bbox, style.thickness);

    let scale = style.text_scale as i32;
    let text_height = GLYPH_HEIGHT * scale;
    let above = bbox.ymin as i32 - (TEXT_OFFSET_ROWS + GLYPH_HEIGHT) * scale;
    // Put the label inside the box when there is no room above it.
    let y = if above >= 0 {
        above
    } else {
        (bbox.ymin as i32 + style.thickness as i32 + scale).min(image.height() as i32 - text_height)
    };
    draw_text(image, bbox.xmin as i32, y.max(0), &probability_label(probability), scale);
}

fn draw_box(image: &mut RgbImage, bbox: &RescaledBox, thickness: u32) {
    if bbox.is_degenerate() {
        return;
    }
    for inset in 0..thickness {
        let width = bbox.width().saturating_sub(2 * inset);
        let height = bbox.height().saturating_sub(2 * inset);
        if width == 0 || height == 0 {
            break;
        }
        let rect = Rect::at((bbox.xmin + inset) as i32, (bbox.ymin + inset) as i32)
            .of_size(width, height);
        draw_hollow_rect_mut(image, rect, OVERLAY_COLOR);
    }
}

fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, scale: i32) {
    let mut cursor = x;
    for ch in text.chars() {
        if let Some(rows) = glyph_bits(ch) {
            for (row, pattern) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        let rect = Rect::at(cursor + col * scale, y + row as i32 * scale)
                            .of_size(scale as u32, scale as u32);
                        draw_filled_rect_mut(image, rect, OVERLAY_COLOR);
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE * scale;
    }
}

/// 5x7 bitmaps for the characters a probability label needs.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '%' => Some([0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011]),
        '.' => Some([0, 0, 0, 0, 0, 0b01100, 0b01100]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_formats_two_decimals() {
        assert_eq!(probability_label(0.9), "90.00%");
        assert_eq!(probability_label(0.93251), "93.25%");
    }

    #[test]
    fn box_outline_drawn_inside_bounds() {
        let mut image = RgbImage::new(400, 300);
        let bbox = RescaledBox {
            xmin: 100,
            ymin: 120,
            xmax: 200,
            ymax: 220,
        };
        draw_detection(&mut image, &bbox, 0.9);
        assert_eq!(*image.get_pixel(100, 150), OVERLAY_COLOR);
        assert_eq!(*image.get_pixel(199, 150), OVERLAY_COLOR);
        assert_eq!(*image.get_pixel(150, 170), Rgb([0, 0, 0]));
    }

    #[test]
    fn label_above_box_when_room() {
        let mut image = RgbImage::new(400, 300);
        let bbox = RescaledBox {
            xmin: 10,
            ymin: 100,
            xmax: 100,
            ymax: 200,
        };
        draw_detection(&mut image, &bbox, 0.88);
        let drawn_above = (0..100)
            .flat_map(|x| (0..100).map(move |y| (x, y)))
            .any(|(x, y)| *image.get_pixel(x, y) == OVERLAY_COLOR);
        assert!(drawn_above);
    }

    #[test]
    fn box_at_frame_edge_does_not_panic() {
        let mut image = RgbImage::new(64, 48);
        let bbox = RescaledBox {
            xmin: 0,
            ymin: 0,
            xmax: 64,
            ymax: 48,
        };
        draw_detection(&mut image, &bbox, 1.0);
        let degenerate = RescaledBox {
            xmin: 64,
            ymin: 48,
            xmax: 64,
            ymax: 48,
        };
        draw_detection(&mut image, &degenerate, 0.8);
    }
}
