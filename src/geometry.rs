//! Box geometry between model-input space and native frame space.

use serde::Serialize;

/// Detector box in model-input pixel coordinates.
///
/// Values come straight from the model and may be negative, inverted or
/// outside the input frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
}

impl BoundingBox {
    pub fn new(xmin: i32, ymin: i32, xmax: i32, ymax: i32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }
}

/// Per-axis factors mapping model-input pixels onto native pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scale {
    pub x: f64,
    pub y: f64,
}

impl Scale {
    pub fn between(native_width: u32, native_height: u32, input_width: u32, input_height: u32) -> Self {
        Self {
            x: native_width as f64 / input_width.max(1) as f64,
            y: native_height as f64 / input_height.max(1) as f64,
        }
    }

    pub fn inverse(&self) -> Self {
        Self {
            x: 1.0 / self.x,
            y: 1.0 / self.y,
        }
    }
}

/// Box in native frame pixels.
///
/// Invariant: `xmin <= xmax <= frame_width` and `ymin <= ymax <= frame_height`
/// for the frame it was computed against. Only `rescale` builds these from
/// detector output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RescaledBox {
    pub xmin: u32,
    pub ymin: u32,
    pub xmax: u32,
    pub ymax: u32,
}

impl RescaledBox {
    pub fn width(&self) -> u32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> u32 {
        self.ymax - self.ymin
    }

    /// Zero width or height after clamping.
    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Scale a model-space box into a `frame_width x frame_height` frame, clamped
/// to its bounds. Inverted detector boxes are reordered.
pub fn rescale(bbox: BoundingBox, scale: Scale, frame_width: u32, frame_height: u32) -> RescaledBox {
    let x0 = scale_axis(bbox.xmin, scale.x, frame_width);
    let x1 = scale_axis(bbox.xmax, scale.x, frame_width);
    let y0 = scale_axis(bbox.ymin, scale.y, frame_height);
    let y1 = scale_axis(bbox.ymax, scale.y, frame_height);
    RescaledBox {
        xmin: x0.min(x1),
        xmax: x0.max(x1),
        ymin: y0.min(y1),
        ymax: y0.max(y1),
    }
}

fn scale_axis(value: i32, factor: f64, limit: u32) -> u32 {
    let scaled = (value as f64 * factor).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        return 0;
    }
    if scaled >= limit as f64 {
        return limit;
    }
    scaled as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_between_native_and_input() {
        let scale = Scale::between(858, 480, 300, 300);
        assert!((scale.x - 2.86).abs() < 1e-9);
        assert!((scale.y - 1.6).abs() < 1e-9);
    }

    #[test]
    fn rescale_round_trip_within_one_pixel() {
        let cases = [(1920, 1080), (1280, 720), (858, 480), (300, 300)];
        let boxes = [
            BoundingBox::new(0, 0, 300, 300),
            BoundingBox::new(10, 10, 50, 50),
            BoundingBox::new(123, 77, 241, 199),
            BoundingBox::new(299, 1, 300, 2),
        ];
        for (width, height) in cases {
            let scale = Scale::between(width, height, 300, 300);
            let back = scale.inverse();
            for bbox in boxes {
                let native = rescale(bbox, scale, width, height);
                let restored = [
                    (native.xmin as f64 * back.x).round() as i32,
                    (native.ymin as f64 * back.y).round() as i32,
                    (native.xmax as f64 * back.x).round() as i32,
                    (native.ymax as f64 * back.y).round() as i32,
                ];
                let original = [bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax];
                for (r, o) in restored.iter().zip(original.iter()) {
                    assert!(
                        (r - o).abs() <= 1,
                        "{:?} -> {:?} -> {:?} at {}x{}",
                        bbox,
                        native,
                        restored,
                        width,
                        height
                    );
                }
            }
        }
    }

    #[test]
    fn rescale_clamps_to_frame_bounds() {
        let scale = Scale::between(858, 480, 300, 300);
        let native = rescale(BoundingBox::new(-20, -5, 350, 300 + 50), scale, 858, 480);
        assert_eq!(native.xmin, 0);
        assert_eq!(native.ymin, 0);
        assert_eq!(native.xmax, 858);
        assert_eq!(native.ymax, 480);
        assert!(native.xmin <= native.xmax && native.xmax <= 858);
        assert!(native.ymin <= native.ymax && native.ymax <= 480);
    }

    #[test]
    fn inverted_boxes_are_reordered() {
        let scale = Scale::between(600, 600, 300, 300);
        let native = rescale(BoundingBox::new(50, 60, 10, 20), scale, 600, 600);
        assert_eq!(native, RescaledBox { xmin: 20, ymin: 40, xmax: 100, ymax: 120 });
    }

    #[test]
    fn box_fully_outside_frame_is_degenerate() {
        let scale = Scale::between(600, 600, 300, 300);
        let native = rescale(BoundingBox::new(310, 10, 400, 50), scale, 600, 600);
        assert_eq!(native.xmin, 600);
        assert_eq!(native.xmax, 600);
        assert!(native.is_degenerate());
    }
}
