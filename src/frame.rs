//! Native-resolution frames.
//!
//! A `Frame` is an RGB8 pixel buffer owned by whoever produced it for the
//! duration of one tick. Crossing a component boundary means copying
//! (`resized`, `crop`) or re-encoding (the display sink), never sharing.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::geometry::RescaledBox;

/// Raw RGB frame at the source's native resolution.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Wrap tightly packed RGB bytes.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("failed to build {}x{} frame", width, height))?;
        Ok(Self { image })
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Solid-colour frame; used for placeholders and synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, Rgb(rgb)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Resized copy; the original frame is untouched.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.width() == width && self.height() == height {
            return self.clone();
        }
        Frame {
            image: imageops::resize(&self.image, width, height, FilterType::Triangle),
        }
    }

    /// Copy of the region covered by `bbox`. Returns `None` for degenerate boxes.
    pub fn crop(&self, bbox: &RescaledBox) -> Option<RgbImage> {
        if bbox.is_degenerate() {
            return None;
        }
        // RescaledBox is clamped to the frame it was computed for; re-clamp in
        // case it is applied to a different frame.
        let x = bbox.xmin.min(self.width());
        let y = bbox.ymin.min(self.height());
        let width = bbox.width().min(self.width() - x);
        let height = bbox.height().min(self.height() - y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(imageops::crop_imm(&self.image, x, y, width, height).to_image())
    }
}
