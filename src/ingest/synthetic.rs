//! Synthetic frame source (`stub://`).

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 858;
const DEFAULT_HEIGHT: u32 = 480;

/// Generates a moving gradient at a fixed size.
///
/// Query parameters: `width`, `height`, and `frames` (the stream ends after
/// that many frames, which the loop treats as a lost camera).
pub struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    limit: Option<u64>,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            url: "stub://synthetic".to_string(),
            width,
            height,
            limit: None,
            frame_count: 0,
            connected: false,
        }
    }

    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid stub source '{}'", raw))?;
        let mut source = Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT);
        source.url = raw.to_string();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => source.width = parse_dimension(&key, &value)?,
                "height" => source.height = parse_dimension(&key, &value)?,
                "frames" => {
                    source.limit = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid frames '{}'", value))?,
                    )
                }
                other => log::warn!("ignoring unknown stub parameter '{}'", other),
            }
        }
        Ok(source)
    }

    /// End the stream after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn render(&self) -> Frame {
        let shift = self.frame_count as u32;
        let image = image::RgbImage::from_fn(self.width, self.height, |x, y| {
            image::Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                ((x + y) % 256) as u8,
            ])
        });
        Frame::from_image(image)
    }
}

fn parse_dimension(key: &str, value: &str) -> Result<u32> {
    let parsed: u32 = value
        .parse()
        .with_context(|| format!("invalid {} '{}'", key, value))?;
    if parsed == 0 {
        return Err(anyhow!("{} must be non-zero", key));
    }
    Ok(parsed)
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "synthetic source {} connected ({}x{})",
            self.url,
            self.width,
            self.height
        );
        self.connected = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        if let Some(limit) = self.limit {
            if self.frame_count >= limit {
                return Err(anyhow!("synthetic stream ended after {} frames", limit));
            }
        }
        let frame = self.render();
        self.frame_count += 1;
        Ok(frame)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parameters_set_size_and_limit() {
        let mut source = SyntheticSource::from_url("stub://cam?width=64&height=32&frames=2").unwrap();
        source.connect().unwrap();
        let frame = source.next_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 32));
        source.next_frame().unwrap();
        assert!(source.next_frame().is_err());
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[test]
    fn frames_change_between_ticks() {
        let mut source = SyntheticSource::new(16, 16);
        source.connect().unwrap();
        let a = source.next_frame().unwrap();
        let b = source.next_frame().unwrap();
        assert_ne!(a.pixels(), b.pixels());
    }

    #[test]
    fn requires_connect() {
        let mut source = SyntheticSource::new(16, 16);
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(SyntheticSource::from_url("stub://cam?width=0").is_err());
    }
}
