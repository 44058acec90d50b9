//! Frame ingestion sources.
//!
//! The source is selected from its URL:
//! - `stub://name[?width=W&height=H&frames=N]` synthetic frames (tests, dry runs)
//! - `http(s)://...` single JPEG snapshots or a multipart MJPEG stream
//! - anything else is a local image file or a directory of images
//!
//! Sources produce native-resolution `Frame`s. A failing `next_frame` is fatal
//! to the inference loop, so sources do not retry internally.

pub mod http;
pub mod image_file;
pub mod synthetic;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use http::HttpSource;
pub use image_file::ImageFileSource;
pub use synthetic::SyntheticSource;

/// A camera or camera-like producer of frames.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

/// Frame counters for health logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Build the source named by `url`. The source is not connected yet.
pub fn open_source(url: &str) -> Result<Box<dyn FrameSource>> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("frame source url is empty"));
    }
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_url(url)?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpSource::new(url)?));
    }
    if url.contains("://") {
        return Err(anyhow!(
            "unsupported frame source '{}'; expected stub://, http(s):// or a local path",
            url
        ));
    }
    Ok(Box::new(ImageFileSource::new(url)?))
}
