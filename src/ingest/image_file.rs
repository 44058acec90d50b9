//! Local image file source.
//!
//! A single image is replayed on every tick; a directory is cycled through in
//! file-name order. Only local paths are accepted.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageFileSource {
    path: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    frame_count: u64,
    last_error: Option<String>,
}

impl ImageFileSource {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(anyhow!("image source {} does not exist", path.display()));
        }
        Ok(Self {
            path,
            files: Vec::new(),
            cursor: 0,
            frame_count: 0,
            last_error: None,
        })
    }

    fn scan(&self) -> Result<Vec<PathBuf>> {
        if self.path.is_file() {
            return Ok(vec![self.path.clone()]);
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path)
            .with_context(|| format!("failed to list {}", self.path.display()))?
        {
            let candidate = entry?.path();
            if candidate.is_file() && has_image_extension(&candidate) {
                files.push(candidate);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageFileSource {
    fn connect(&mut self) -> Result<()> {
        self.files = self.scan()?;
        if self.files.is_empty() {
            return Err(anyhow!("no images found in {}", self.path.display()));
        }
        log::info!(
            "image source {} connected ({} file(s))",
            self.path.display(),
            self.files.len()
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if self.files.is_empty() {
            return Err(anyhow!("image source not connected; call connect() first"));
        }
        let path = &self.files[self.cursor % self.files.len()];
        self.cursor = (self.cursor + 1) % self.files.len();
        let decoded = image::open(path).with_context(|| format!("failed to decode {}", path.display()));
        let image = match decoded {
            Ok(image) => image,
            Err(e) => {
                self.last_error = Some(format!("{:#}", e));
                return Err(e);
            }
        };
        self.frame_count += 1;
        self.last_error = None;
        Ok(Frame::from_image(image.into_rgb8()))
    }

    fn is_healthy(&self) -> bool {
        !self.files.is_empty() && self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.path.display().to_string(),
        }
    }
}
