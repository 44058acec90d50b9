//! HTTP camera source.
//!
//! Handles cameras that serve either a multipart MJPEG stream or a single
//! JPEG per request, chosen from the response `Content-Type` at connect time.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};
use url::Url;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpSource {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl HttpSource {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("invalid camera url '{}'", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported camera scheme '{}'; expected http(s)",
                parsed.scheme()
            ));
        }
        Ok(Self {
            url: url.to_string(),
            agent: ureq::AgentBuilder::new().timeout_read(READ_TIMEOUT).build(),
            stream: None,
            connected_at: None,
            last_frame_at: None,
            frame_count: 0,
        })
    }
}

impl FrameSource for HttpSource {
    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to camera {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = Some(if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::Snapshot
        });
        self.connected_at = Some(Instant::now());
        log::info!("http source {} connected ({})", self.url, content_type);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let jpeg = match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg()?,
            Some(HttpStream::Snapshot) => fetch_snapshot(&self.agent, &self.url)?,
            None => return Err(anyhow!("http source not connected; call connect() first")),
        };
        let image = image::load_from_memory(&jpeg).context("decode jpeg")?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Frame::from_image(image.into_rgb8()))
    }

    fn is_healthy(&self) -> bool {
        match (self.connected_at, self.last_frame_at) {
            (None, _) => false,
            (Some(connected_at), None) => connected_at.elapsed() <= Duration::from_secs(5),
            (Some(_), Some(last)) => last.elapsed() <= READ_TIMEOUT,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Splits a multipart MJPEG body into JPEGs by SOI/EOI markers; part headers
/// and boundaries are skipped implicitly.
struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([10, 200, 30]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&image)
            .unwrap();
        out
    }

    #[test]
    fn finds_jpeg_between_part_headers() {
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let start = body.len();
        body.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        body.extend_from_slice(b"\r\n--frame\r\n");
        assert_eq!(find_jpeg_bounds(&body), Some((start, start + 7)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2]), None);
    }

    #[test]
    fn mjpeg_stream_yields_consecutive_frames() {
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg(16, 8));
            body.extend_from_slice(b"\r\n");
        }
        let mut stream = MjpegStream::new(Box::new(std::io::Cursor::new(body)));
        for _ in 0..2 {
            let bytes = stream.read_next_jpeg().unwrap();
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (16, 8));
        }
        assert!(stream.read_next_jpeg().is_err());
    }

    #[test]
    fn unconnected_source_errors() {
        let mut source = HttpSource::new("http://127.0.0.1:81/capture").unwrap();
        assert!(source.next_frame().is_err());
        assert!(!source.is_healthy());
        assert!(HttpSource::new("udp://127.0.0.1:5000").is_err());
    }
}
