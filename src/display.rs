//! Live preview sink.
//!
//! `FrameSink` keeps the most recent annotated frame as an encoded JPEG in a
//! single-slot buffer and runs a streaming worker that writes that buffer
//! into a FIFO over and over. Viewers attach by opening the FIFO, e.g.
//! `mplayer -demuxer lavf -lavfdopts format=mjpeg:probesize=32 /tmp/results.mjpeg`.
//!
//! The producer only ever swaps the buffer; the blocking FIFO write happens on
//! the worker thread with the lock released, so a slow or absent viewer never
//! stalls the inference loop. Frames the viewer does not read are dropped.
//!
//! Known limitation: `stop()` is observed between writes. A write blocked on a
//! stalled (attached but not reading) viewer cannot be interrupted.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::DisplaySettings;
use crate::error::EdgeError;
use crate::frame::Frame;

/// How often the worker re-checks for a viewer while none is attached.
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `stop()` waits for the worker before detaching it.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Supported preview resolutions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    P1080,
    P720,
    P480,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Self::P1080, Self::P720, Self::P480];

    /// Output `(width, height)` in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::P1080 => (1920, 1080),
            Self::P720 => (1280, 720),
            Self::P480 => (858, 480),
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
        }
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|res| res.key() == s.trim().to_lowercase())
            .ok_or_else(|| {
                EdgeError::InvalidConfiguration(format!(
                    "invalid resolution '{}': expected 1080p, 720p or 480p",
                    s
                ))
                .into()
            })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Latest encoded frame. The lock is held only to swap or clone the handle.
type DisplayBuffer = Arc<Mutex<Arc<[u8]>>>;

/// Single-slot, overwrite-on-write preview sink with its streaming worker.
pub struct FrameSink {
    resolution: Resolution,
    fifo_path: PathBuf,
    jpeg_quality: u8,
    buffer: DisplayBuffer,
    stop: Arc<AtomicBool>,
    frames_set: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl FrameSink {
    /// Build a sink showing a white placeholder until the first `set_frame`.
    pub fn new(settings: &DisplaySettings) -> Result<Self> {
        let (width, height) = settings.resolution.dimensions();
        let placeholder = encode_jpeg(
            &Frame::filled(width, height, [255, 255, 255]),
            settings.jpeg_quality,
        )?;
        Ok(Self {
            resolution: settings.resolution,
            fifo_path: settings.fifo_path.clone(),
            jpeg_quality: settings.jpeg_quality,
            buffer: Arc::new(Mutex::new(placeholder.into())),
            stop: Arc::new(AtomicBool::new(false)),
            frames_set: AtomicU64::new(0),
            worker: None,
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn fifo_path(&self) -> &Path {
        &self.fifo_path
    }

    /// Number of successful `set_frame` calls.
    pub fn frames_set(&self) -> u64 {
        self.frames_set.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Create the FIFO if needed and spawn the streaming worker.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(anyhow!("frame sink already started"));
        }
        ensure_fifo(&self.fifo_path)?;
        self.stop.store(false, Ordering::SeqCst);

        let path = self.fifo_path.clone();
        let buffer = Arc::clone(&self.buffer);
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name("frame-sink".to_string())
            .spawn(move || stream_loop(&path, &buffer, &stop))
            .map_err(|e| anyhow!("failed to spawn frame sink worker: {}", e))?;
        self.worker = Some(handle);
        log::info!(
            "frame sink streaming {} to {}",
            self.resolution,
            self.fifo_path.display()
        );
        Ok(())
    }

    /// Resize, encode and publish `frame` as the latest preview frame.
    pub fn set_frame(&self, frame: &Frame) -> Result<()> {
        let (width, height) = self.resolution.dimensions();
        let resized = Frame::from_image(imageops::resize(
            frame.image(),
            width,
            height,
            FilterType::Triangle,
        ));
        let jpeg: Arc<[u8]> = encode_jpeg(&resized, self.jpeg_quality)?.into();
        let mut guard = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        *guard = jpeg;
        drop(guard);
        self.frames_set.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current encoded frame.
    pub fn latest(&self) -> Arc<[u8]> {
        snapshot(&self.buffer)
    }

    /// Signal the worker to exit after its current write.
    ///
    /// Returns `true` when the worker was joined, `false` when it is still
    /// blocked in a write and was detached.
    pub fn stop(&mut self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.worker.take() else {
            return true;
        };
        let deadline = Instant::now() + STOP_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                log::warn!("frame sink worker panicked");
            }
            true
        } else {
            log::warn!(
                "frame sink worker still blocked writing to {}; detaching",
                self.fifo_path.display()
            );
            false
        }
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn snapshot(buffer: &DisplayBuffer) -> Arc<[u8]> {
    let guard = buffer.lock().unwrap_or_else(|p| p.into_inner());
    Arc::clone(&guard)
}

fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(frame.image())
        .map_err(|e| EdgeError::Encoding(e.to_string()))?;
    Ok(out)
}

fn stream_loop(path: &Path, buffer: &DisplayBuffer, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let mut fifo = match open_when_consumer(path, stop) {
            Ok(Some(fifo)) => fifo,
            Ok(None) => break,
            Err(e) => {
                log::error!("frame sink cannot open {}: {}", path.display(), e);
                break;
            }
        };
        log::info!("viewer attached to {}", path.display());

        while !stop.load(Ordering::SeqCst) {
            let frame = snapshot(buffer);
            match fifo.write_all(&frame) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    log::info!("viewer detached from {}", path.display());
                    break;
                }
                Err(e) => {
                    log::warn!("frame sink write to {} failed: {}", path.display(), e);
                    break;
                }
            }
        }
    }
    log::debug!("frame sink worker exiting");
}

#[cfg(unix)]
fn ensure_fifo(path: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            return Err(anyhow!(
                "{} exists and is not a FIFO",
                path.display()
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(anyhow!("failed to stat {}: {}", path.display(), e)),
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow!("failed to create {}: {}", parent.display(), e))?;
    }
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| anyhow!("fifo path contains a NUL byte"))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(anyhow!("mkfifo {} failed: {}", path.display(), err));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_fifo(_path: &Path) -> Result<()> {
    Err(anyhow!("FIFO preview streaming requires a unix platform"))
}

/// Open the FIFO for writing once a viewer has it open for reading.
///
/// A non-blocking open fails with ENXIO while there is no reader, which lets
/// the worker keep honouring `stop` instead of parking inside `open(2)`.
#[cfg(unix)]
fn open_when_consumer(path: &Path, stop: &AtomicBool) -> Result<Option<std::fs::File>> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    while !stop.load(Ordering::SeqCst) {
        match std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                let fd = file.as_raw_fd();
                // SAFETY: fd is owned by `file` and stays open across both calls.
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                if flags < 0
                    || unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0
                {
                    return Err(std::io::Error::last_os_error().into());
                }
                return Ok(Some(file));
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                std::thread::sleep(CONSUMER_POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

#[cfg(not(unix))]
fn open_when_consumer(path: &Path, _stop: &AtomicBool) -> Result<Option<std::fs::File>> {
    Err(anyhow!("cannot stream to {} on this platform", path.display()))
}
