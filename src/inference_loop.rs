//! The top-level loop: warm up, stream, tick until told to stop or broken.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::artifact::{ArtifactStore, ObjectStore};
use crate::config::EdgelensConfig;
use crate::detect::{BackendRegistry, DetectorBackend};
use crate::display::FrameSink;
use crate::error::EdgeError;
use crate::ingest::{open_source, FrameSource};
use crate::pipeline::{DetectionPipeline, TickContext, TickReport};
use crate::telemetry::{MessageChannel, TelemetryPublisher};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Counters accumulated across ticks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub detections: u64,
    pub uploads: u64,
    pub upload_failures: u64,
}

impl LoopStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.detections += report.qualifying as u64;
        self.uploads += report.uploads as u64;
        self.upload_failures += report.upload_failures as u64;
    }
}

/// Owns every collaborator for the life of the process.
pub struct InferenceLoop {
    pipeline: DetectionPipeline,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    sink: FrameSink,
    artifacts: ArtifactStore,
    telemetry: TelemetryPublisher,
    running: Arc<AtomicBool>,
    max_ticks: Option<u64>,
    stats: LoopStats,
}

impl InferenceLoop {
    pub fn new(
        pipeline: DetectionPipeline,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        sink: FrameSink,
        artifacts: ArtifactStore,
        telemetry: TelemetryPublisher,
    ) -> Self {
        Self {
            pipeline,
            source,
            detector,
            sink,
            artifacts,
            telemetry,
            running: Arc::new(AtomicBool::new(true)),
            max_ticks: None,
            stats: LoopStats::default(),
        }
    }

    /// Assemble a loop from configuration. The telemetry channel and object
    /// store are injected so callers choose broker and storage.
    pub fn from_config(
        cfg: &EdgelensConfig,
        channel: Box<dyn MessageChannel>,
        store: Box<dyn ObjectStore>,
    ) -> Result<Self> {
        let telemetry = TelemetryPublisher::new(channel, cfg.topic());
        let detector = BackendRegistry::with_defaults().build(&cfg.detection)?;
        let source = open_source(&cfg.source_url)?;
        let sink = FrameSink::new(&cfg.display)?;
        let artifacts = ArtifactStore::new(store, &cfg.artifacts);
        log::info!(
            "device {} publishing to {}; source {}; backend {}; preview {} at {}",
            cfg.device_id,
            telemetry.topic(),
            cfg.source_url,
            detector.name(),
            sink.resolution(),
            sink.fifo_path().display()
        );
        Ok(Self::new(
            DetectionPipeline::new(&cfg.detection),
            source,
            detector,
            sink,
            artifacts,
            telemetry,
        ))
    }

    /// Stop cleanly after `ticks` ticks.
    pub fn with_tick_limit(mut self, ticks: Option<u64>) -> Self {
        self.max_ticks = ticks;
        self
    }

    /// Flag that keeps the loop going; clear it to request shutdown.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Run until a fatal error, the tick limit, or shutdown.
    ///
    /// A fatal error is published once on the telemetry topic, the preview
    /// sink is stopped, and the error is returned. Telemetry is flushed on
    /// every exit path.
    pub fn run(&mut self) -> Result<LoopStats> {
        if let Err(e) = self.prepare() {
            return Err(self.fail(e));
        }

        let mut last_health = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            if self.max_ticks.map_or(false, |max| self.stats.ticks >= max) {
                log::info!("tick limit {} reached", self.stats.ticks);
                break;
            }

            let mut ctx = TickContext {
                source: self.source.as_mut(),
                detector: self.detector.as_mut(),
                sink: &self.sink,
                artifacts: &self.artifacts,
                telemetry: &self.telemetry,
            };
            match self.pipeline.tick(&mut ctx) {
                Ok(report) => self.stats.absorb(&report),
                Err(e) => return Err(self.fail(e)),
            }

            if last_health.elapsed() >= HEALTH_INTERVAL {
                self.log_health();
                last_health = Instant::now();
            }
        }

        self.sink.stop();
        self.telemetry.close();
        log::info!(
            "inference loop stopped after {} tick(s); {} upload(s), {} failure(s)",
            self.stats.ticks,
            self.stats.uploads,
            self.stats.upload_failures
        );
        Ok(self.stats.clone())
    }

    fn prepare(&mut self) -> Result<()> {
        self.telemetry.info("Loading detection model");
        log::info!("warming up {} backend", self.detector.name());
        self.detector
            .warm_up()
            .map_err(|e| EdgeError::Detector(format!("warm-up failed: {:#}", e)))?;
        self.telemetry.info("Detection model loaded");

        self.source
            .connect()
            .map_err(|e| EdgeError::FrameUnavailable(format!("connect failed: {:#}", e)))?;
        self.sink.start()?;
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        log::error!("inference loop failed: {:#}", err);
        self.telemetry.fatal(&err);
        self.sink.stop();
        self.telemetry.close();
        err
    }

    fn log_health(&self) {
        let source = self.source.stats();
        log::info!(
            "health: ticks={} detections={} uploads={} upload_failures={} frames={} source_healthy={} previews={}",
            self.stats.ticks,
            self.stats.detections,
            self.stats.uploads,
            self.stats.upload_failures,
            source.frames_captured,
            self.source.is_healthy(),
            self.sink.frames_set()
        );
    }
}
