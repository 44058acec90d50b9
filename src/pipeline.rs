//! One detection tick: acquire, infer, annotate, crop, upload, publish.
//!
//! Ticks share no state. Everything a tick touches is lent to it through a
//! `TickContext`; the pipeline itself only holds detection settings.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::annotate::draw_detection;
use crate::artifact::{new_artifact_id, ArtifactStore};
use crate::config::DetectionSettings;
use crate::detect::{Detection, DetectorBackend, ModelType};
use crate::display::FrameSink;
use crate::error::{classify, EdgeError};
use crate::frame::Frame;
use crate::geometry::{rescale, Scale};
use crate::ingest::FrameSource;
use crate::telemetry::{ResultRecord, TelemetryPublisher};

/// Collaborators borrowed for a single tick.
pub struct TickContext<'a> {
    pub source: &'a mut dyn FrameSource,
    pub detector: &'a mut dyn DetectorBackend,
    pub sink: &'a FrameSink,
    pub artifacts: &'a ArtifactStore,
    pub telemetry: &'a TelemetryPublisher,
}

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    /// The record that was published.
    pub record: ResultRecord,
    pub detections: usize,
    /// Detections strictly above the threshold.
    pub qualifying: usize,
    pub uploads: usize,
    pub upload_failures: usize,
    /// Qualifying detections whose box clamped to nothing.
    pub degenerate: usize,
}

pub struct DetectionPipeline {
    model_type: ModelType,
    threshold: f64,
    input_width: u32,
    input_height: u32,
    labels: BTreeMap<u32, String>,
}

impl DetectionPipeline {
    pub fn new(settings: &DetectionSettings) -> Self {
        Self {
            model_type: settings.model_type,
            threshold: settings.threshold,
            input_width: settings.input_width,
            input_height: settings.input_height,
            labels: settings.labels.clone(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Record key for a model label id; unknown ids become `label_<id>`.
    pub fn label_name(&self, label: u32) -> String {
        match self.labels.get(&label) {
            Some(name) => name.clone(),
            None => {
                log::warn!("model emitted unmapped label {}", label);
                format!("label_{}", label)
            }
        }
    }

    /// Run one tick.
    ///
    /// Frame and detector failures come back as `FrameUnavailable` and
    /// `Detector` errors; the caller treats every returned error as fatal.
    /// Staging and upload failures are handled here.
    pub fn tick(&self, ctx: &mut TickContext<'_>) -> Result<TickReport> {
        let frame = ctx
            .source
            .next_frame()
            .map_err(|e| EdgeError::FrameUnavailable(format!("{:#}", e)))?;
        let detections = self.detect(ctx.detector, &frame)?;

        let (native_width, native_height) = (frame.width(), frame.height());
        let scale = Scale::between(native_width, native_height, self.input_width, self.input_height);
        let mut display = frame.clone();
        let mut report = TickReport {
            detections: detections.len(),
            ..TickReport::default()
        };

        for det in detections.iter().filter(|d| d.probability > self.threshold) {
            report.qualifying += 1;
            let bbox = rescale(det.bbox, scale, native_width, native_height);
            draw_detection(display.image_mut(), &bbox, det.probability);

            // Crops come from the unannotated frame.
            match frame.crop(&bbox) {
                Some(crop) => {
                    let id = new_artifact_id();
                    match ctx.artifacts.stage_and_upload(&crop, &id) {
                        Ok(meta) => {
                            report.record.attach_artifact(&meta);
                            report.uploads += 1;
                        }
                        Err(e) if classify(&e).map_or(false, EdgeError::is_per_detection) => {
                            log::warn!("artifact {} not stored: {:#}", id, e);
                            ctx.telemetry
                                .error(&format!("Error processing detection: {:#}", e));
                            report.upload_failures += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    log::debug!("box {:?} is empty after clamping; no artifact", bbox);
                    report.degenerate += 1;
                }
            }

            report
                .record
                .set_probability(&self.label_name(det.label), det.probability);
        }

        if let Err(e) = ctx.sink.set_frame(&display) {
            log::warn!("preview frame dropped: {:#}", e);
        }
        ctx.telemetry.publish_record(&report.record);
        Ok(report)
    }

    fn detect(&self, detector: &mut dyn DetectorBackend, frame: &Frame) -> Result<Vec<Detection>> {
        let input = frame.resized(self.input_width, self.input_height);
        let raw = detector
            .infer(&input)
            .map_err(|e| EdgeError::Detector(format!("{} inference: {:#}", detector.name(), e)))?;
        let detections = detector
            .parse(self.model_type, &raw)
            .map_err(|e| EdgeError::Detector(format!("{} parse: {:#}", detector.name(), e)))?;
        Ok(detections)
    }
}
