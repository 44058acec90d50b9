use anyhow::Result;

use crate::detect::result::{parse_ssd, Detection, ModelType, RawInference};
use crate::frame::Frame;

/// Detector backend trait.
///
/// The loop owns exactly one backend for its whole lifetime and lends it to
/// the pipeline for each tick. Backends receive frames already resized to
/// `input_size()`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Fixed model input dimensions `(width, height)`.
    fn input_size(&self) -> (u32, u32);

    /// Run the model on a frame of `input_size()` pixels.
    fn infer(&mut self, input: &Frame) -> Result<RawInference>;

    /// Parse raw model output into detections in model-input coordinates.
    fn parse(&self, model_type: ModelType, raw: &RawInference) -> Result<Vec<Detection>> {
        let (width, height) = self.input_size();
        match model_type {
            ModelType::Ssd => parse_ssd(raw, width, height),
        }
    }

    /// Optional warm-up hook, called once before the first tick.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
