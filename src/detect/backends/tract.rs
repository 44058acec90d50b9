#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawInference;
use crate::frame::Frame;

/// Tract-based backend for ONNX SSD models.
///
/// Loads a local model file once and runs inference on RGB frames of the
/// configured input size. The first output is expected to be a
/// DetectionOutput tensor of shape `[1, 1, N, 7]`.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, input: &Frame) -> Result<Tensor> {
        if input.width() != self.width || input.height() != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                input.width(),
                input.height(),
                self.width,
                self.height
            ));
        }

        let pixels = input.pixels();
        let width = self.width as usize;
        let tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * 3 + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(tensor.into_tensor())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&mut self, input: &Frame) -> Result<RawInference> {
        let tensor = self.build_input(input)?;
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .iter()
            .map(|v| f64::from(*v))
            .collect();
        Ok(RawInference::new(values))
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(self.width, self.height, [0, 0, 0]);
        self.infer(&blank).map(|_| ())
    }
}
