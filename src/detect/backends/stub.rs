use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, RawInference, SSD_ROW_LEN};
use crate::frame::Frame;

/// Stub backend for testing and dry runs.
///
/// Replays a script of per-frame detections, cycling when it runs out. Each
/// script entry is emitted as SSD rows so the normal parse path runs.
pub struct StubBackend {
    width: u32,
    height: u32,
    script: Vec<Vec<Detection>>,
    cursor: usize,
}

impl StubBackend {
    /// Backend that never detects anything.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            script: Vec::new(),
            cursor: 0,
        }
    }

    pub fn with_script(mut self, script: Vec<Vec<Detection>>) -> Self {
        self.script = script;
        self.cursor = 0;
        self
    }

    fn encode(&self, detections: &[Detection]) -> RawInference {
        let width = f64::from(self.width.max(1));
        let height = f64::from(self.height.max(1));
        let mut values = Vec::with_capacity(detections.len() * SSD_ROW_LEN);
        for det in detections {
            // Half-pixel offset so the parser's floor lands back on the
            // scripted integer coordinate.
            values.extend_from_slice(&[
                0.0,
                f64::from(det.label),
                det.probability,
                (det.bbox.xmin as f64 + 0.5) / width,
                (det.bbox.ymin as f64 + 0.5) / height,
                (det.bbox.xmax as f64 + 0.5) / width,
                (det.bbox.ymax as f64 + 0.5) / height,
            ]);
        }
        RawInference::new(values)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&mut self, input: &Frame) -> Result<RawInference> {
        if (input.width(), input.height()) != (self.width, self.height) {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                input.width(),
                input.height(),
                self.width,
                self.height
            ));
        }
        if self.script.is_empty() {
            return Ok(RawInference::default());
        }
        let raw = self.encode(&self.script[self.cursor]);
        self.cursor = (self.cursor + 1) % self.script.len();
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ModelType;
    use crate::geometry::BoundingBox;

    fn face(probability: f64, bbox: BoundingBox) -> Detection {
        Detection {
            label: 1,
            probability,
            bbox,
        }
    }

    #[test]
    fn scripted_detections_survive_parse() {
        let script = vec![vec![
            face(0.5, BoundingBox::new(10, 10, 50, 50)),
            face(0.25, BoundingBox::new(0, 7, 299, 300)),
        ]];
        let mut backend = StubBackend::new(300, 300).with_script(script.clone());
        let raw = backend.infer(&Frame::filled(300, 300, [0, 0, 0])).unwrap();
        let parsed = backend.parse(ModelType::Ssd, &raw).unwrap();
        assert_eq!(parsed, script[0]);
    }

    #[test]
    fn negative_coordinates_survive_parse() {
        let script = vec![vec![face(0.5, BoundingBox::new(-20, -1, 40, 60))]];
        let mut backend = StubBackend::new(300, 300).with_script(script.clone());
        let raw = backend.infer(&Frame::filled(300, 300, [0, 0, 0])).unwrap();
        assert_eq!(backend.parse(ModelType::Ssd, &raw).unwrap(), script[0]);
    }

    #[test]
    fn script_cycles() {
        let script = vec![vec![face(0.5, BoundingBox::new(1, 1, 2, 2))], vec![]];
        let mut backend = StubBackend::new(300, 300).with_script(script);
        let input = Frame::filled(300, 300, [0, 0, 0]);
        let counts: Vec<usize> = (0..4)
            .map(|_| {
                let raw = backend.infer(&input).unwrap();
                backend.parse(ModelType::Ssd, &raw).unwrap().len()
            })
            .collect();
        assert_eq!(counts, vec![1, 0, 1, 0]);
    }

    #[test]
    fn rejects_unresized_frames() {
        let mut backend = StubBackend::new(300, 300);
        assert!(backend.infer(&Frame::filled(640, 480, [0, 0, 0])).is_err());
    }
}
