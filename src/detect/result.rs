use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::geometry::BoundingBox;

/// Values per SSD detection row: `[image_id, label, confidence, xmin, ymin, xmax, ymax]`.
pub const SSD_ROW_LEN: usize = 7;

/// One detected object in model-input pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: u32,
    pub probability: f64,
    pub bbox: BoundingBox,
}

/// Output layout selector used when parsing raw inference results.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// Single-shot detector with a DetectionOutput layer.
    #[default]
    Ssd,
}

impl FromStr for ModelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ssd" => Ok(Self::Ssd),
            other => Err(anyhow!("unknown model type '{}': expected 'ssd'", other)),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssd => write!(f, "ssd"),
        }
    }
}

/// Flat model output tensor.
#[derive(Clone, Debug, Default)]
pub struct RawInference {
    pub values: Vec<f64>,
}

impl RawInference {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

/// Parse SSD DetectionOutput rows with normalized coordinates.
///
/// Rows with a negative image id are padding and end the valid region.
pub fn parse_ssd(raw: &RawInference, input_width: u32, input_height: u32) -> Result<Vec<Detection>> {
    if raw.values.len() % SSD_ROW_LEN != 0 {
        return Err(anyhow!(
            "ssd output length {} is not a multiple of {}",
            raw.values.len(),
            SSD_ROW_LEN
        ));
    }

    let width = f64::from(input_width);
    let height = f64::from(input_height);
    let mut detections = Vec::new();
    for row in raw.values.chunks_exact(SSD_ROW_LEN) {
        if row[0] < 0.0 {
            break;
        }
        if !row.iter().all(|v| v.is_finite()) || row[1] < 0.0 {
            log::debug!("skipping malformed ssd row {:?}", row);
            continue;
        }
        detections.push(Detection {
            label: row[1] as u32,
            probability: row[2].clamp(0.0, 1.0),
            bbox: BoundingBox::new(
                (row[3] * width).floor() as i32,
                (row[4] * height).floor() as i32,
                (row[5] * width).floor() as i32,
                (row[6] * height).floor() as i32,
            ),
        });
    }
    Ok(detections)
}
