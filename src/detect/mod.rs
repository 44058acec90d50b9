//! Detector backends.
//!
//! A backend runs inference on a frame already resized to its input size and
//! parses the raw output into `Detection`s in model-input pixel coordinates.
//! Rescaling into native frame space happens in the pipeline.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::BackendRegistry;
pub use result::{parse_ssd, Detection, ModelType, RawInference, SSD_ROW_LEN};
