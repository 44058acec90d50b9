//! edgelens: on-device video inference loop.
//!
//! Each tick grabs a frame from a camera, runs an object detector on a resized
//! copy, draws the confident detections onto a preview copy, uploads a crop of
//! every confident detection to object storage, and publishes a per-frame
//! result record over MQTT. A background worker streams the annotated preview
//! as MJPEG into a local FIFO.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (synthetic, image files, HTTP cameras)
//! - `detect`: detector backends and SSD output parsing
//! - `geometry`, `annotate`: box rescaling and overlays
//! - `display`: the FIFO preview sink
//! - `artifact`: crop staging and object storage
//! - `telemetry`, `transport`: result publishing over MQTT
//! - `pipeline`, `inference_loop`: the per-tick algorithm and the loop around it
//! - `review`, `identify`: downstream filtering and identification of
//!   published records

pub mod annotate;
pub mod artifact;
pub mod config;
pub mod detect;
pub mod display;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod identify;
pub mod inference_loop;
pub mod ingest;
pub mod pipeline;
pub mod review;
pub mod telemetry;
pub mod transport;

pub use artifact::{
    new_artifact_id, ArtifactMetadata, ArtifactStore, HttpObjectStore, MemoryObjectStore,
    ObjectStore,
};
pub use config::EdgelensConfig;
pub use detect::{BackendRegistry, Detection, DetectorBackend, ModelType, StubBackend};
pub use display::{FrameSink, Resolution};
pub use error::EdgeError;
pub use frame::Frame;
pub use geometry::{rescale, BoundingBox, RescaledBox, Scale};
pub use identify::{FaceMatcher, Identification, Identifier, ThumbnailMatcher};
pub use inference_loop::{InferenceLoop, LoopStats};
pub use ingest::{open_source, FrameSource, SourceStats};
pub use pipeline::{DetectionPipeline, TickContext, TickReport};
pub use review::{
    apply_decision, parse_record, review_record, RecordArtifact, ReviewDecision, ReviewPolicy,
};
pub use telemetry::{LogChannel, MemoryChannel, MessageChannel, ResultRecord, TelemetryPublisher};
