//! Best-effort publishing of per-frame results and notices.
//!
//! Nothing in here can fail a tick: channel errors are logged at warn and
//! dropped.

use anyhow::Result;
use serde_json::{Map, Number, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::artifact::ArtifactMetadata;

pub const INFO_PREFIX: &str = "INFO: ";
pub const ERROR_PREFIX: &str = "ERROR: ";
pub const FATAL_PREFIX: &str = "Error in inference loop: ";
pub const MATCH_PREFIX: &str = "MATCH: ";

/// Outbound message transport.
pub trait MessageChannel: Send {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Deliver anything still queued and release the transport.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-frame result: label name to probability, plus `image_*` fields for
/// the most recent uploaded artifact.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultRecord {
    fields: Map<String, Value>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repeated labels overwrite: the last detection wins.
    pub fn set_probability(&mut self, label: &str, probability: f64) {
        let value = Number::from_f64(probability)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.fields.insert(label.to_string(), value);
    }

    pub fn attach_artifact(&mut self, meta: &ArtifactMetadata) {
        self.fields
            .insert("image_size".to_string(), Value::from(meta.size_bytes));
        self.fields
            .insert("image_bucket".to_string(), Value::from(meta.bucket.clone()));
        self.fields
            .insert("image_key".to_string(), Value::from(meta.key.clone()));
    }

    pub fn probability(&self, label: &str) -> Option<f64> {
        self.fields.get(label).and_then(Value::as_f64)
    }

    pub fn has_artifact(&self) -> bool {
        self.fields.contains_key("image_key")
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Publishes records and notices to one topic.
pub struct TelemetryPublisher {
    channel: Box<dyn MessageChannel>,
    topic: String,
}

impl TelemetryPublisher {
    pub fn new(channel: Box<dyn MessageChannel>, topic: impl Into<String>) -> Self {
        Self {
            channel,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn publish(&self, payload: &[u8]) {
        if let Err(e) = self.channel.publish(&self.topic, payload) {
            log::warn!("failed to publish to {}: {:#}", self.topic, e);
        }
    }

    pub fn publish_record(&self, record: &ResultRecord) {
        match serde_json::to_vec(&record.to_json()) {
            Ok(payload) => self.publish(&payload),
            Err(e) => log::warn!("failed to serialize result record: {}", e),
        }
    }

    pub fn info(&self, message: &str) {
        self.publish(format!("{}{}", INFO_PREFIX, message).as_bytes());
    }

    pub fn error(&self, message: &str) {
        self.publish(format!("{}{}", ERROR_PREFIX, message).as_bytes());
    }

    pub fn fatal(&self, cause: &anyhow::Error) {
        self.publish(format!("{}{:#}", FATAL_PREFIX, cause).as_bytes());
    }

    pub fn matched(&self, message: &str) {
        self.publish(format!("{}{}", MATCH_PREFIX, message).as_bytes());
    }

    /// Flush the channel before exit. Failures are logged only.
    pub fn close(&self) {
        if let Err(e) = self.channel.close() {
            log::warn!("failed to flush telemetry for {}: {:#}", self.topic, e);
        }
    }
}

/// Writes payloads to the log instead of a broker.
#[derive(Default)]
pub struct LogChannel;

impl MessageChannel for LogChannel {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        log::info!("[{}] {}", topic, String::from_utf8_lossy(payload));
        Ok(())
    }
}

/// A payload captured by `MemoryChannel`.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// The payload as a JSON object, if it is one.
    pub fn json(&self) -> Option<Map<String, Value>> {
        match serde_json::from_slice(&self.payload).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

/// Captures publishes in memory. Clones share the capture buffer.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    published: Arc<Mutex<Vec<Published>>>,
    fail: Arc<Mutex<bool>>,
    closes: Arc<AtomicUsize>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Text payloads starting with `prefix`.
    pub fn notices(&self, prefix: &str) -> Vec<String> {
        self.published()
            .iter()
            .map(Published::text)
            .filter(|text| text.starts_with(prefix))
            .collect()
    }

    /// How many times the channel was closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.published().iter().filter_map(Published::json).collect()
    }
}

impl MessageChannel for MemoryChannel {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if *self.fail.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(anyhow::anyhow!("channel unavailable"));
        }
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
