//! Downstream review of published result records.
//!
//! Records whose probability falls below the recognition threshold lose their
//! uploaded artifact. Notices and records without an artifact are ignored.

use anyhow::Result;
use serde::Deserialize;

use crate::artifact::ObjectStore;
use crate::config::ReviewSettings;

/// What to do with a published record.
#[derive(Clone, Debug, PartialEq)]
pub enum ReviewDecision {
    Keep { probability: f64 },
    Discard { bucket: String, key: String, probability: f64 },
    Skip,
}

#[derive(Clone, Debug)]
pub struct ReviewPolicy {
    /// Record key holding the probability to judge.
    pub label: String,
    pub recognition_threshold: f64,
}

impl ReviewPolicy {
    pub fn new(label: impl Into<String>, settings: &ReviewSettings) -> Self {
        Self {
            label: label.into(),
            recognition_threshold: settings.recognition_threshold,
        }
    }

    pub fn decide(&self, artifact: &RecordArtifact) -> ReviewDecision {
        if artifact.probability >= self.recognition_threshold {
            ReviewDecision::Keep {
                probability: artifact.probability,
            }
        } else {
            ReviewDecision::Discard {
                bucket: artifact.bucket.clone(),
                key: artifact.key.clone(),
                probability: artifact.probability,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactFields {
    image_bucket: Option<String>,
    image_key: Option<String>,
}

/// A published record that carries an uploaded artifact.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordArtifact {
    pub probability: f64,
    pub bucket: String,
    pub key: String,
}

/// Pull the probability under `label` and the artifact location out of a
/// telemetry payload. Notices and records without an artifact yield `None`.
pub fn parse_record(payload: &[u8], label: &str) -> Option<RecordArtifact> {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(payload)
    else {
        return None;
    };
    let probability = map.get(label).and_then(|v| v.as_f64())?;
    let fields: ArtifactFields = match serde_json::from_value(serde_json::Value::Object(map)) {
        Ok(fields) => fields,
        Err(e) => {
            log::debug!("record has malformed artifact fields: {}", e);
            return None;
        }
    };
    Some(RecordArtifact {
        probability,
        bucket: fields.image_bucket?,
        key: fields.image_key?,
    })
}

/// Decide on one telemetry payload.
pub fn review_record(payload: &[u8], policy: &ReviewPolicy) -> ReviewDecision {
    match parse_record(payload, &policy.label) {
        Some(artifact) => policy.decide(&artifact),
        None => ReviewDecision::Skip,
    }
}

/// Carry out `decision`; only `Discard` touches the store.
pub fn apply_decision(store: &dyn ObjectStore, decision: &ReviewDecision) -> Result<()> {
    if let ReviewDecision::Discard {
        bucket,
        key,
        probability,
    } = decision
    {
        log::info!("discarding {}/{} ({:.4} below threshold)", bucket, key, probability);
        store.delete(bucket, key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryObjectStore;

    fn policy() -> ReviewPolicy {
        ReviewPolicy::new(
            "face",
            &ReviewSettings {
                recognition_threshold: 0.90,
            },
        )
    }

    #[test]
    fn confident_record_is_kept() {
        let payload = br#"{"face":0.93,"image_bucket":"b","image_key":"faces/x.png","image_size":10}"#;
        assert_eq!(
            review_record(payload, &policy()),
            ReviewDecision::Keep { probability: 0.93 }
        );
        let at_threshold = br#"{"face":0.9,"image_bucket":"b","image_key":"k"}"#;
        assert!(matches!(
            review_record(at_threshold, &policy()),
            ReviewDecision::Keep { .. }
        ));
    }

    #[test]
    fn weak_record_is_discarded_and_deleted() {
        let store = MemoryObjectStore::new();
        store.put("b", "faces/x.png", b"png").unwrap();
        let payload = br#"{"face":0.8,"image_bucket":"b","image_key":"faces/x.png"}"#;
        let decision = review_record(payload, &policy());
        assert_eq!(
            decision,
            ReviewDecision::Discard {
                bucket: "b".to_string(),
                key: "faces/x.png".to_string(),
                probability: 0.8,
            }
        );
        apply_decision(&store, &decision).unwrap();
        assert!(store.get("b", "faces/x.png").is_none());
    }

    #[test]
    fn parse_record_reads_label_and_artifact() {
        let payload = br#"{"face":0.97,"image_bucket":"b","image_key":"faces/y.png","image_size":4}"#;
        assert_eq!(
            parse_record(payload, "face"),
            Some(RecordArtifact {
                probability: 0.97,
                bucket: "b".to_string(),
                key: "faces/y.png".to_string(),
            })
        );
        assert_eq!(parse_record(payload, "person"), None);
    }

    #[test]
    fn notices_and_bare_records_are_skipped() {
        assert_eq!(review_record(b"INFO: Loading detection model", &policy()), ReviewDecision::Skip);
        assert_eq!(review_record(b"{}", &policy()), ReviewDecision::Skip);
        assert_eq!(review_record(br#"{"face":0.5}"#, &policy()), ReviewDecision::Skip);
        assert_eq!(
            review_record(br#"{"face":0.5,"image_bucket":7,"image_key":"k"}"#, &policy()),
            ReviewDecision::Skip
        );
    }
}
