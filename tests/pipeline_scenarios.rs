#![cfg(unix)]

use std::path::Path;

use edgelens::config::{ArtifactSettings, DetectionSettings, DisplaySettings};
use edgelens::error::classify;
use edgelens::ingest::SyntheticSource;
use edgelens::telemetry::{ERROR_PREFIX, FATAL_PREFIX, INFO_PREFIX};
use edgelens::{
    ArtifactStore, BoundingBox, Detection, DetectionPipeline, EdgeError, EdgelensConfig,
    FrameSink, InferenceLoop, MemoryChannel, MemoryObjectStore, Resolution, StubBackend,
    TelemetryPublisher,
};

struct Rig {
    tmp: tempfile::TempDir,
    store: MemoryObjectStore,
    channel: MemoryChannel,
}

impl Rig {
    fn new() -> Self {
        Self {
            tmp: tempfile::tempdir().expect("temp dir"),
            store: MemoryObjectStore::new(),
            channel: MemoryChannel::new(),
        }
    }

    fn staging_dir(&self) -> std::path::PathBuf {
        self.tmp.path().join("faces")
    }

    fn build(&self, source: SyntheticSource, detector: StubBackend) -> InferenceLoop {
        let detection = DetectionSettings::default();
        let sink = FrameSink::new(&DisplaySettings {
            resolution: Resolution::P480,
            fifo_path: self.tmp.path().join("results.mjpeg"),
            jpeg_quality: 80,
        })
        .expect("sink");
        let artifacts = ArtifactStore::new(
            Box::new(self.store.clone()),
            &ArtifactSettings {
                bucket: "edgelens-faces".to_string(),
                key_prefix: "faces".to_string(),
                staging_dir: self.staging_dir(),
                endpoint: "http://127.0.0.1:9000".to_string(),
                token: None,
            },
        );
        let telemetry = TelemetryPublisher::new(Box::new(self.channel.clone()), "devices/lens-01/infer");
        InferenceLoop::new(
            DetectionPipeline::new(&detection),
            Box::new(source),
            Box::new(detector),
            sink,
            artifacts,
            telemetry,
        )
    }
}

fn face(probability: f64, bbox: BoundingBox) -> Detection {
    Detection {
        label: 1,
        probability,
        bbox,
    }
}

fn two_faces() -> StubBackend {
    StubBackend::new(300, 300).with_script(vec![vec![
        face(0.90, BoundingBox::new(10, 10, 50, 50)),
        face(0.50, BoundingBox::new(60, 60, 100, 100)),
    ]])
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[test]
fn one_qualifying_detection_is_uploaded_and_published() {
    let rig = Rig::new();
    let mut inference = rig
        .build(SyntheticSource::new(858, 480), two_faces())
        .with_tick_limit(Some(1));

    let stats = inference.run().expect("loop runs");
    assert_eq!(stats.ticks, 1);
    assert_eq!(stats.uploads, 1);

    let records = rig.channel.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.len(), 4);
    assert_eq!(record.get("face").and_then(|v| v.as_f64()), Some(0.9));
    assert_eq!(
        record.get("image_bucket").and_then(|v| v.as_str()),
        Some("edgelens-faces")
    );
    let key = record
        .get("image_key")
        .and_then(|v| v.as_str())
        .expect("image_key");
    assert!(key.starts_with("faces/recognized_face_"));
    assert!(key.ends_with(".png"));

    let body = rig.store.get("edgelens-faces", key).expect("object uploaded");
    assert_eq!(
        record.get("image_size").and_then(|v| v.as_u64()),
        Some(body.len() as u64)
    );
    // (10,10)-(50,50) at 858/300 x 480/300 is (29,16)-(143,80).
    let crop = image::load_from_memory(&body).expect("png").to_rgb8();
    assert_eq!((crop.width(), crop.height()), (114, 64));

    assert_eq!(
        rig.channel.notices(INFO_PREFIX),
        vec![
            "INFO: Loading detection model".to_string(),
            "INFO: Detection model loaded".to_string(),
        ]
    );
    assert!(rig.channel.notices(ERROR_PREFIX).is_empty());
    assert_eq!(staged_files(&rig.staging_dir()), 0);
    assert_eq!(rig.channel.close_count(), 1);
}

#[test]
fn upload_failure_reports_error_and_keeps_running() {
    let rig = Rig::new();
    rig.store.fail_puts(Some("503 Service Unavailable"));
    let mut inference = rig
        .build(SyntheticSource::new(858, 480), two_faces())
        .with_tick_limit(Some(2));

    let stats = inference.run().expect("upload failures are not fatal");
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.upload_failures, 2);

    let records = rig.channel.records();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("face").and_then(|v| v.as_f64()), Some(0.9));
    }
    let errors = rig.channel.notices(ERROR_PREFIX);
    assert_eq!(errors.len(), 2);
    assert!(errors[0].contains("503"));
    assert!(rig.channel.notices(FATAL_PREFIX).is_empty());
    assert_eq!(staged_files(&rig.staging_dir()), 0);
}

#[test]
fn lost_camera_publishes_one_fatal_message() {
    let rig = Rig::new();
    let source = SyntheticSource::new(858, 480).with_limit(2);
    let mut inference = rig.build(source, StubBackend::new(300, 300));

    let err = inference.run().expect_err("frame acquisition failure is fatal");
    assert!(matches!(classify(&err), Some(EdgeError::FrameUnavailable(_))));
    assert_eq!(inference.stats().ticks, 2);

    let fatal = rig.channel.notices(FATAL_PREFIX);
    assert_eq!(fatal.len(), 1);
    assert!(fatal[0].contains("synthetic stream ended"));
    assert_eq!(rig.channel.records().len(), 2);
    assert_eq!(rig.channel.close_count(), 1);
}

#[test]
fn shutdown_request_flushes_telemetry() {
    let rig = Rig::new();
    let source = SyntheticSource::new(858, 480);
    let mut inference = rig.build(source, StubBackend::new(300, 300)).with_tick_limit(Some(1));
    inference.running_flag().store(false, std::sync::atomic::Ordering::SeqCst);

    let stats = inference.run().expect("shutdown before the first tick is clean");
    assert_eq!(stats.ticks, 0);
    assert!(rig.channel.notices(FATAL_PREFIX).is_empty());
    assert_eq!(rig.channel.close_count(), 1);
}

#[test]
fn threshold_boundary_is_exclusive() {
    let rig = Rig::new();
    let epsilon = 1e-6;
    let detector = StubBackend::new(300, 300).with_script(vec![
        vec![face(0.75, BoundingBox::new(10, 10, 60, 60))],
        vec![face(0.75 + epsilon, BoundingBox::new(10, 10, 60, 60))],
    ]);
    let mut inference = rig
        .build(SyntheticSource::new(858, 480), detector)
        .with_tick_limit(Some(2));

    inference.run().expect("loop runs");
    let records = rig.channel.records();
    assert_eq!(records.len(), 2);
    assert!(records[0].is_empty());
    assert_eq!(
        records[1].get("face").and_then(|v| v.as_f64()),
        Some(0.75 + epsilon)
    );
}

#[test]
fn loop_assembles_from_config() {
    let rig = Rig::new();
    let config_path = rig.tmp.path().join("edgelens.json");
    let json = format!(
        r#"{{
            "device_id": "lens-01",
            "source_url": "stub://camera?width=320&height=240",
            "display": {{ "fifo_path": "{}" }},
            "artifacts": {{ "staging_dir": "{}" }}
        }}"#,
        rig.tmp.path().join("preview.mjpeg").display(),
        rig.staging_dir().display()
    );
    std::fs::write(&config_path, json).expect("write config");
    let cfg = EdgelensConfig::load_from(Some(&config_path)).expect("config");

    let mut inference = InferenceLoop::from_config(
        &cfg,
        Box::new(rig.channel.clone()),
        Box::new(rig.store.clone()),
    )
    .expect("assemble")
    .with_tick_limit(Some(2));
    let stats = inference.run().expect("loop runs");

    // The dry-run backend detects on every other frame.
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.uploads, 1);
    assert!(rig
        .channel
        .published()
        .iter()
        .all(|p| p.topic == "devices/lens-01/infer"));
}
