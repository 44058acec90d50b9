use std::sync::Mutex;

use tempfile::NamedTempFile;

use edgelens::config::EdgelensConfig;
use edgelens::{EdgeError, ModelType, Resolution};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "EDGELENS_CONFIG",
        "EDGELENS_DEVICE_ID",
        "EDGELENS_SOURCE_URL",
        "EDGELENS_RESOLUTION",
        "EDGELENS_FIFO_PATH",
        "EDGELENS_BACKEND",
        "EDGELENS_MODEL_PATH",
        "EDGELENS_THRESHOLD",
        "EDGELENS_INPUT_WIDTH",
        "EDGELENS_INPUT_HEIGHT",
        "EDGELENS_BUCKET",
        "EDGELENS_STAGING_DIR",
        "EDGELENS_STORE_ENDPOINT",
        "EDGELENS_STORE_TOKEN",
        "EDGELENS_IDENTIFY_TARGET_KEY",
        "EDGELENS_SIMILARITY_THRESHOLD",
        "MQTT_BROKER_ADDR",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "device_id": "lens-garage",
        "topic_template": "sites/home/{device_id}/faces",
        "source_url": "http://127.0.0.1:81/stream",
        "display": { "resolution": "720p", "fifo_path": "/tmp/garage.mjpeg", "jpeg_quality": 70 },
        "detection": {
            "backend": "stub",
            "model_type": "SSD",
            "threshold": 0.6,
            "input_width": 320,
            "input_height": 240,
            "labels": { "1": "face", "2": "person" }
        },
        "artifacts": { "bucket": "garage-faces", "key_prefix": "/captures/", "staging_dir": "/tmp/garage" },
        "mqtt": { "broker_addr": "mqtts://127.0.0.1:8883", "client_id": "garage" },
        "review": { "recognition_threshold": 0.95 },
        "identify": { "target_key": "reference/owner.png", "similarity_threshold": 85.0 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("EDGELENS_CONFIG", file.path());
    std::env::set_var("EDGELENS_RESOLUTION", "1080p");
    std::env::set_var("EDGELENS_THRESHOLD", "0.8");
    std::env::set_var("MQTT_USERNAME", "lens");
    std::env::set_var("EDGELENS_SIMILARITY_THRESHOLD", "90");

    let cfg = EdgelensConfig::load().expect("load config");

    assert_eq!(cfg.device_id, "lens-garage");
    assert_eq!(cfg.topic(), "sites/home/lens-garage/faces");
    assert_eq!(cfg.source_url, "http://127.0.0.1:81/stream");
    assert_eq!(cfg.display.resolution, Resolution::P1080);
    assert_eq!(cfg.display.fifo_path.to_str(), Some("/tmp/garage.mjpeg"));
    assert_eq!(cfg.display.jpeg_quality, 70);
    assert_eq!(cfg.detection.model_type, ModelType::Ssd);
    assert_eq!(cfg.detection.threshold, 0.8);
    assert_eq!((cfg.detection.input_width, cfg.detection.input_height), (320, 240));
    assert_eq!(cfg.detection.labels.get(&2).map(String::as_str), Some("person"));
    assert_eq!(cfg.artifacts.bucket, "garage-faces");
    assert_eq!(cfg.artifacts.key_prefix, "captures");
    assert_eq!(cfg.mqtt.broker_addr, "mqtts://127.0.0.1:8883");
    assert_eq!(cfg.mqtt.username.as_deref(), Some("lens"));
    assert_eq!(cfg.review.recognition_threshold, 0.95);
    assert_eq!(cfg.identify.target_key.as_deref(), Some("reference/owner.png"));
    assert_eq!(cfg.identify.similarity_threshold, 90.0);
    assert_eq!(cfg.identify_topic(), "devices/lens-garage/identified");

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("edgelens.toml");
    std::fs::write(
        &path,
        r#"
device_id = "lens-porch"

[display]
resolution = "480p"

[detection]
threshold = 0.5
"#,
    )
    .expect("write config");

    let cfg = EdgelensConfig::load_from(Some(&path)).expect("load config");
    assert_eq!(cfg.device_id, "lens-porch");
    assert_eq!(cfg.detection.threshold, 0.5);
    assert_eq!(cfg.topic(), "devices/lens-porch/infer");
}

#[test]
fn unknown_resolution_is_invalid_configuration() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    std::env::set_var("EDGELENS_DEVICE_ID", "lens-01");
    std::env::set_var("EDGELENS_RESOLUTION", "4k");

    let err = EdgelensConfig::load().expect_err("4k is not a supported resolution");
    assert!(matches!(
        err.downcast_ref::<EdgeError>(),
        Some(EdgeError::InvalidConfiguration(_))
    ));

    clear_env();
}

#[test]
fn invalid_env_threshold_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    std::env::set_var("EDGELENS_DEVICE_ID", "lens-01");
    std::env::set_var("EDGELENS_THRESHOLD", "high");
    assert!(EdgelensConfig::load().is_err());

    std::env::set_var("EDGELENS_THRESHOLD", "1.5");
    assert!(EdgelensConfig::load().is_err());

    clear_env();
}
