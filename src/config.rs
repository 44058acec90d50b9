use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::detect::ModelType;
use crate::display::Resolution;
use crate::error::EdgeError;

const DEFAULT_TOPIC_TEMPLATE: &str = "devices/{device_id}/infer";
const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_RESOLUTION: &str = "480p";
const DEFAULT_FIFO_PATH: &str = "/tmp/results.mjpeg";
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_THRESHOLD: f64 = 0.75;
const DEFAULT_INPUT_SIZE: u32 = 300;
const DEFAULT_BUCKET: &str = "edgelens-faces";
const DEFAULT_KEY_PREFIX: &str = "faces";
const DEFAULT_STAGING_DIR: &str = "/tmp/faces";
const DEFAULT_STORE_ENDPOINT: &str = "http://127.0.0.1:9000";
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "edgelensd";
const DEFAULT_RECOGNITION_THRESHOLD: f64 = 0.90;
const DEFAULT_SIMILARITY_THRESHOLD: f64 = 80.0;
const DEFAULT_IDENTIFY_TOPIC_TEMPLATE: &str = "devices/{device_id}/identified";

#[derive(Debug, Deserialize, Default)]
struct EdgelensConfigFile {
    device_id: Option<String>,
    topic_template: Option<String>,
    source_url: Option<String>,
    display: Option<DisplayConfigFile>,
    detection: Option<DetectionConfigFile>,
    artifacts: Option<ArtifactConfigFile>,
    mqtt: Option<MqttConfigFile>,
    review: Option<ReviewConfigFile>,
    identify: Option<IdentifyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    resolution: Option<String>,
    fifo_path: Option<PathBuf>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    model_type: Option<String>,
    threshold: Option<f64>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ArtifactConfigFile {
    bucket: Option<String>,
    key_prefix: Option<String>,
    staging_dir: Option<PathBuf>,
    endpoint: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    allow_remote: Option<bool>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReviewConfigFile {
    recognition_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct IdentifyConfigFile {
    target_key: Option<String>,
    similarity_threshold: Option<f64>,
    topic_template: Option<String>,
}

/// Fully resolved configuration: file, then defaults, then environment.
#[derive(Debug, Clone)]
pub struct EdgelensConfig {
    pub device_id: String,
    pub topic_template: String,
    pub source_url: String,
    pub display: DisplaySettings,
    pub detection: DetectionSettings,
    pub artifacts: ArtifactSettings,
    pub mqtt: MqttSettings,
    pub review: ReviewSettings,
    pub identify: IdentifySettings,
}

#[derive(Debug, Clone)]
pub struct DisplaySettings {
    pub resolution: Resolution,
    pub fifo_path: PathBuf,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub model_type: ModelType,
    /// Detections must be strictly above this probability.
    pub threshold: f64,
    pub input_width: u32,
    pub input_height: u32,
    /// Model label id to record key.
    pub labels: BTreeMap<u32, String>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            model_path: None,
            model_type: ModelType::Ssd,
            threshold: DEFAULT_THRESHOLD,
            input_width: DEFAULT_INPUT_SIZE,
            input_height: DEFAULT_INPUT_SIZE,
            labels: default_labels(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub bucket: String,
    pub key_prefix: String,
    pub staging_dir: PathBuf,
    pub endpoint: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub client_id: String,
    pub allow_remote: bool,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub recognition_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct IdentifySettings {
    /// Reference image in the artifact bucket; identification is off without one.
    pub target_key: Option<String>,
    /// Minimum similarity, on a 0-100 scale, that counts as a match.
    pub similarity_threshold: f64,
    pub topic_template: String,
}

impl EdgelensConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EDGELENS_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file in place of `EDGELENS_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Telemetry topic for this device.
    pub fn topic(&self) -> String {
        self.topic_template.replace("{device_id}", &self.device_id)
    }

    /// Topic that match notices go to.
    pub fn identify_topic(&self) -> String {
        self.identify
            .topic_template
            .replace("{device_id}", &self.device_id)
    }

    fn from_file(file: EdgelensConfigFile) -> Result<Self> {
        let display = file.display.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let artifacts = file.artifacts.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let identify = file.identify.unwrap_or_default();

        let resolution = display
            .resolution
            .as_deref()
            .unwrap_or(DEFAULT_RESOLUTION)
            .parse::<Resolution>()?;
        let model_type = detection
            .model_type
            .as_deref()
            .map(str::parse::<ModelType>)
            .transpose()?
            .unwrap_or_default();
        let labels = match detection.labels {
            Some(labels) => parse_labels(labels)?,
            None => default_labels(),
        };

        Ok(Self {
            device_id: file.device_id.unwrap_or_default(),
            topic_template: file
                .topic_template
                .unwrap_or_else(|| DEFAULT_TOPIC_TEMPLATE.to_string()),
            source_url: file
                .source_url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            display: DisplaySettings {
                resolution,
                fifo_path: display
                    .fifo_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FIFO_PATH)),
                jpeg_quality: display.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            detection: DetectionSettings {
                backend: detection
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: detection.model_path,
                model_type,
                threshold: detection.threshold.unwrap_or(DEFAULT_THRESHOLD),
                input_width: detection.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
                input_height: detection.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
                labels,
            },
            artifacts: ArtifactSettings {
                bucket: artifacts
                    .bucket
                    .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
                key_prefix: artifacts
                    .key_prefix
                    .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
                staging_dir: artifacts
                    .staging_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR)),
                endpoint: artifacts
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_STORE_ENDPOINT.to_string()),
                token: artifacts.token,
            },
            mqtt: MqttSettings {
                broker_addr: mqtt
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                allow_remote: mqtt.allow_remote.unwrap_or(false),
                use_tls: mqtt.use_tls.unwrap_or(false),
                tls_ca_path: mqtt.tls_ca_path,
                tls_client_cert_path: mqtt.tls_client_cert_path,
                tls_client_key_path: mqtt.tls_client_key_path,
                username: mqtt.username,
                password: mqtt.password,
            },
            review: ReviewSettings {
                recognition_threshold: file
                    .review
                    .and_then(|review| review.recognition_threshold)
                    .unwrap_or(DEFAULT_RECOGNITION_THRESHOLD),
            },
            identify: IdentifySettings {
                target_key: identify.target_key,
                similarity_threshold: identify
                    .similarity_threshold
                    .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
                topic_template: identify
                    .topic_template
                    .unwrap_or_else(|| DEFAULT_IDENTIFY_TOPIC_TEMPLATE.to_string()),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(device_id) = env_non_empty("EDGELENS_DEVICE_ID") {
            self.device_id = device_id;
        }
        if let Some(url) = env_non_empty("EDGELENS_SOURCE_URL") {
            self.source_url = url;
        }
        if let Some(resolution) = env_non_empty("EDGELENS_RESOLUTION") {
            self.display.resolution = resolution.parse::<Resolution>()?;
        }
        if let Some(path) = env_non_empty("EDGELENS_FIFO_PATH") {
            self.display.fifo_path = PathBuf::from(path);
        }
        if let Some(backend) = env_non_empty("EDGELENS_BACKEND") {
            self.detection.backend = backend;
        }
        if let Some(path) = env_non_empty("EDGELENS_MODEL_PATH") {
            self.detection.model_path = Some(PathBuf::from(path));
        }
        if let Some(threshold) = env_non_empty("EDGELENS_THRESHOLD") {
            self.detection.threshold = threshold
                .parse()
                .map_err(|_| anyhow!("EDGELENS_THRESHOLD must be a number"))?;
        }
        if let Some(width) = env_non_empty("EDGELENS_INPUT_WIDTH") {
            self.detection.input_width = width
                .parse()
                .map_err(|_| anyhow!("EDGELENS_INPUT_WIDTH must be an integer"))?;
        }
        if let Some(height) = env_non_empty("EDGELENS_INPUT_HEIGHT") {
            self.detection.input_height = height
                .parse()
                .map_err(|_| anyhow!("EDGELENS_INPUT_HEIGHT must be an integer"))?;
        }
        if let Some(bucket) = env_non_empty("EDGELENS_BUCKET") {
            self.artifacts.bucket = bucket;
        }
        if let Some(dir) = env_non_empty("EDGELENS_STAGING_DIR") {
            self.artifacts.staging_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = env_non_empty("EDGELENS_STORE_ENDPOINT") {
            self.artifacts.endpoint = endpoint;
        }
        if let Some(token) = env_non_empty("EDGELENS_STORE_TOKEN") {
            self.artifacts.token = Some(token);
        }
        if let Some(key) = env_non_empty("EDGELENS_IDENTIFY_TARGET_KEY") {
            self.identify.target_key = Some(key);
        }
        if let Some(threshold) = env_non_empty("EDGELENS_SIMILARITY_THRESHOLD") {
            self.identify.similarity_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("EDGELENS_SIMILARITY_THRESHOLD must be a number"))?;
        }
        if let Some(addr) = env_non_empty("MQTT_BROKER_ADDR") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(user) = env_non_empty("MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = env_non_empty("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let device_re = Regex::new(r"^[A-Za-z0-9_.:-]{1,128}$")?;
        if !device_re.is_match(&self.device_id) {
            return Err(invalid(format!(
                "device id '{}' must be 1-128 characters of [A-Za-z0-9_.:-] (set EDGELENS_DEVICE_ID)",
                self.device_id
            )));
        }
        if !self.topic_template.contains("{device_id}") {
            return Err(invalid("topic_template must contain {device_id}".to_string()));
        }

        let bucket_re = Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$")?;
        if !bucket_re.is_match(&self.artifacts.bucket) {
            return Err(invalid(format!(
                "bucket name '{}' is not a valid object-store bucket",
                self.artifacts.bucket
            )));
        }
        self.artifacts.key_prefix = self.artifacts.key_prefix.trim_matches('/').to_string();

        let threshold = self.detection.threshold;
        if !(0.0..1.0).contains(&threshold) {
            return Err(invalid(format!(
                "detection threshold {} must be within [0, 1)",
                threshold
            )));
        }
        if self.detection.input_width == 0 || self.detection.input_height == 0 {
            return Err(invalid("model input dimensions must be non-zero".to_string()));
        }
        if self.detection.labels.is_empty() {
            return Err(invalid("detection.labels must map at least one label".to_string()));
        }
        if !(1..=100).contains(&self.display.jpeg_quality) {
            return Err(invalid("display.jpeg_quality must be within 1..=100".to_string()));
        }
        if !(0.0..=1.0).contains(&self.review.recognition_threshold) {
            return Err(invalid(
                "review.recognition_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.identify.similarity_threshold) {
            return Err(invalid(
                "identify.similarity_threshold must be within [0, 100]".to_string(),
            ));
        }
        if !self.identify.topic_template.contains("{device_id}") {
            return Err(invalid(
                "identify.topic_template must contain {device_id}".to_string(),
            ));
        }
        if self
            .identify
            .target_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            self.identify.target_key = None;
        }
        Ok(())
    }
}

fn invalid(message: String) -> anyhow::Error {
    EdgeError::InvalidConfiguration(message).into()
}

fn default_labels() -> BTreeMap<u32, String> {
    BTreeMap::from([(1, "face".to_string())])
}

fn parse_labels(raw: BTreeMap<String, String>) -> Result<BTreeMap<u32, String>> {
    raw.into_iter()
        .map(|(id, name)| {
            let id: u32 = id
                .trim()
                .parse()
                .map_err(|_| anyhow!("label id '{}' must be an integer", id))?;
            Ok((id, name))
        })
        .collect()
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<EdgelensConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
