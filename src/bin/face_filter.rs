//! face_filter - prune weakly recognised artifacts.
//!
//! Subscribes to a device's telemetry topic and deletes the uploaded crop of
//! every record whose probability is below the recognition threshold. When a
//! reference image is configured, kept crops are compared with it and matches
//! are announced on the identify topic.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use edgelens::review::{apply_decision, parse_record, ReviewDecision, ReviewPolicy};
use edgelens::transport::{run_subscriber, MqttChannel};
use edgelens::{EdgelensConfig, HttpObjectStore, Identifier, TelemetryPublisher, ThumbnailMatcher};

const CLIENT_SUFFIX: &str = "face_filter";

#[derive(Parser, Debug)]
#[command(author, version, about = "Delete artifacts of weak detections")]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "EDGELENS_CONFIG")]
    config: Option<PathBuf>,

    /// Record key holding the probability to judge.
    #[arg(long, env = "EDGELENS_REVIEW_LABEL", default_value = "face")]
    label: String,

    /// Topic to review; defaults to the configured device topic.
    #[arg(long, env = "EDGELENS_REVIEW_TOPIC")]
    topic: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = EdgelensConfig::load_from(args.config.as_deref())?;
    let policy = ReviewPolicy::new(args.label, &cfg.review);
    let store = HttpObjectStore::from_settings(&cfg.artifacts)?;
    let topic = args.topic.unwrap_or_else(|| cfg.topic());
    let client_id = format!("{}-{}", cfg.mqtt.client_id, CLIENT_SUFFIX);

    let identifier = Identifier::from_settings(
        &cfg.identify,
        Box::new(HttpObjectStore::from_settings(&cfg.artifacts)?),
        Box::new(ThumbnailMatcher::default()),
    );
    let notices = match &identifier {
        Some(identifier) => {
            let mut mqtt = cfg.mqtt.clone();
            mqtt.client_id = format!("{}-notify", client_id);
            log::info!(
                "identifying kept crops against {} (similarity >= {})",
                identifier.target_key(),
                cfg.identify.similarity_threshold
            );
            Some(TelemetryPublisher::new(
                Box::new(MqttChannel::connect(&mqtt)?),
                cfg.identify_topic(),
            ))
        }
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "face_filter reviewing {} ({} < {} is discarded)",
        topic,
        policy.label,
        policy.recognition_threshold
    );
    let outcome = run_subscriber(&cfg.mqtt, &client_id, &topic, &running, |source, payload| {
        let Some(artifact) = parse_record(payload, &policy.label) else {
            return;
        };
        let decision = policy.decide(&artifact);
        match &decision {
            ReviewDecision::Keep { probability } => {
                log::debug!("[{}] keeping record at {:.4}", source, probability);
                if let (Some(identifier), Some(notices)) = (&identifier, &notices) {
                    if let Err(e) = identifier.identify_and_notify(&artifact, notices) {
                        log::warn!("[{}] identification failed: {:#}", source, e);
                    }
                }
            }
            ReviewDecision::Discard { .. } => {
                if let Err(e) = apply_decision(&store, &decision) {
                    log::warn!("[{}] failed to discard artifact: {:#}", source, e);
                }
            }
            ReviewDecision::Skip => {}
        }
    });
    if let Some(notices) = &notices {
        notices.close();
    }
    outcome?;
    log::info!("face_filter stopped");
    Ok(())
}
