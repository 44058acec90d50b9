//! edgelensd - on-device detection daemon.
//!
//! This daemon:
//! 1. Loads configuration (file, defaults, environment)
//! 2. Connects telemetry (MQTT, or the log for broker-less runs)
//! 3. Streams the annotated preview into the display FIFO
//! 4. Runs detection ticks, uploading crops of confident detections
//! 5. Publishes one fatal message and exits non-zero if the loop breaks

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use edgelens::transport::MqttChannel;
use edgelens::{
    EdgelensConfig, HttpObjectStore, InferenceLoop, LogChannel, MemoryObjectStore, MessageChannel,
    ObjectStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TelemetryMode {
    Mqtt,
    Log,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StoreMode {
    Http,
    Memory,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the on-device detection loop")]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "EDGELENS_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many ticks (runs until Ctrl-C when omitted).
    #[arg(long, env = "EDGELENS_FRAMES")]
    frames: Option<u64>,

    /// Where result records and notices go.
    #[arg(long, value_enum, env = "EDGELENS_TELEMETRY", default_value = "mqtt")]
    telemetry: TelemetryMode,

    /// Where detection crops go. `memory` keeps them in-process (dry runs).
    #[arg(long, value_enum, env = "EDGELENS_STORE", default_value = "http")]
    store: StoreMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = EdgelensConfig::load_from(args.config.as_deref())?;
    log::info!(
        "edgelensd {} starting for device {}",
        env!("CARGO_PKG_VERSION"),
        cfg.device_id
    );

    let channel: Box<dyn MessageChannel> = match args.telemetry {
        TelemetryMode::Mqtt => Box::new(MqttChannel::connect(&cfg.mqtt)?),
        TelemetryMode::Log => Box::new(LogChannel),
    };
    let store: Box<dyn ObjectStore> = match args.store {
        StoreMode::Http => Box::new(HttpObjectStore::from_settings(&cfg.artifacts)?),
        StoreMode::Memory => Box::new(MemoryObjectStore::new()),
    };

    let mut inference = InferenceLoop::from_config(&cfg, channel, store)?.with_tick_limit(args.frames);
    let running = inference.running_flag();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let stats = inference.run()?;
    log::info!(
        "edgelensd exiting: {} tick(s), {} detection(s), {} upload(s)",
        stats.ticks,
        stats.detections,
        stats.uploads
    );
    Ok(())
}
