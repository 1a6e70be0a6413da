//! frame_batcher - route camera frames into per-model batches.
//!
//! This daemon:
//! 1. Loads daemon settings (`FRAME_BATCHER_CONFIG` + environment)
//! 2. Watches the routing and model policy documents for changes
//! 3. Subscribes to the camera frame topic
//! 4. Stores each routed frame on disk and catalogs it in SQLite
//! 5. Publishes full or timed-out batches to `<prefix>/<model>`

use anyhow::Result;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use frame_batcher::config::EngineConfig;
use frame_batcher::transport::{MqttBatchPublisher, MqttEventSource};
use frame_batcher::{DiskFrameSink, Engine, EngineParts, FileChangeDetector};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::load()?;
    let mqtt = config.mqtt_settings()?;
    log::info!(
        "frame_batcher {} starting: frames topic {}, model queues {}/<model>",
        env!("CARGO_PKG_VERSION"),
        config.topics.frames,
        config.topics.model_queue_prefix
    );

    let sink = DiskFrameSink::open(config.frames_dir(), &config.catalog_path())?;
    log::info!(
        "storing frames under {} (catalog {})",
        sink.root().display(),
        config.catalog_path()
    );
    let publisher = Arc::new(MqttBatchPublisher::connect(
        &mqtt,
        &config.topics.model_queue_prefix,
    )?);
    let source = MqttEventSource::subscribe(&mqtt, &config.topics.frames)?;

    let engine = Engine::start(
        config.engine_settings(),
        EngineParts {
            routing: Box::new(FileChangeDetector::new(config.routing_path())),
            policies: Box::new(FileChangeDetector::new(config.models_path())),
            source: Box::new(source),
            sink: Box::new(sink),
            publisher: publisher.clone(),
        },
    )?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("frame_batcher running; waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(STATS_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => log::info!("stats: {}", engine.stats()),
        }
    }

    log::info!("shutdown signal received, flushing open batches...");
    engine.stop();
    publisher.close();
    Ok(())
}
