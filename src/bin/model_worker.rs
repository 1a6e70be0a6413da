//! model_worker - run a model backend over one model's batch queue.
//!
//! Subscribes to `<prefix>/<model>`, runs the selected backend over every
//! batch and publishes the detections to the analysis topic.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use frame_batcher::backend::{analyze_batch, BackendRegistry};
use frame_batcher::config::validate_topic;
use frame_batcher::publish::model_queue_topic;
use frame_batcher::transport::{
    parse_mqtt_endpoint, MqttPublisher, MqttSettings, MqttSubscription, TlsMaterials,
};
use frame_batcher::{validate_model_name, Shutdown};

const POLL_WAIT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a model backend over a batch queue")]
struct Args {
    /// Model whose queue this worker consumes.
    #[arg(long, env = "MODEL_NAME", default_value = "yolo_model")]
    model: String,

    /// Backend type (see the registry for available names).
    #[arg(long, env = "MODEL_BACKEND", default_value = "stub")]
    backend: String,

    #[arg(long, env = "MODEL_QUEUE_PREFIX", default_value = "model_queue")]
    queue_prefix: String,

    /// Topic detections are published to.
    #[arg(long, env = "ANALYSIS_TOPIC", default_value = "analysis_queue")]
    results_topic: String,

    /// MQTT broker address (`host:port`, or `mqtts://host:port` for TLS).
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "model_worker")]
    mqtt_client_id: String,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    #[arg(long, env = "MQTT_USE_TLS", default_value_t = false)]
    mqtt_use_tls: bool,

    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    validate_model_name(&args.model)?;
    validate_topic("model queue prefix", &args.queue_prefix)?;
    validate_topic("results topic", &args.results_topic)?;

    let mut registry = BackendRegistry::with_builtin();
    registry.set_default(&args.backend)?;
    if let Some(backend) = registry.default_backend() {
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow::anyhow!("backend lock poisoned"))?;
        guard.warm_up()?;
    }

    let settings = MqttSettings {
        endpoint: parse_mqtt_endpoint(&args.mqtt_broker_addr, args.mqtt_use_tls)?,
        tls: TlsMaterials::load(args.mqtt_tls_ca_path.as_deref(), None, None)?,
        client_id: format!("{}-{}", args.mqtt_client_id, args.model),
        username: args.mqtt_username.clone(),
        password: args.mqtt_password.clone(),
    };
    let queue = model_queue_topic(&args.queue_prefix, &args.model);
    let publisher = MqttPublisher::connect(&settings, "results")?;
    let mut subscription = MqttSubscription::open(&settings, "batches", &queue)?;
    log::info!(
        "model_worker started: backend {} consuming {} -> {}",
        args.backend,
        queue,
        args.results_topic
    );

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.trigger()).expect("error setting Ctrl-C handler");
    }

    while !shutdown.is_triggered() {
        let payload = match subscription.recv(POLL_WAIT) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("{}", e);
                shutdown.wait(POLL_WAIT);
                continue;
            }
        };
        let analysis = match analyze_batch(&registry, &payload) {
            Ok(analysis) => analysis,
            Err(e) => {
                log::error!("skipping batch: {:#}", e);
                continue;
            }
        };
        log::info!(
            "batch {} analysed ({} images)",
            analysis.batch_id,
            analysis.results.len()
        );
        match serde_json::to_vec(&analysis) {
            Ok(body) => {
                if let Err(e) = publisher.send(&args.results_topic, body) {
                    log::error!("failed to publish results for {}: {}", analysis.batch_id, e);
                }
            }
            Err(e) => log::error!("failed to encode results: {}", e),
        }
    }

    log::info!("shutdown signal received, stopping model_worker");
    subscription.close();
    publisher.close();
    Ok(())
}
