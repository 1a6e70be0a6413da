use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::transport::{parse_mqtt_endpoint, MqttSettings, TlsMaterials};

const DEFAULT_SHARED_DIR: &str = "/shared";
const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_CLIENT_ID: &str = "frame_batcher";
const DEFAULT_FRAMES_TOPIC: &str = "camera_stream";
const DEFAULT_RELOAD_MS: u64 = 1000;
const DEFAULT_MONITOR_MS: u64 = 200;
const DEFAULT_INGEST_WAIT_MS: u64 = 5000;

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    shared_dir: Option<PathBuf>,
    frames_dir: Option<PathBuf>,
    catalog_path: Option<String>,
    routing_path: Option<PathBuf>,
    models_path: Option<PathBuf>,
    mqtt: Option<MqttConfigFile>,
    topics: Option<TopicsConfigFile>,
    intervals: Option<IntervalsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct TopicsConfigFile {
    frames: Option<String>,
    model_queue_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct IntervalsConfigFile {
    reload_ms: Option<u64>,
    monitor_ms: Option<u64>,
    ingest_wait_ms: Option<u64>,
}

/// Daemon settings. Paths left unset are derived from `shared_dir`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub shared_dir: PathBuf,
    frames_dir: Option<PathBuf>,
    catalog_path: Option<String>,
    routing_path: Option<PathBuf>,
    models_path: Option<PathBuf>,
    pub mqtt: MqttConfig,
    pub topics: TopicSettings,
    pub intervals: IntervalSettings,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TopicSettings {
    pub frames: String,
    pub model_queue_prefix: String,
}

#[derive(Debug, Clone, Copy)]
pub struct IntervalSettings {
    pub reload: Duration,
    pub monitor: Duration,
    pub ingest_wait: Duration,
}

impl EngineConfig {
    /// File named by `FRAME_BATCHER_CONFIG` (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAME_BATCHER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let mqtt = file.mqtt.unwrap_or_default();
        let topics = file.topics.unwrap_or_default();
        let intervals = file.intervals.unwrap_or_default();
        Self {
            shared_dir: file
                .shared_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SHARED_DIR)),
            frames_dir: file.frames_dir,
            catalog_path: file.catalog_path,
            routing_path: file.routing_path,
            models_path: file.models_path,
            mqtt: MqttConfig {
                broker_addr: mqtt
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                ca_path: mqtt.ca_path,
                client_cert_path: mqtt.client_cert_path,
                client_key_path: mqtt.client_key_path,
            },
            topics: TopicSettings {
                frames: topics
                    .frames
                    .unwrap_or_else(|| DEFAULT_FRAMES_TOPIC.to_string()),
                model_queue_prefix: topics
                    .model_queue_prefix
                    .unwrap_or_else(|| crate::publish::DEFAULT_MODEL_QUEUE_PREFIX.to_string()),
            },
            intervals: IntervalSettings {
                reload: Duration::from_millis(intervals.reload_ms.unwrap_or(DEFAULT_RELOAD_MS)),
                monitor: Duration::from_millis(
                    intervals.monitor_ms.unwrap_or(DEFAULT_MONITOR_MS),
                ),
                ingest_wait: Duration::from_millis(
                    intervals.ingest_wait_ms.unwrap_or(DEFAULT_INGEST_WAIT_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_nonempty("FRAME_BATCHER_SHARED_DIR") {
            self.shared_dir = PathBuf::from(dir);
        }
        if let Some(addr) = env_nonempty("FRAME_BATCHER_MQTT_ADDR") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(user) = env_nonempty("FRAME_BATCHER_MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = env_nonempty("FRAME_BATCHER_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(topic) = env_nonempty("FRAME_BATCHER_FRAMES_TOPIC") {
            self.topics.frames = topic;
        }
        if let Some(ms) = env_millis("FRAME_BATCHER_MONITOR_MS")? {
            self.intervals.monitor = ms;
        }
        if let Some(ms) = env_millis("FRAME_BATCHER_RELOAD_MS")? {
            self.intervals.reload = ms;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("reload", self.intervals.reload),
            ("monitor", self.intervals.monitor),
            ("ingest_wait", self.intervals.ingest_wait),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} interval must be greater than zero", name));
            }
        }
        validate_topic("frames topic", &self.topics.frames)?;
        validate_topic("model queue prefix", &self.topics.model_queue_prefix)?;
        if self.mqtt.client_id.trim().is_empty() {
            return Err(anyhow!("mqtt client_id must not be empty"));
        }
        parse_mqtt_endpoint(&self.mqtt.broker_addr, self.mqtt.use_tls)?;
        Ok(())
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.frames_dir
            .clone()
            .unwrap_or_else(|| self.shared_dir.join("frames"))
    }

    pub fn catalog_path(&self) -> String {
        self.catalog_path.clone().unwrap_or_else(|| {
            self.shared_dir
                .join("frames.db")
                .to_string_lossy()
                .into_owned()
        })
    }

    pub fn routing_path(&self) -> PathBuf {
        self.routing_path
            .clone()
            .unwrap_or_else(|| self.shared_dir.join("configs/routing_config.json"))
    }

    pub fn models_path(&self) -> PathBuf {
        self.models_path
            .clone()
            .unwrap_or_else(|| self.shared_dir.join("configs/models_configs.json"))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            reload_interval: self.intervals.reload,
            monitor_interval: self.intervals.monitor,
            ingest_wait: self.intervals.ingest_wait,
        }
    }

    /// Resolve the broker endpoint and read any TLS material from disk.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let endpoint = parse_mqtt_endpoint(&self.mqtt.broker_addr, self.mqtt.use_tls)?;
        let tls = TlsMaterials::load(
            self.mqtt.ca_path.as_deref(),
            self.mqtt.client_cert_path.as_deref(),
            self.mqtt.client_key_path.as_deref(),
        )?;
        Ok(MqttSettings {
            endpoint,
            tls,
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
        })
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    match env_nonempty(key) {
        Some(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of milliseconds", key))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        None => Ok(None),
    }
}

/// Topics are published to and subscribed to verbatim, so wildcards are refused.
pub fn validate_topic(what: &str, topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        return Err(anyhow!("{} must not be empty", what));
    }
    if topic.contains(['+', '#']) {
        return Err(anyhow!("{} must not contain MQTT wildcards: {}", what, topic));
    }
    Ok(())
}
