use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use frame_batcher::config::EngineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FRAME_BATCHER_CONFIG",
        "FRAME_BATCHER_SHARED_DIR",
        "FRAME_BATCHER_MQTT_ADDR",
        "FRAME_BATCHER_MQTT_USERNAME",
        "FRAME_BATCHER_MQTT_PASSWORD",
        "FRAME_BATCHER_FRAMES_TOPIC",
        "FRAME_BATCHER_MONITOR_MS",
        "FRAME_BATCHER_RELOAD_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_follow_shared_dir() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EngineConfig::load().expect("load defaults");
    assert_eq!(cfg.shared_dir, PathBuf::from("/shared"));
    assert_eq!(cfg.frames_dir(), PathBuf::from("/shared/frames"));
    assert_eq!(cfg.catalog_path(), "/shared/frames.db");
    assert_eq!(
        cfg.routing_path(),
        PathBuf::from("/shared/configs/routing_config.json")
    );
    assert_eq!(
        cfg.models_path(),
        PathBuf::from("/shared/configs/models_configs.json")
    );
    assert_eq!(cfg.mqtt.broker_addr, "127.0.0.1:1883");
    assert_eq!(cfg.mqtt.client_id, "frame_batcher");
    assert_eq!(cfg.topics.frames, "camera_stream");
    assert_eq!(cfg.topics.model_queue_prefix, "model_queue");
    assert_eq!(cfg.intervals.reload, Duration::from_millis(1000));
    assert_eq!(cfg.intervals.monitor, Duration::from_millis(200));
    assert_eq!(cfg.intervals.ingest_wait, Duration::from_millis(5000));

    std::env::set_var("FRAME_BATCHER_SHARED_DIR", "/data");
    let cfg = EngineConfig::load().expect("load with shared dir");
    assert_eq!(cfg.frames_dir(), PathBuf::from("/data/frames"));

    clear_env();
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "shared_dir": "/srv/batcher",
        "frames_dir": "/mnt/frames",
        "mqtt": {
            "broker_addr": "mqtts://broker.local:8883",
            "client_id": "batcher-1",
            "username": "svc"
        },
        "topics": {
            "frames": "plant/frames",
            "model_queue_prefix": "queues"
        },
        "intervals": {
            "reload_ms": 500,
            "monitor_ms": 100
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("FRAME_BATCHER_CONFIG", file.path());
    std::env::set_var("FRAME_BATCHER_MQTT_PASSWORD", "hunter2");
    std::env::set_var("FRAME_BATCHER_MONITOR_MS", "50");

    let cfg = EngineConfig::load().expect("load config");
    assert_eq!(cfg.frames_dir(), PathBuf::from("/mnt/frames"));
    assert_eq!(cfg.catalog_path(), "/srv/batcher/frames.db");
    assert_eq!(cfg.mqtt.client_id, "batcher-1");
    assert_eq!(cfg.mqtt.username.as_deref(), Some("svc"));
    assert_eq!(cfg.mqtt.password.as_deref(), Some("hunter2"));
    assert_eq!(cfg.topics.frames, "plant/frames");
    assert_eq!(cfg.topics.model_queue_prefix, "queues");
    assert_eq!(cfg.intervals.reload, Duration::from_millis(500));
    assert_eq!(cfg.intervals.monitor, Duration::from_millis(50));

    let mqtt = cfg.mqtt_settings().expect("mqtt settings");
    assert!(mqtt.endpoint.use_tls);
    assert_eq!(mqtt.endpoint.port, 8883);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("batcher.toml");
    std::fs::write(
        &path,
        r#"
shared_dir = "/opt/shared"

[topics]
frames = "cams"

[intervals]
ingest_wait_ms = 250
"#,
    )
    .expect("write toml");
    std::env::set_var("FRAME_BATCHER_CONFIG", &path);

    let cfg = EngineConfig::load().expect("load toml");
    assert_eq!(cfg.shared_dir, PathBuf::from("/opt/shared"));
    assert_eq!(cfg.topics.frames, "cams");
    assert_eq!(cfg.engine_settings().ingest_wait, Duration::from_millis(250));

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FRAME_BATCHER_MONITOR_MS", "0");
    assert!(EngineConfig::load().is_err());
    std::env::set_var("FRAME_BATCHER_MONITOR_MS", "soon");
    assert!(EngineConfig::load().is_err());
    clear_env();

    std::env::set_var("FRAME_BATCHER_FRAMES_TOPIC", "cameras/#");
    let err = EngineConfig::load().unwrap_err();
    assert!(err.to_string().contains("wildcards"));
    clear_env();

    std::env::set_var("FRAME_BATCHER_MQTT_ADDR", "broker-without-port");
    assert!(EngineConfig::load().is_err());

    clear_env();
}
