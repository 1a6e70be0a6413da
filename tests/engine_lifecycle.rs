use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use frame_batcher::{
    DiskFrameSink, Engine, EngineParts, EngineSettings, InMemoryEventLog, InMemoryFrameSink,
    InMemoryPublisher, MemoryDocument, RoutingKey,
};

const ROUTES: &str = r#"{"plantA": {"site1": {"CAM01": "yolo_model", "CAM02": "ppe_model"}}}"#;
const POLICIES: &str = r#"{
    "yolo_model": {"batch_size": 2, "max_wait_time": 60},
    "ppe_model": {"batch_size": 50, "max_wait_time": 0.05}
}"#;

fn fast_settings() -> EngineSettings {
    EngineSettings {
        reload_interval: Duration::from_millis(20),
        monitor_interval: Duration::from_millis(10),
        ingest_wait: Duration::from_millis(20),
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn cam(id: &str) -> RoutingKey {
    RoutingKey::new("plantA", "site1", id)
}

#[test]
fn engine_batches_by_size_and_time_then_flushes_on_stop() {
    let log = InMemoryEventLog::new();
    let sink = InMemoryFrameSink::new();
    let publisher = Arc::new(InMemoryPublisher::new());
    let engine = Engine::start(
        fast_settings(),
        EngineParts {
            routing: Box::new(MemoryDocument::new("routing", ROUTES)),
            policies: Box::new(MemoryDocument::new("policies", POLICIES)),
            source: Box::new(log.tail_reader()),
            sink: Box::new(sink.clone()),
            publisher: publisher.clone(),
        },
    )
    .expect("start engine");
    assert_eq!(engine.snapshot().routing.len(), 2);

    for _ in 0..5 {
        log.append(cam("CAM01"), Utc::now(), b"jpeg".to_vec());
    }
    log.append(cam("CAM02"), Utc::now(), b"jpeg".to_vec());
    log.append(cam("CAM77"), Utc::now(), b"jpeg".to_vec());

    // Two full yolo batches plus one timed-out ppe batch.
    assert!(wait_until(Duration::from_secs(5), || publisher.batches().len() == 3));
    assert!(wait_until(Duration::from_secs(5), || engine.stats().events_read == 7));
    assert_eq!(engine.accumulator().len("yolo_model"), 1);

    let stats = engine.stats();
    assert_eq!(stats.dropped_unrouted, 1);
    assert_eq!(stats.admitted, 6);
    assert_eq!(sink.store_calls(), 6);

    assert_eq!(engine.stop(), 1);
    let batches = publisher.batches();
    assert_eq!(batches.len(), 4);
    let sizes: usize = batches.iter().map(|b| b.len()).sum();
    assert_eq!(sizes, 6);
    assert!(batches.iter().any(|b| b.model == "ppe_model" && b.len() == 1));
}

#[test]
fn engine_picks_up_routing_changes() {
    let log = InMemoryEventLog::new();
    let routing = MemoryDocument::new("routing", r#"{}"#);
    let publisher = Arc::new(InMemoryPublisher::new());
    let engine = Engine::start(
        fast_settings(),
        EngineParts {
            routing: Box::new(routing.clone()),
            policies: Box::new(MemoryDocument::new("policies", POLICIES)),
            source: Box::new(log.tail_reader()),
            sink: Box::new(InMemoryFrameSink::new()),
            publisher: publisher.clone(),
        },
    )
    .expect("start engine");
    let first = engine.snapshot().generation;

    routing.update(ROUTES);
    assert!(wait_until(Duration::from_secs(5), || {
        engine.snapshot().generation > first
    }));

    log.append(cam("CAM01"), Utc::now(), b"a".to_vec());
    log.append(cam("CAM01"), Utc::now(), b"b".to_vec());
    assert!(wait_until(Duration::from_secs(5), || publisher.batches().len() == 1));
    assert_eq!(publisher.batches()[0].model, "yolo_model");

    assert_eq!(engine.stop(), 0);
}

#[test]
fn engine_with_disk_sink_publishes_file_paths() {
    let dir = tempfile::tempdir().expect("temp dir");
    let catalog = dir.path().join("frames.db");
    let sink = DiskFrameSink::open(dir.path().join("frames"), catalog.to_str().unwrap())
        .expect("open sink");

    let log = InMemoryEventLog::new();
    let publisher = Arc::new(InMemoryPublisher::new());
    let engine = Engine::start(
        fast_settings(),
        EngineParts {
            routing: Box::new(MemoryDocument::new("routing", ROUTES)),
            policies: Box::new(MemoryDocument::new("policies", POLICIES)),
            source: Box::new(log.tail_reader()),
            sink: Box::new(sink),
            publisher: publisher.clone(),
        },
    )
    .expect("start engine");

    log.append(cam("CAM01"), Utc::now(), b"first".to_vec());
    log.append(cam("CAM01"), Utc::now(), b"second".to_vec());
    assert!(wait_until(Duration::from_secs(5), || publisher.batches().len() == 1));
    engine.stop();

    let batch = &publisher.batches()[0];
    let contents: Vec<Vec<u8>> = batch
        .items
        .iter()
        .map(|item| std::fs::read(Path::new(&item.frame_ref)).expect("frame file"))
        .collect();
    assert_eq!(contents, vec![b"first".to_vec(), b"second".to_vec()]);
    assert!(batch.items[0]
        .frame_ref
        .contains("/frames/plantA/site1/CAM01/"));

    let reopened = DiskFrameSink::open(dir.path().join("frames"), catalog.to_str().unwrap())
        .expect("reopen sink");
    assert_eq!(reopened.frame_count().unwrap(), 2);
}

#[test]
fn dropping_engine_stops_loops_and_flushes() {
    let log = InMemoryEventLog::new();
    let publisher = Arc::new(InMemoryPublisher::new());
    let engine = Engine::start(
        fast_settings(),
        EngineParts {
            routing: Box::new(MemoryDocument::new("routing", ROUTES)),
            policies: Box::new(MemoryDocument::new("policies", POLICIES)),
            source: Box::new(log.tail_reader()),
            sink: Box::new(InMemoryFrameSink::new()),
            publisher: publisher.clone(),
        },
    )
    .expect("start engine");
    let shutdown = engine.shutdown_handle();

    log.append(cam("CAM01"), Utc::now(), b"jpeg".to_vec());
    assert!(wait_until(Duration::from_secs(5), || {
        engine.accumulator().len("yolo_model") == 1
    }));

    drop(engine);
    assert!(shutdown.is_triggered());
    let batches = publisher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].model, "yolo_model");
}
