//! Frame Batcher
//!
//! Accumulates camera frame events into per-model batches and hands each
//! batch to a downstream model queue.
//!
//! # Architecture
//!
//! One ingest loop reads frame events from the upstream log, resolves the
//! target model through the routing table, persists the frame, and appends a
//! reference to that model's open batch. A batch leaves when it reaches the
//! model's `max_batch_size` or when it has been open for `max_wait`,
//! whichever comes first. Both tables are hot-reloaded: readers always see a
//! complete snapshot, never a half-applied update.
//!
//! # Module Structure
//!
//! - `routing`: routing and policy tables, immutable config snapshots
//! - `reload`: change detection and atomic snapshot publication
//! - `ingest`: upstream event sources and the ingest loop
//! - `storage`: frame sinks (disk + SQLite catalog, in-memory)
//! - `batch`: batch accumulator and flush monitor
//! - `publish`: batch wire format and publishers
//! - `transport`: MQTT adapters
//! - `backend`: model backends run by the model worker
//! - `engine`: wiring and lifecycle of the background loops

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod backend;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod publish;
pub mod reload;
pub mod routing;
pub mod shutdown;
pub mod stats;
pub mod storage;
pub mod transport;

pub use batch::{AdmitOutcome, Batch, BatchAccumulator, BatchItem, FlushMonitor, FlushOutcome};
pub use engine::{Engine, EngineParts, EngineSettings};
pub use error::{EngineError, ErrorKind};
pub use ingest::{EventSource, FrameEvent, InMemoryEventLog, IngestLoop, LogPosition};
pub use publish::{BatchMessage, BatchPublisher, InMemoryPublisher};
pub use reload::{
    ChangeDetector, ConfigReloader, FileChangeDetector, MemoryDocument, ReloadOutcome,
    SnapshotCell,
};
pub use routing::{ConfigSnapshot, ModelPolicy, PolicyTable, RoutingKey, RoutingTable};
pub use shutdown::Shutdown;
pub use stats::{EngineStats, StatsSnapshot};
pub use storage::{DiskFrameSink, FrameSink, InMemoryFrameSink};

/// Model names become queue topic segments.
pub fn validate_model_name(model: &str) -> Result<()> {
    static MODEL_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = MODEL_NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("model name pattern is valid")
    });
    if !re.is_match(model) {
        return Err(anyhow!(
            "model name {:?} must match ^[A-Za-z0-9_.-]{{1,64}}$",
            model
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_are_topic_safe() {
        assert!(validate_model_name("yolo_model").is_ok());
        assert!(validate_model_name("detr-v2.1").is_ok());
        assert!(validate_model_name("").is_err());
        assert!(validate_model_name("a/b").is_err());
        assert!(validate_model_name("yolo#").is_err());
        assert!(validate_model_name(&"x".repeat(65)).is_err());
    }
}
