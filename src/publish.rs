//! Downstream batch publishing.
//!
//! A published batch is one message: a JSON object carrying the model name,
//! a content-derived batch id and the ordered item list. Consumers may see
//! the same message twice under at-least-once delivery and dedupe on
//! `batch_id`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::batch::{Batch, BatchItem};
use crate::error::EngineError;

pub const DEFAULT_MODEL_QUEUE_PREFIX: &str = "model_queue";

/// Durably enqueue a finished batch for its model queue.
///
/// Either the whole batch is accepted or an error is returned; the engine
/// never splits or partially retries a batch.
pub trait BatchPublisher: Send + Sync {
    fn publish(&self, batch: &Batch) -> Result<(), EngineError>;
}

/// One item on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchMessageItem {
    pub frame_path: String,
    pub plant: String,
    pub site: String,
    pub camera: String,
    pub timestamp: String,
}

/// Wire form of a batch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchMessage {
    pub model: String,
    pub batch_id: String,
    /// Unix milliseconds at which the batch was opened.
    pub opened_at: i64,
    pub items: Vec<BatchMessageItem>,
}

impl BatchMessage {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            model: batch.model.clone(),
            batch_id: batch_id(&batch.model, &batch.items),
            opened_at: batch.opened_at.timestamp_millis(),
            items: batch.items.iter().map(message_item).collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| EngineError::publish(&self.model, e))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| anyhow!("invalid batch message: {}", e))
    }

    pub fn frame_paths(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.frame_path.as_str()).collect()
    }
}

fn message_item(item: &BatchItem) -> BatchMessageItem {
    BatchMessageItem {
        frame_path: item.frame_ref.clone(),
        plant: item.source.source_group.clone(),
        site: item.source.source_subgroup.clone(),
        camera: item.source.source_id.clone(),
        timestamp: format_timestamp(&item.captured_at),
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SHA-256 over the model name and the ordered frame references, hex encoded.
pub fn batch_id(model: &str, items: &[BatchItem]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    for item in items {
        hasher.update([0u8]);
        hasher.update(item.frame_ref.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Topic (or stream key) of a model's batch queue.
pub fn model_queue_topic(prefix: &str, model: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), model)
}

/// Collects batches in memory. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    batches: Mutex<Vec<Batch>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successfully published batches, in publish order.
    pub fn batches(&self) -> Vec<Batch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every call to `publish`, including failed ones.
    pub fn publish_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BatchPublisher for InMemoryPublisher {
    fn publish(&self, batch: &Batch) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::publish(&batch.model, "publisher offline"));
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());
        Ok(())
    }
}
