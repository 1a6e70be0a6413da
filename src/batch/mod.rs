//! Per-model batch accumulation.
//!
//! - `accumulator`: the batch store with `admit` / `flush`
//! - `monitor`: background timeout flushing
//!
//! An admitted item lives in exactly one open batch until a flush moves it
//! out. Flushes never publish an empty batch, so racing size and timeout
//! triggers are harmless: the loser sees nothing to send.

mod accumulator;
mod monitor;

use chrono::{DateTime, Utc};

use crate::routing::RoutingKey;

pub use accumulator::{AdmitOutcome, BatchAccumulator, FlushOutcome};
pub use monitor::{FlushMonitor, DEFAULT_MONITOR_INTERVAL};

/// A persisted frame waiting in a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchItem {
    /// Identifier returned by the frame sink (a storage path for the disk sink).
    pub frame_ref: String,
    pub source: RoutingKey,
    pub captured_at: DateTime<Utc>,
}

/// A closed batch handed to the publisher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub model: String,
    pub items: Vec<BatchItem>,
    /// Wall-clock time the batch was opened.
    pub opened_at: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
