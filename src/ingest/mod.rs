//! Frame event ingestion.
//!
//! This module provides:
//! - `FrameEvent` / `LogPosition`: what the upstream log delivers
//! - `EventSource`: the single-consumer read side of the upstream log
//! - `InMemoryEventLog`: an in-process log for tests and demos
//! - `IngestLoop`: route -> persist -> admit -> size-triggered flush
//!
//! Sources read tail-only: a reader starts at the log head as it exists when
//! the reader is created and never replays older entries.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::EngineError;
use crate::routing::RoutingKey;

pub mod memory;
pub mod pipeline;

pub use memory::{InMemoryEventLog, InMemoryLogReader};
pub use pipeline::{DropReason, EventOutcome, IngestLoop, DEFAULT_INGEST_WAIT};

/// Position of an entry in the upstream log. Strictly increasing per reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition(pub u64);

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One camera exposure as delivered by the upstream log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameEvent {
    pub source: RoutingKey,
    pub captured_at: DateTime<Utc>,
    /// Encoded image bytes; never inspected by the engine.
    pub payload: Vec<u8>,
    pub position: LogPosition,
}

/// Read side of the upstream log.
pub trait EventSource: Send {
    /// Wait up to `timeout` for the next event; `Ok(None)` on timeout.
    ///
    /// `EngineError::Decode` reports one bad message and the source stays
    /// usable. `EngineError::Transport` means the source itself is in trouble.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<FrameEvent>, EngineError>;

    /// Release transport resources. Called once after the loop stops.
    fn close(&mut self) {}
}
