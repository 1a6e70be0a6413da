use std::sync::Arc;
use std::time::Duration;

use crate::batch::{BatchAccumulator, BatchItem, FlushOutcome};
use crate::error::EngineError;
use crate::reload::SnapshotCell;
use crate::shutdown::Shutdown;
use crate::stats::EngineStats;
use crate::storage::FrameSink;

use super::{EventSource, FrameEvent, LogPosition};

/// Upper bound on one blocking read, so the loop re-checks shutdown.
pub const DEFAULT_INGEST_WAIT: Duration = Duration::from_secs(5);

/// Pause after the source reports a transport failure.
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Unrouted,
    Persistence,
    /// Position at or before one already processed.
    Replayed,
}

/// Terminal state of one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Admitted { model: String, flushed: bool },
    Dropped(DropReason),
}

/// Single consumer of the upstream log.
pub struct IngestLoop {
    source: Box<dyn EventSource>,
    sink: Box<dyn FrameSink>,
    config: Arc<SnapshotCell>,
    accumulator: Arc<BatchAccumulator>,
    stats: Arc<EngineStats>,
    wait: Duration,
    last_position: Option<LogPosition>,
}

impl IngestLoop {
    pub fn new(
        source: Box<dyn EventSource>,
        sink: Box<dyn FrameSink>,
        config: Arc<SnapshotCell>,
        accumulator: Arc<BatchAccumulator>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            accumulator,
            stats,
            wait: DEFAULT_INGEST_WAIT,
            last_position: None,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn last_position(&self) -> Option<LogPosition> {
        self.last_position
    }

    /// Route, persist and admit one event.
    pub fn process(&mut self, event: FrameEvent) -> EventOutcome {
        if let Some(last) = self.last_position {
            if event.position <= last {
                log::debug!("skipping already processed position {}", event.position);
                return EventOutcome::Dropped(DropReason::Replayed);
            }
        }
        self.last_position = Some(event.position);
        self.stats.record_event();

        let model = match self.config.current().resolve(&event.source) {
            Some(model) => model.to_string(),
            None => {
                self.stats.record_unrouted();
                let err = EngineError::Unrouted {
                    group: event.source.source_group.clone(),
                    subgroup: event.source.source_subgroup.clone(),
                    camera: event.source.source_id.clone(),
                };
                log::warn!("{}; dropping frame {}", err, event.position);
                return EventOutcome::Dropped(DropReason::Unrouted);
            }
        };

        let frame_ref = match self.sink.store(&event) {
            Ok(frame_ref) => frame_ref,
            Err(e) => {
                self.stats.record_persistence_failure();
                log::warn!("{}; skipping frame {} from {}", e, event.position, event.source);
                return EventOutcome::Dropped(DropReason::Persistence);
            }
        };
        log::debug!("stored {}", frame_ref);

        let item = BatchItem {
            frame_ref,
            source: event.source,
            captured_at: event.captured_at,
        };
        let admitted = self.accumulator.admit(&model, item);

        // Re-check against the live policy: it may have shrunk since admit.
        let mut flushed = false;
        if admitted.should_flush || self.accumulator.is_full(&model) {
            log::info!("max batch size reached -> {} ({} items)", model, admitted.len);
            match self.accumulator.flush(&model) {
                Ok(outcome) => flushed = matches!(outcome, FlushOutcome::Published { .. }),
                Err(e) => log::error!("size flush dropped batch: {}", e),
            }
        }
        EventOutcome::Admitted { model, flushed }
    }

    /// Read and process at most one event.
    ///
    /// A decode failure is counted and swallowed; only transport errors come back.
    pub fn step(&mut self) -> Result<Option<EventOutcome>, EngineError> {
        match self.source.next_event(self.wait) {
            Ok(Some(event)) => Ok(Some(self.process(event))),
            Ok(None) => Ok(None),
            Err(e @ EngineError::Decode(_)) => {
                self.stats.record_decode_failure();
                log::warn!("{}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Consume events until shutdown is observed, then close the source.
    pub fn run(mut self, shutdown: Shutdown) {
        log::info!("ingest loop started");
        while !shutdown.is_triggered() {
            if let Err(e) = self.step() {
                log::error!("event source error: {}", e);
                shutdown.wait(TRANSPORT_BACKOFF);
            }
        }
        self.source.close();
        log::info!(
            "ingest loop stopped at position {}",
            self.last_position
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}
