//! Engine: owns the shared state and the three background loops.
//!
//! ```text
//! reloader ──► SnapshotCell ◄── ingest loop ──► FrameSink
//!                   ▲                 │
//!                   │                 ▼
//!             flush monitor ──► BatchAccumulator ──► BatchPublisher
//! ```

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::batch::{BatchAccumulator, FlushMonitor, DEFAULT_MONITOR_INTERVAL};
use crate::ingest::{EventSource, IngestLoop, DEFAULT_INGEST_WAIT};
use crate::publish::BatchPublisher;
use crate::reload::{ChangeDetector, ConfigReloader, SnapshotCell, DEFAULT_RELOAD_INTERVAL};
use crate::routing::ConfigSnapshot;
use crate::shutdown::Shutdown;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::storage::FrameSink;

#[derive(Clone, Copy, Debug)]
pub struct EngineSettings {
    pub reload_interval: Duration,
    pub monitor_interval: Duration,
    pub ingest_wait: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            ingest_wait: DEFAULT_INGEST_WAIT,
        }
    }
}

/// Collaborators an engine is started with.
pub struct EngineParts {
    pub routing: Box<dyn ChangeDetector>,
    pub policies: Box<dyn ChangeDetector>,
    pub source: Box<dyn EventSource>,
    pub sink: Box<dyn FrameSink>,
    pub publisher: Arc<dyn BatchPublisher>,
}

pub struct Engine {
    cell: Arc<SnapshotCell>,
    accumulator: Arc<BatchAccumulator>,
    stats: Arc<EngineStats>,
    shutdown: Shutdown,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Engine {
    /// Load the initial tables, then spawn the reloader, monitor and ingest threads.
    pub fn start(settings: EngineSettings, parts: EngineParts) -> Result<Self> {
        let cell = Arc::new(SnapshotCell::new(ConfigSnapshot::default()));
        let stats = Arc::new(EngineStats::default());
        let accumulator = Arc::new(BatchAccumulator::new(
            cell.clone(),
            parts.publisher,
            stats.clone(),
        ));
        let shutdown = Shutdown::new();

        let mut reloader = ConfigReloader::new(cell.clone(), parts.routing, parts.policies);
        reloader.poll_once();
        let initial = cell.current();
        if initial.routing.is_empty() {
            log::warn!("starting with an empty routing table; every event will be dropped");
        }

        let monitor = FlushMonitor::new(accumulator.clone(), settings.monitor_interval);
        let ingest = IngestLoop::new(
            parts.source,
            parts.sink,
            cell.clone(),
            accumulator.clone(),
            stats.clone(),
        )
        .with_wait(settings.ingest_wait);

        let mut engine = Self {
            cell,
            accumulator,
            stats,
            shutdown,
            workers: Vec::with_capacity(3),
        };

        let reload_interval = settings.reload_interval;
        engine.spawn("config-reloader", move |shutdown| {
            reloader.run(reload_interval, shutdown)
        })?;
        engine.spawn("flush-monitor", move |shutdown| monitor.run(shutdown))?;
        engine.spawn("ingest", move |shutdown| ingest.run(shutdown))?;
        Ok(engine)
    }

    fn spawn<F>(&mut self, name: &'static str, body: F) -> Result<()>
    where
        F: FnOnce(Shutdown) + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(shutdown));
        match handle {
            Ok(handle) => {
                self.workers.push((name, handle));
                Ok(())
            }
            Err(e) => {
                // Do not leave earlier threads running.
                self.shutdown.trigger();
                self.join_workers();
                Err(anyhow!("failed to spawn {} thread: {}", name, e))
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.cell.current()
    }

    pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
        &self.accumulator
    }

    /// A handle that stops the engine when triggered, e.g. from a signal handler.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Stop every loop, then publish whatever is still buffered.
    ///
    /// Returns the number of batches flushed on the way out. Dropping the
    /// engine does the same, without the count.
    pub fn stop(mut self) -> usize {
        self.shutdown_and_flush()
    }

    fn shutdown_and_flush(&mut self) -> usize {
        log::info!("stopping engine");
        self.shutdown.trigger();
        self.join_workers();
        let flushed = self.accumulator.flush_all();
        log::info!("engine stopped; {} batches flushed on shutdown ({})", flushed, self.stats());
        flushed
    }

    fn join_workers(&mut self) {
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("{} thread panicked", name);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            log::warn!("engine dropped without stop()");
            self.shutdown_and_flush();
        }
    }
}
