use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::shutdown::Shutdown;

use super::{BatchAccumulator, FlushOutcome};

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(200);

/// Force-flushes batches that have been open longer than their model's `max_wait`.
pub struct FlushMonitor {
    accumulator: Arc<BatchAccumulator>,
    interval: Duration,
}

impl FlushMonitor {
    pub fn new(accumulator: Arc<BatchAccumulator>, interval: Duration) -> Self {
        Self {
            accumulator,
            interval,
        }
    }

    /// One scan at `now`. Returns the number of batches published.
    pub fn tick_at(&self, now: Instant) -> usize {
        let mut published = 0;
        for model in self.accumulator.expired_models(now) {
            match self.accumulator.flush_if_expired(&model, now) {
                Ok(FlushOutcome::Published { size }) => {
                    log::info!("timeout reached -> dispatched {} | size={}", model, size);
                    published += 1;
                }
                // A size-triggered flush got there first.
                Ok(FlushOutcome::Empty) | Ok(FlushOutcome::NotDue) => {}
                Err(e) => log::error!("timeout flush dropped batch: {}", e),
            }
        }
        published
    }

    pub fn tick(&self) -> usize {
        self.tick_at(Instant::now())
    }

    /// Scan every `interval` until shutdown is observed.
    pub fn run(self, shutdown: Shutdown) {
        log::info!("flush monitor started (interval {:?})", self.interval);
        while !shutdown.wait(self.interval) {
            self.tick();
        }
        log::info!("flush monitor stopped");
    }
}
