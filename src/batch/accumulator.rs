use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::EngineError;
use crate::publish::BatchPublisher;
use crate::reload::SnapshotCell;
use crate::stats::EngineStats;

use super::{Batch, BatchItem};

struct OpenBatch {
    items: Vec<BatchItem>,
    opened_at: Instant,
    opened_wall: DateTime<Utc>,
    /// Held across take + publish so one model's batches leave in order.
    publish_gate: Arc<Mutex<()>>,
}

impl OpenBatch {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            opened_at: Instant::now(),
            opened_wall: Utc::now(),
            publish_gate: Arc::new(Mutex::new(())),
        }
    }

    fn age_at(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.opened_at)
    }
}

/// Result of `admit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmitOutcome {
    /// Batch length after the append.
    pub len: usize,
    /// The batch reached the model's current `max_batch_size`.
    pub should_flush: bool,
}

/// Result of a flush attempt that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing open for the model; the publisher was not called.
    Empty,
    /// The batch was not yet old enough for a timeout flush.
    NotDue,
    Published { size: usize },
}

/// Owns the batch store: model name -> open batch.
///
/// One mutex guards the whole map and is held only for O(1) work (lookup,
/// append, swap out the item vector). Publishing happens after the guard is
/// dropped.
pub struct BatchAccumulator {
    store: Mutex<HashMap<String, OpenBatch>>,
    config: Arc<SnapshotCell>,
    publisher: Arc<dyn BatchPublisher>,
    stats: Arc<EngineStats>,
}

impl BatchAccumulator {
    pub fn new(
        config: Arc<SnapshotCell>,
        publisher: Arc<dyn BatchPublisher>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            config,
            publisher,
            stats,
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, HashMap<String, OpenBatch>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` to `model`'s batch, opening the batch if needed.
    ///
    /// The size check reads the policy live at call time, so a limit lowered
    /// mid-batch applies to the very next admission.
    pub fn admit(&self, model: &str, item: BatchItem) -> AdmitOutcome {
        let mut store = self.lock_store();
        let open = store
            .entry(model.to_string())
            .or_insert_with(OpenBatch::new);
        open.items.push(item);
        let len = open.items.len();
        let policy = self.config.current().policy_for(model);
        drop(store);

        self.stats.record_admit();
        AdmitOutcome {
            len,
            should_flush: len >= policy.max_batch_size,
        }
    }

    /// Close and publish `model`'s batch. A no-op when the batch is empty.
    ///
    /// On publish failure the items are not re-queued.
    pub fn flush(&self, model: &str) -> Result<FlushOutcome, EngineError> {
        self.flush_when(model, |_| true)
    }

    /// Flush `model` only if its batch is still at or past `max_wait` at `now`.
    pub fn flush_if_expired(&self, model: &str, now: Instant) -> Result<FlushOutcome, EngineError> {
        let max_wait = self.config.current().policy_for(model).max_wait;
        self.flush_when(model, |open| open.age_at(now) >= max_wait)
    }

    fn flush_when<F>(&self, model: &str, due: F) -> Result<FlushOutcome, EngineError>
    where
        F: Fn(&OpenBatch) -> bool,
    {
        let gate = {
            let store = self.lock_store();
            match store.get(model) {
                Some(open) if !open.items.is_empty() => open.publish_gate.clone(),
                _ => return Ok(FlushOutcome::Empty),
            }
        };
        let _turn = gate.lock().unwrap_or_else(PoisonError::into_inner);

        let batch = {
            let mut store = self.lock_store();
            let Some(open) = store.get_mut(model) else {
                return Ok(FlushOutcome::Empty);
            };
            if open.items.is_empty() {
                return Ok(FlushOutcome::Empty);
            }
            if !due(open) {
                return Ok(FlushOutcome::NotDue);
            }
            let items = std::mem::take(&mut open.items);
            let opened_at = open.opened_wall;
            open.opened_at = Instant::now();
            open.opened_wall = Utc::now();
            Batch {
                model: model.to_string(),
                items,
                opened_at,
            }
        };

        let size = batch.len();
        match self.publisher.publish(&batch) {
            Ok(()) => {
                self.stats.record_published();
                log::info!("sent batch -> {} | size={}", model, size);
                Ok(FlushOutcome::Published { size })
            }
            Err(e) => {
                self.stats.record_publish_failure();
                Err(e)
            }
        }
    }

    /// Models whose non-empty batch is at or past its current `max_wait` at `now`.
    pub fn expired_models(&self, now: Instant) -> Vec<String> {
        let snapshot = self.config.current();
        let store = self.lock_store();
        store
            .iter()
            .filter(|(model, open)| {
                !open.items.is_empty() && open.age_at(now) >= snapshot.policy_for(model).max_wait
            })
            .map(|(model, _)| model.clone())
            .collect()
    }

    /// Flush every non-empty batch; publish errors are logged, not returned.
    pub fn flush_all(&self) -> usize {
        let models: Vec<String> = self.lock_store().keys().cloned().collect();
        let mut published = 0;
        for model in models {
            match self.flush(&model) {
                Ok(FlushOutcome::Published { .. }) => published += 1,
                Ok(_) => {}
                Err(e) => log::error!("final flush of {} dropped: {}", model, e),
            }
        }
        published
    }

    /// Items currently open for `model`.
    pub fn len(&self, model: &str) -> usize {
        self.lock_store()
            .get(model)
            .map(|open| open.items.len())
            .unwrap_or(0)
    }

    /// True when `model`'s open batch is at or over its current size limit.
    pub fn is_full(&self, model: &str) -> bool {
        let max = self.config.current().policy_for(model).max_batch_size;
        self.len(model) >= max
    }

    /// Items open across all models.
    pub fn pending(&self) -> usize {
        self.lock_store().values().map(|open| open.items.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::InMemoryPublisher;
    use crate::routing::{ConfigSnapshot, ModelPolicy, PolicyTable, RoutingKey, RoutingTable};
    use std::time::Duration;

    fn item(n: usize) -> BatchItem {
        BatchItem {
            frame_ref: format!("frame-{}", n),
            source: RoutingKey::new("plantA", "site1", "CAM01"),
            captured_at: Utc::now(),
        }
    }

    fn setup(policy: ModelPolicy) -> (BatchAccumulator, Arc<InMemoryPublisher>, Arc<SnapshotCell>) {
        let cell = Arc::new(SnapshotCell::new(ConfigSnapshot::new(
            RoutingTable::empty(),
            PolicyTable::empty().with_policy("m", policy),
        )));
        let publisher = Arc::new(InMemoryPublisher::new());
        let acc = BatchAccumulator::new(
            cell.clone(),
            publisher.clone(),
            Arc::new(EngineStats::default()),
        );
        (acc, publisher, cell)
    }

    #[test]
    fn admit_signals_at_max_size() {
        let (acc, publisher, _cell) =
            setup(ModelPolicy::new(3, Duration::from_secs(60)).unwrap());
        assert!(!acc.admit("m", item(1)).should_flush);
        assert!(!acc.admit("m", item(2)).should_flush);
        let outcome = acc.admit("m", item(3));
        assert_eq!(outcome.len, 3);
        assert!(outcome.should_flush);
        assert!(publisher.batches().is_empty());
    }

    #[test]
    fn first_admit_opens_batch_per_model() {
        let (acc, _publisher, _cell) = setup(ModelPolicy::default());
        assert_eq!(acc.admit("m", item(1)).len, 1);
        assert_eq!(acc.admit("other", item(2)).len, 1);
        assert_eq!(acc.admit("m", item(3)).len, 2);
        assert_eq!(acc.len("m"), 2);
        assert_eq!(acc.len("other"), 1);
    }

    #[test]
    fn flush_empty_is_noop() {
        let (acc, publisher, _cell) = setup(ModelPolicy::default());
        assert_eq!(acc.flush("m").unwrap(), FlushOutcome::Empty);
        assert_eq!(acc.flush("never-seen").unwrap(), FlushOutcome::Empty);
        assert_eq!(publisher.publish_calls(), 0);
    }

    #[test]
    fn flush_publishes_in_admit_order_and_clears() {
        let (acc, publisher, _cell) = setup(ModelPolicy::default());
        for n in 0..3 {
            acc.admit("m", item(n));
        }
        assert_eq!(acc.flush("m").unwrap(), FlushOutcome::Published { size: 3 });
        assert_eq!(acc.len("m"), 0);
        assert_eq!(acc.flush("m").unwrap(), FlushOutcome::Empty);

        let batches = publisher.batches();
        assert_eq!(batches.len(), 1);
        let refs: Vec<&str> = batches[0].items.iter().map(|i| i.frame_ref.as_str()).collect();
        assert_eq!(refs, vec!["frame-0", "frame-1", "frame-2"]);
    }

    #[test]
    fn expiry_uses_live_policy() {
        let (acc, publisher, cell) =
            setup(ModelPolicy::new(10, Duration::from_secs(60)).unwrap());
        acc.admit("m", item(1));
        let soon = Instant::now() + Duration::from_secs(5);
        assert!(acc.expired_models(soon).is_empty());
        assert_eq!(acc.flush_if_expired("m", soon).unwrap(), FlushOutcome::NotDue);

        cell.publish(ConfigSnapshot::new(
            RoutingTable::empty(),
            PolicyTable::empty().with_policy("m", ModelPolicy::new(10, Duration::from_secs(1)).unwrap()),
        ));
        assert_eq!(acc.expired_models(soon), vec!["m".to_string()]);
        assert_eq!(
            acc.flush_if_expired("m", soon).unwrap(),
            FlushOutcome::Published { size: 1 }
        );
        assert_eq!(publisher.batches().len(), 1);
    }

    #[test]
    fn publish_failure_drops_batch_without_requeue() {
        let (acc, publisher, _cell) = setup(ModelPolicy::default());
        acc.admit("m", item(1));
        publisher.set_failing(true);
        assert!(acc.flush("m").is_err());
        assert_eq!(acc.len("m"), 0);

        publisher.set_failing(false);
        assert_eq!(acc.flush("m").unwrap(), FlushOutcome::Empty);
        assert!(publisher.batches().is_empty());
    }

    #[test]
    fn flush_all_skips_empty_models() {
        let (acc, publisher, _cell) = setup(ModelPolicy::default());
        acc.admit("m", item(1));
        acc.admit("other", item(2));
        acc.flush("other").unwrap();
        assert_eq!(acc.flush_all(), 1);
        assert_eq!(publisher.batches().len(), 2);
        assert_eq!(acc.pending(), 0);
    }
}
