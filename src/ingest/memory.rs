use chrono::{DateTime, Utc};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::routing::RoutingKey;

use super::{EventSource, FrameEvent, LogPosition};

#[derive(Default)]
struct LogState {
    entries: Vec<FrameEvent>,
    next_position: u64,
}

/// Append-only in-process event log. Entries are never removed.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    inner: Arc<(Mutex<LogState>, Condvar)>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame; the log assigns the position.
    pub fn append(
        &self,
        source: RoutingKey,
        captured_at: DateTime<Utc>,
        payload: impl Into<Vec<u8>>,
    ) -> LogPosition {
        let mut state = self.lock();
        state.next_position += 1;
        let position = LogPosition(state.next_position);
        state.entries.push(FrameEvent {
            source,
            captured_at,
            payload: payload.into(),
            position,
        });
        drop(state);
        self.inner.1.notify_all();
        position
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader positioned at the current head: it only sees later appends.
    pub fn tail_reader(&self) -> InMemoryLogReader {
        let cursor = self.len();
        InMemoryLogReader {
            log: self.clone(),
            cursor,
        }
    }
}

/// Tail-only reader over an `InMemoryEventLog`.
pub struct InMemoryLogReader {
    log: InMemoryEventLog,
    cursor: usize,
}

impl EventSource for InMemoryLogReader {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<FrameEvent>, EngineError> {
        let deadline = Instant::now() + timeout;
        let (lock, ready) = &*self.log.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(event) = state.entries.get(self.cursor) {
                self.cursor += 1;
                return Ok(Some(event.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RoutingKey {
        RoutingKey::new("plantA", "site1", "CAM01")
    }

    #[test]
    fn reader_starts_at_tail() {
        let log = InMemoryEventLog::new();
        log.append(key(), Utc::now(), b"old".to_vec());
        let mut reader = log.tail_reader();
        assert!(reader.next_event(Duration::from_millis(10)).unwrap().is_none());

        let pos = log.append(key(), Utc::now(), b"new".to_vec());
        let event = reader.next_event(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(event.position, pos);
        assert_eq!(event.payload, b"new");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn reader_wakes_on_append_from_other_thread() {
        let log = InMemoryEventLog::new();
        let mut reader = log.tail_reader();
        let writer = log.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.append(key(), Utc::now(), b"frame".to_vec());
        });
        let event = reader.next_event(Duration::from_secs(5)).unwrap();
        assert!(event.is_some());
        handle.join().unwrap();
    }
}
