//! Hot reload of the routing and policy documents.
//!
//! The live `ConfigSnapshot` sits behind a `SnapshotCell`. Readers clone the
//! current `Arc` and work against that snapshot for as long as they hold it;
//! the reloader builds a complete replacement off to the side and swaps the
//! pointer. A document that changes but fails to parse leaves the previous
//! tables in service.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::EngineError;
use crate::routing::{ConfigSnapshot, DocumentVersion, PolicyTable, RoutingTable};
use crate::shutdown::Shutdown;

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(1);

/// Atomically swappable holder for the live snapshot.
///
/// Not lock-free: readers take the read lock for the length of one `Arc`
/// clone, and the writer holds the write lock only for the pointer swap.
/// Parsing and table building happen before `publish`, so a reader never
/// waits on a reload.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    inner: RwLock<Arc<ConfigSnapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current snapshot. The read guard is held only for the `Arc` clone.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the live snapshot, stamping it with the next generation.
    pub fn publish(&self, mut snapshot: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        snapshot.generation = guard.generation + 1;
        let published = Arc::new(snapshot);
        *guard = published.clone();
        published
    }
}

/// Source of one configuration document.
///
/// `version` is cheap and called every poll; `read` is only called after
/// the version moved.
pub trait ChangeDetector: Send {
    /// Document label used in logs.
    fn name(&self) -> &str;

    /// Current change marker, or an error when the document is unavailable.
    fn version(&self) -> Result<DocumentVersion>;

    /// Full document contents.
    fn read(&self) -> Result<Vec<u8>>;
}

/// Watches a file by modification time and length.
#[derive(Clone, Debug)]
pub struct FileChangeDetector {
    path: PathBuf,
    name: String,
}

impl FileChangeDetector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChangeDetector for FileChangeDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Result<DocumentVersion> {
        let meta = std::fs::metadata(&self.path)
            .map_err(|e| anyhow!("cannot stat {}: {}", self.path.display(), e))?;
        let modified = meta
            .modified()
            .map_err(|e| anyhow!("no mtime for {}: {}", self.path.display(), e))?;
        let mtime = DocumentVersion::from_system_time(modified);
        Ok(mtime.with_length(meta.len()))
    }

    fn read(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| anyhow!("cannot read {}: {}", self.path.display(), e))
    }
}

/// Document held in memory; each `update` bumps the version.
#[derive(Clone, Debug)]
pub struct MemoryDocument {
    name: String,
    state: Arc<Mutex<(u128, Option<Vec<u8>>)>>,
}

impl MemoryDocument {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new((1, Some(contents.into())))),
        }
    }

    pub fn update(&self, contents: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.0 += 1;
        state.1 = Some(contents.into());
    }

    /// Simulates the document disappearing.
    pub fn remove(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.0 += 1;
        state.1 = None;
    }
}

impl ChangeDetector for MemoryDocument {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Result<DocumentVersion> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.1 {
            Some(_) => Ok(DocumentVersion::new(state.0)),
            None => Err(anyhow!("{} is missing", self.name)),
        }
    }

    fn read(&self) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .1
            .clone()
            .ok_or_else(|| anyhow!("{} is missing", self.name))
    }
}

/// What a single reload poll did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    Unchanged,
    Published { generation: u64 },
    /// A changed document was rejected; the previous snapshot stays live.
    Rejected,
}

#[derive(Default)]
struct WatchState {
    seen: Option<DocumentVersion>,
    unavailable: bool,
}

enum Staged<T> {
    Keep,
    Replace(T, DocumentVersion),
    Rejected,
}

/// Polls both documents and publishes new snapshots into a `SnapshotCell`.
pub struct ConfigReloader {
    cell: Arc<SnapshotCell>,
    routing: Box<dyn ChangeDetector>,
    policies: Box<dyn ChangeDetector>,
    routing_state: WatchState,
    policy_state: WatchState,
}

impl ConfigReloader {
    pub fn new(
        cell: Arc<SnapshotCell>,
        routing: Box<dyn ChangeDetector>,
        policies: Box<dyn ChangeDetector>,
    ) -> Self {
        Self {
            cell,
            routing,
            policies,
            routing_state: WatchState::default(),
            policy_state: WatchState::default(),
        }
    }

    pub fn cell(&self) -> &Arc<SnapshotCell> {
        &self.cell
    }

    /// Check both documents once and publish if either changed and parsed.
    pub fn poll_once(&mut self) -> ReloadOutcome {
        let routing = stage(
            self.routing.as_ref(),
            &mut self.routing_state,
            RoutingTable::from_json,
        );
        let policies = stage(
            self.policies.as_ref(),
            &mut self.policy_state,
            PolicyTable::from_json,
        );

        let rejected = matches!(routing, Staged::Rejected) || matches!(policies, Staged::Rejected);
        if matches!(routing, Staged::Keep | Staged::Rejected)
            && matches!(policies, Staged::Keep | Staged::Rejected)
        {
            return if rejected {
                ReloadOutcome::Rejected
            } else {
                ReloadOutcome::Unchanged
            };
        }

        let current = self.cell.current();
        let mut next = ConfigSnapshot {
            routing: current.routing.clone(),
            policies: current.policies.clone(),
            routing_version: current.routing_version,
            policy_version: current.policy_version,
            generation: current.generation,
        };
        if let Staged::Replace(table, version) = routing {
            next.routing = Arc::new(table);
            next.routing_version = Some(version);
        }
        if let Staged::Replace(table, version) = policies {
            next.policies = Arc::new(table);
            next.policy_version = Some(version);
        }

        let published = self.cell.publish(next);
        log::info!(
            "config snapshot {} published: {} routes, {} model policies",
            published.generation,
            published.routing.len(),
            published.policies.len()
        );
        ReloadOutcome::Published {
            generation: published.generation,
        }
    }

    /// Poll until shutdown is observed.
    pub fn run(mut self, interval: Duration, shutdown: Shutdown) {
        log::info!("config reloader started (interval {:?})", interval);
        while !shutdown.wait(interval) {
            self.poll_once();
        }
        log::info!("config reloader stopped");
    }
}

fn stage<T>(
    detector: &dyn ChangeDetector,
    state: &mut WatchState,
    parse: fn(&[u8]) -> Result<T>,
) -> Staged<T> {
    let version = match detector.version() {
        Ok(version) => {
            if state.unavailable {
                log::info!("config document {} is available again", detector.name());
                state.unavailable = false;
            }
            version
        }
        Err(e) => {
            if !state.unavailable {
                log::warn!("{}; keeping previous tables", e);
                state.unavailable = true;
            }
            return Staged::Keep;
        }
    };
    if state.seen == Some(version) {
        return Staged::Keep;
    }
    // Recorded before parsing so a bad document is reported once, not every poll.
    state.seen = Some(version);

    let parsed = detector.read().and_then(|raw| parse(&raw));
    match parsed {
        Ok(table) => {
            log::info!("reloaded config document {}", detector.name());
            Staged::Replace(table, version)
        }
        Err(e) => {
            let err = EngineError::ConfigParse {
                document: detector.name().to_string(),
                reason: e.to_string(),
            };
            log::warn!("{}; keeping previous tables", err);
            Staged::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingKey;

    const ROUTES_V1: &str = r#"{"plantA": {"site1": {"CAM01": "yolo_model"}}}"#;
    const ROUTES_V2: &str = r#"{"plantA": {"site1": {"CAM01": "ppe_model"}}}"#;
    const POLICIES: &str = r#"{"yolo_model": {"batch_size": 2, "max_wait_time": 1}}"#;

    fn reloader() -> (ConfigReloader, MemoryDocument, MemoryDocument) {
        let routing = MemoryDocument::new("routing", ROUTES_V1);
        let policies = MemoryDocument::new("policies", POLICIES);
        let reloader = ConfigReloader::new(
            Arc::new(SnapshotCell::default()),
            Box::new(routing.clone()),
            Box::new(policies.clone()),
        );
        (reloader, routing, policies)
    }

    fn cam01() -> RoutingKey {
        RoutingKey::new("plantA", "site1", "CAM01")
    }

    #[test]
    fn first_poll_publishes_both_tables() {
        let (mut reloader, _routing, _policies) = reloader();
        assert_eq!(
            reloader.poll_once(),
            ReloadOutcome::Published { generation: 1 }
        );
        let snap = reloader.cell().current();
        assert_eq!(snap.resolve(&cam01()), Some("yolo_model"));
        assert_eq!(snap.policy_for("yolo_model").max_batch_size, 2);
        assert_eq!(reloader.poll_once(), ReloadOutcome::Unchanged);
    }

    #[test]
    fn routing_change_keeps_policy_table() {
        let (mut reloader, routing, _policies) = reloader();
        reloader.poll_once();
        let before = reloader.cell().current();

        routing.update(ROUTES_V2);
        assert_eq!(
            reloader.poll_once(),
            ReloadOutcome::Published { generation: 2 }
        );
        let after = reloader.cell().current();
        assert_eq!(after.resolve(&cam01()), Some("ppe_model"));
        assert!(Arc::ptr_eq(&before.policies, &after.policies));
        // The old snapshot is untouched for readers still holding it.
        assert_eq!(before.resolve(&cam01()), Some("yolo_model"));
    }

    #[test]
    fn corrupt_document_is_rejected_once() {
        let (mut reloader, routing, _policies) = reloader();
        reloader.poll_once();

        routing.update("{ not json");
        assert_eq!(reloader.poll_once(), ReloadOutcome::Rejected);
        assert_eq!(reloader.poll_once(), ReloadOutcome::Unchanged);
        let snap = reloader.cell().current();
        assert_eq!(snap.generation, 1);
        assert_eq!(snap.resolve(&cam01()), Some("yolo_model"));

        routing.update(ROUTES_V2);
        assert_eq!(
            reloader.poll_once(),
            ReloadOutcome::Published { generation: 2 }
        );
    }

    #[test]
    fn oversized_wait_keeps_previous_policies() {
        let (mut reloader, _routing, policies) = reloader();
        reloader.poll_once();

        policies.update(r#"{"yolo_model": {"batch_size": 3, "max_wait_time": 1e30}}"#);
        assert_eq!(reloader.poll_once(), ReloadOutcome::Rejected);
        let snap = reloader.cell().current();
        assert_eq!(snap.generation, 1);
        assert_eq!(snap.policy_for("yolo_model").max_batch_size, 2);
    }

    #[test]
    fn missing_document_is_not_an_empty_table() {
        let (mut reloader, routing, _policies) = reloader();
        reloader.poll_once();
        routing.remove();
        assert_eq!(reloader.poll_once(), ReloadOutcome::Unchanged);
        assert_eq!(reloader.cell().current().resolve(&cam01()), Some("yolo_model"));
    }

    #[test]
    fn file_detector_tracks_mtime() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("routing_config.json");
        std::fs::write(&path, ROUTES_V1)?;
        let detector = FileChangeDetector::new(&path);
        let v1 = detector.version()?;
        assert_eq!(detector.version()?, v1);

        std::fs::write(&path, ROUTES_V2)?;
        let bumped = std::time::SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)?
            .set_modified(bumped)?;
        assert_ne!(detector.version()?, v1);
        assert_eq!(detector.read()?, ROUTES_V2.as_bytes());
        Ok(())
    }
}
