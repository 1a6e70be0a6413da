use anyhow::{anyhow, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::EngineError;
use crate::ingest::FrameEvent;
use crate::publish::format_timestamp;

/// Durable home for frame payloads.
///
/// `store` returns a reference (a path, key or URL) that downstream model
/// workers can resolve to the stored bytes.
pub trait FrameSink: Send {
    fn store(&mut self, frame: &FrameEvent) -> Result<String, EngineError>;
}

/// Writes frames under a directory tree and catalogs them in SQLite.
pub struct DiskFrameSink {
    root: PathBuf,
    conn: Connection,
}

impl DiskFrameSink {
    pub fn open(frames_dir: impl AsRef<Path>, catalog_path: &str) -> Result<Self> {
        let root = frames_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| anyhow!("create frames dir {}: {}", root.display(), e))?;
        if !catalog_path.starts_with("file:") && catalog_path != ":memory:" {
            if let Some(parent) = Path::new(catalog_path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = open_catalog(catalog_path)?;
        let mut sink = Self { root, conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS frames (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              frame_path TEXT NOT NULL,
              source_group TEXT NOT NULL,
              source_subgroup TEXT NOT NULL,
              source_id TEXT NOT NULL,
              captured_at TEXT NOT NULL,
              stored_at TEXT NOT NULL,
              position INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_frames_source
              ON frames(source_group, source_subgroup, source_id, captured_at);
            "#,
        )?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk path a frame is written to.
    pub fn frame_path(&self, frame: &FrameEvent) -> Result<PathBuf, EngineError> {
        let key = &frame.source;
        let mut path = self.root.clone();
        for component in [&key.source_group, &key.source_subgroup, &key.source_id] {
            path.push(sanitize_component(component)?);
        }
        path.push(frame.captured_at.format("%Y_%m_%d_%H").to_string());
        path.push(format!(
            "{}_{}.jpg",
            frame.captured_at.format("%M%S_%6f"),
            frame.position
        ));
        Ok(path)
    }

    pub fn frame_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM frames", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl FrameSink for DiskFrameSink {
    fn store(&mut self, frame: &FrameEvent) -> Result<String, EngineError> {
        let path = self.frame_path(frame)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_atomic(&path, &frame.payload)?;

        let frame_path = path.to_string_lossy().into_owned();
        self.conn.execute(
            "INSERT INTO frames(frame_path, source_group, source_subgroup, source_id, captured_at, stored_at, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                frame_path,
                frame.source.source_group,
                frame.source.source_subgroup,
                frame.source.source_id,
                format_timestamp(&frame.captured_at),
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                frame.position.0 as i64,
            ],
        )?;
        Ok(frame_path)
    }
}

fn open_catalog(catalog_path: &str) -> Result<Connection> {
    if catalog_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            catalog_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(catalog_path)?)
}

/// Source identities become directory names; refuse anything that could escape the root.
fn sanitize_component(raw: &str) -> Result<&str, EngineError> {
    if raw.is_empty()
        || raw == "."
        || raw == ".."
        || raw.contains(['/', '\\', '\0'])
    {
        return Err(EngineError::persistence(format!(
            "unsafe path component {:?}",
            raw
        )));
    }
    Ok(raw)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), EngineError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[derive(Default)]
struct MemorySinkState {
    stored: Vec<String>,
    calls: usize,
    fail_next: usize,
}

/// Keeps frames in memory. Clones share state, so a test can keep a handle
/// after moving the sink into an ingest loop.
#[derive(Clone, Default)]
pub struct InMemoryFrameSink {
    inner: Arc<Mutex<MemorySinkState>>,
}

impl InMemoryFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemorySinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` calls to `store` fail.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Frame references of successfully stored frames, in store order.
    pub fn stored(&self) -> Vec<String> {
        self.lock().stored.clone()
    }

    pub fn store_calls(&self) -> usize {
        self.lock().calls
    }
}

impl FrameSink for InMemoryFrameSink {
    fn store(&mut self, frame: &FrameEvent) -> Result<String, EngineError> {
        let mut state = self.lock();
        state.calls += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(EngineError::persistence("sink unavailable"));
        }
        let frame_ref = format!("mem://{}/{}", frame.source, frame.position);
        state.stored.push(frame_ref.clone());
        Ok(frame_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::LogPosition;
    use crate::routing::RoutingKey;
    use chrono::TimeZone;

    fn frame(camera: &str, position: u64) -> FrameEvent {
        FrameEvent {
            source: RoutingKey::new("plantA", "site1", camera),
            captured_at: Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 7).unwrap(),
            payload: b"\xff\xd8jpeg".to_vec(),
            position: LogPosition(position),
        }
    }

    #[test]
    fn disk_sink_writes_file_and_catalog_row() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("frames.db");
        let mut sink =
            DiskFrameSink::open(dir.path().join("frames"), catalog.to_str().unwrap()).unwrap();

        let frame_ref = sink.store(&frame("CAM01", 42)).unwrap();
        let expected = dir
            .path()
            .join("frames/plantA/site1/CAM01/2024_05_01_13/4507_000000_42.jpg");
        assert_eq!(Path::new(&frame_ref), expected.as_path());
        assert_eq!(fs::read(&expected).unwrap(), b"\xff\xd8jpeg");
        assert!(!expected.with_extension("tmp").exists());
        assert_eq!(sink.frame_count().unwrap(), 1);
    }

    #[test]
    fn disk_sink_rejects_escaping_source_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DiskFrameSink::open(dir.path(), ":memory:").unwrap();
        let err = sink.store(&frame("..", 1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
        let err = sink.store(&frame("a/b", 2)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
        assert_eq!(sink.frame_count().unwrap(), 0);
    }

    #[test]
    fn memory_sink_fails_on_demand() {
        let mut sink = InMemoryFrameSink::new();
        let handle = sink.clone();
        handle.fail_next(1);
        assert!(sink.store(&frame("CAM01", 1)).is_err());
        let frame_ref = sink.store(&frame("CAM01", 2)).unwrap();
        assert_eq!(frame_ref, "mem://plantA/site1/CAM01/2");
        assert_eq!(handle.store_calls(), 2);
        assert_eq!(handle.stored(), vec![frame_ref]);
    }
}
