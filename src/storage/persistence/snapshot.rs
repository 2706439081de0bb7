//! Snapshot manager for writing and restoring the event store

use super::{PersistenceConfig, PersistenceError};
use crate::data::{Bucket, Event};
use crate::storage::StorageEngine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;

const SNAPSHOT_FILE: &str = "events.snapshot";
const SNAPSHOT_TMP_FILE: &str = "events.snapshot.tmp";
const SCHEMA_VERSION: u32 = 1;

/// Snapshot metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub buckets: usize,
    pub events: usize,
    /// Compressed size on disk
    pub size_bytes: usize,
    /// Store revision the snapshot was taken at
    pub revision: u64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotFile {
    schema_version: u32,
    created_at: DateTime<Utc>,
    buckets: Vec<BucketSnapshot>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct BucketSnapshot {
    bucket: Bucket,
    events: Vec<Event>,
}

/// Writes the store to `<data_dir>/events.snapshot` and reads it back
pub struct SnapshotManager {
    config: PersistenceConfig,
    /// Serialises concurrent snapshot writers (worker tick vs. shutdown)
    write_lock: Mutex<()>,
}

impl SnapshotManager {
    pub fn new(config: PersistenceConfig) -> Result<Self, PersistenceError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            config,
            write_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    fn snapshot_path(&self) -> PathBuf {
        self.config.data_dir.join(SNAPSHOT_FILE)
    }

    /// Write a snapshot of every bucket. The file is replaced atomically.
    pub fn create_snapshot(
        &self,
        engine: &StorageEngine,
    ) -> Result<SnapshotMetadata, PersistenceError> {
        let _guard = self.write_lock.lock();

        let revision = engine.revision();
        let buckets: Vec<BucketSnapshot> = engine
            .export_all()
            .into_iter()
            .map(|(bucket, events)| BucketSnapshot { bucket, events })
            .collect();
        let event_count = buckets.iter().map(|b| b.events.len()).sum();

        let file = SnapshotFile {
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            buckets,
        };

        let json = serde_json::to_vec(&file)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let tmp_path = self.config.data_dir.join(SNAPSHOT_TMP_FILE);
        fs::write(&tmp_path, &compressed)?;
        fs::rename(&tmp_path, self.snapshot_path())?;

        Ok(SnapshotMetadata {
            created_at: file.created_at,
            buckets: file.buckets.len(),
            events: event_count,
            size_bytes: compressed.len(),
            revision,
        })
    }

    /// Restore the latest snapshot into `engine`. Returns `None` when no
    /// snapshot has been written yet.
    pub fn restore_latest(
        &self,
        engine: &StorageEngine,
    ) -> Result<Option<SnapshotMetadata>, PersistenceError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let compressed = fs::read(&path)?;
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| PersistenceError::Corrupted(e.to_string()))?;
        let file: SnapshotFile = serde_json::from_slice(&json)
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;

        if file.schema_version != SCHEMA_VERSION {
            return Err(PersistenceError::Corrupted(format!(
                "unsupported snapshot version {}",
                file.schema_version
            )));
        }

        let buckets = file.buckets.len();
        let mut events = 0;
        for snapshot in file.buckets {
            events += snapshot.events.len();
            engine.restore_bucket(snapshot.bucket, snapshot.events);
        }

        Ok(Some(SnapshotMetadata {
            created_at: file.created_at,
            buckets,
            events,
            size_bytes: compressed.len(),
            revision: engine.revision(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BucketConfig, EventData};
    use crate::storage::EventStore;
    use chrono::TimeZone;

    fn populated_engine() -> StorageEngine {
        let engine = StorageEngine::with_hostname("desk");
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut data = EventData::new();
        data.insert("status".into(), serde_json::json!("not-afk"));

        engine.create_or_update_bucket("afk", BucketConfig::default().with_type("afkstatus"));
        engine.upsert_events("afk", vec![Event::new(ts, 300.0, data)]);
        engine.upsert_events("window", vec![Event::new(ts, 60.0, EventData::new())]);
        engine
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(PersistenceConfig::new(dir.path())).unwrap();

        let source = populated_engine();
        let written = manager.create_snapshot(&source).unwrap();
        assert_eq!(written.buckets, 2);
        assert_eq!(written.events, 2);

        let restored = StorageEngine::new();
        let read = manager.restore_latest(&restored).unwrap().unwrap();
        assert_eq!(read.events, 2);

        assert_eq!(restored.get_bucket("afk").unwrap().bucket_type, "afkstatus");
        let afk = restored.last_event("afk").unwrap().unwrap();
        assert_eq!(afk.duration, 300.0);
        assert_eq!(afk.data["status"], serde_json::json!("not-afk"));
        assert_eq!(afk, source.last_event("afk").unwrap().unwrap());
    }

    #[test]
    fn test_restore_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(PersistenceConfig::new(dir.path())).unwrap();
        assert!(manager.restore_latest(&StorageEngine::new()).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(PersistenceConfig::new(dir.path())).unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), [5u8, 0, 0, 0, 0xF0, 0x01]).unwrap();

        assert!(manager.restore_latest(&StorageEngine::new()).is_err());
    }
}
