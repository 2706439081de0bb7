use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use super::bucket::BucketTable;
use crate::data::{Bucket, BucketConfig, Event, EventData};

/// The store operations the heartbeat engine and the query evaluator rely on.
///
/// Implementations must enforce uniqueness of `(bucket_id, timestamp)`:
/// `insert_if_absent` reports a taken timestamp as
/// [`StoreError::DuplicateTimestamp`] instead of writing a second event.
pub trait EventStore: Send + Sync {
    /// Return the bucket, creating it from `config` if absent. Idempotent.
    fn ensure_bucket(&self, bucket_id: &str, config: BucketConfig) -> Result<Bucket, StoreError>;

    fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError>;

    /// Most recent event by timestamp.
    fn last_event(&self, bucket_id: &str) -> Result<Option<Event>, StoreError>;

    fn event_at(
        &self,
        bucket_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Event>, StoreError>;

    fn insert_if_absent(&self, bucket_id: &str, event: Event) -> Result<Event, StoreError>;

    /// Atomically raise the duration of the event at `timestamp`.
    fn extend_duration(
        &self,
        bucket_id: &str,
        timestamp: DateTime<Utc>,
        duration: f64,
    ) -> Result<Event, StoreError>;

    fn replace_data(
        &self,
        bucket_id: &str,
        timestamp: DateTime<Utc>,
        data: EventData,
    ) -> Result<Event, StoreError>;

    /// Events with `start <= timestamp <= end`, ascending.
    fn range(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError>;
}

/// In-memory event store holding every bucket
pub struct StorageEngine {
    buckets: DashMap<String, Arc<BucketTable>>,
    /// Next event id
    next_id: AtomicI64,
    /// Bumped on every write, used to skip idle snapshots
    revision: AtomicU64,
    /// Hostname recorded on buckets created without one
    hostname: String,
}

impl StorageEngine {
    pub fn new() -> Self {
        Self::with_hostname("unknown")
    }

    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self {
            buckets: DashMap::new(),
            next_id: AtomicI64::new(1),
            revision: AtomicU64::new(0),
            hostname: hostname.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn assign_id(&self, event: &mut Event) {
        if event.id.is_none() {
            event.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst));
        }
    }

    fn table(&self, bucket_id: &str) -> Result<Arc<BucketTable>, StoreError> {
        self.buckets
            .get(bucket_id)
            .map(|t| Arc::clone(&t))
            .ok_or_else(|| StoreError::BucketNotFound(bucket_id.to_string()))
    }

    fn get_or_create_table(&self, bucket_id: &str, config: BucketConfig) -> Arc<BucketTable> {
        if let Some(table) = self.buckets.get(bucket_id) {
            return Arc::clone(&table);
        }

        // The entry API makes concurrent first writes agree on a single table
        let table = Arc::clone(
            self.buckets
                .entry(bucket_id.to_string())
                .or_insert_with(|| {
                    tracing::info!("Creating bucket '{}'", bucket_id);
                    Arc::new(BucketTable::new(Bucket::create(bucket_id, config, &self.hostname)))
                })
                .value(),
        );
        self.touch();
        table
    }

    pub fn get_bucket(&self, bucket_id: &str) -> Option<Bucket> {
        self.buckets.get(bucket_id).map(|t| t.bucket())
    }

    /// Create a bucket, or update the metadata of an existing one
    pub fn create_or_update_bucket(&self, bucket_id: &str, config: BucketConfig) -> Bucket {
        if let Some(table) = self.buckets.get(bucket_id).map(|t| Arc::clone(&t)) {
            let bucket = table.update_meta(config);
            self.touch();
            return bucket;
        }
        self.get_or_create_table(bucket_id, config).bucket()
    }

    /// Drop a bucket together with its events
    pub fn delete_bucket(&self, bucket_id: &str) -> Result<(), StoreError> {
        if self.buckets.remove(bucket_id).is_none() {
            return Err(StoreError::BucketNotFound(bucket_id.to_string()));
        }
        self.touch();
        tracing::info!("Deleted bucket '{}'", bucket_id);
        Ok(())
    }

    /// Insert events directly, creating the bucket if needed. An event whose
    /// timestamp is already used replaces the stored one.
    pub fn upsert_events(&self, bucket_id: &str, events: Vec<Event>) -> Vec<Event> {
        let table = self.get_or_create_table(bucket_id, BucketConfig::implicit("auto"));
        let stored = events
            .into_iter()
            .map(|mut event| {
                self.assign_id(&mut event);
                table.upsert(event)
            })
            .collect();
        self.touch();
        stored
    }

    pub fn latest_events(
        &self,
        bucket_id: &str,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(self.table(bucket_id)?.latest(limit, start, end))
    }

    pub fn event_count(&self, bucket_id: &str) -> usize {
        self.buckets.get(bucket_id).map(|t| t.len()).unwrap_or(0)
    }

    pub fn total_events(&self) -> usize {
        self.buckets.iter().map(|e| e.value().len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket metadata plus all of its events, oldest first
    pub fn export_bucket(&self, bucket_id: &str) -> Result<(Bucket, Vec<Event>), StoreError> {
        let table = self.table(bucket_id)?;
        Ok((table.bucket(), table.all()))
    }

    pub fn export_all(&self) -> Vec<(Bucket, Vec<Event>)> {
        let mut tables: Vec<Arc<BucketTable>> =
            self.buckets.iter().map(|e| Arc::clone(e.value())).collect();
        tables.sort_by_key(|t| t.id());
        tables.iter().map(|t| (t.bucket(), t.all())).collect()
    }

    /// Load a bucket and its events verbatim, e.g. from a snapshot
    pub fn restore_bucket(&self, bucket: Bucket, events: Vec<Event>) {
        let table = Arc::new(BucketTable::new(bucket.clone()));
        for mut event in events {
            self.assign_id(&mut event);
            table.upsert(event);
        }

        let max_id = table.max_id();
        self.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        self.buckets.insert(bucket.id, table);
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for StorageEngine {
    fn ensure_bucket(&self, bucket_id: &str, config: BucketConfig) -> Result<Bucket, StoreError> {
        Ok(self.get_or_create_table(bucket_id, config).bucket())
    }

    fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError> {
        let mut buckets: Vec<Bucket> = self.buckets.iter().map(|e| e.value().bucket()).collect();
        buckets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(buckets)
    }

    fn last_event(&self, bucket_id: &str) -> Result<Option<Event>, StoreError> {
        Ok(self.table(bucket_id)?.last())
    }

    fn event_at(
        &self,
        bucket_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Event>, StoreError> {
        Ok(self.table(bucket_id)?.get(timestamp))
    }

    fn insert_if_absent(&self, bucket_id: &str, mut event: Event) -> Result<Event, StoreError> {
        let table = self.table(bucket_id)?;
        self.assign_id(&mut event);
        let timestamp = event.timestamp;

        let inserted = table
            .insert_if_absent(event)
            .map_err(|_| StoreError::DuplicateTimestamp {
                bucket: bucket_id.to_string(),
                timestamp,
            })?;
        self.touch();
        Ok(inserted)
    }

    fn extend_duration(
        &self,
        bucket_id: &str,
        timestamp: DateTime<Utc>,
        duration: f64,
    ) -> Result<Event, StoreError> {
        let event = self
            .table(bucket_id)?
            .extend_duration(timestamp, duration)
            .ok_or_else(|| StoreError::EventNotFound {
                bucket: bucket_id.to_string(),
                timestamp,
            })?;
        self.touch();
        Ok(event)
    }

    fn replace_data(
        &self,
        bucket_id: &str,
        timestamp: DateTime<Utc>,
        data: EventData,
    ) -> Result<Event, StoreError> {
        let event = self
            .table(bucket_id)?
            .replace_data(timestamp, data)
            .ok_or_else(|| StoreError::EventNotFound {
                bucket: bucket_id.to_string(),
                timestamp,
            })?;
        self.touch();
        Ok(event)
    }

    fn range(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(self.table(bucket_id)?.range(start, end))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Bucket '{0}' not found")]
    BucketNotFound(String),

    #[error("Bucket '{bucket}' already has an event at {timestamp}")]
    DuplicateTimestamp {
        bucket: String,
        timestamp: DateTime<Utc>,
    },

    #[error("Bucket '{bucket}' has no event at {timestamp}")]
    EventNotFound {
        bucket: String,
        timestamp: DateTime<Utc>,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
