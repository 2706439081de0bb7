use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::data::{Bucket, BucketConfig, Event, EventData};

/// Events of one bucket, indexed by timestamp.
///
/// The timestamp key doubles as the `(bucket, timestamp)` uniqueness
/// constraint: at most one event exists per instant.
#[derive(Debug)]
pub struct BucketTable {
    meta: RwLock<Bucket>,
    events: RwLock<BTreeMap<DateTime<Utc>, Event>>,
}

impl BucketTable {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            meta: RwLock::new(bucket),
            events: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn bucket(&self) -> Bucket {
        self.meta.read().clone()
    }

    pub fn id(&self) -> String {
        self.meta.read().id.clone()
    }

    pub fn update_meta(&self, config: BucketConfig) -> Bucket {
        let mut meta = self.meta.write();
        meta.apply(config);
        meta.clone()
    }

    pub fn last(&self) -> Option<Event> {
        self.events.read().values().next_back().cloned()
    }

    pub fn get(&self, timestamp: DateTime<Utc>) -> Option<Event> {
        self.events.read().get(&timestamp).cloned()
    }

    /// Insert unless the timestamp is taken. On conflict the stored event is
    /// returned as the error value.
    pub fn insert_if_absent(&self, event: Event) -> Result<Event, Event> {
        let mut events = self.events.write();
        if let Some(existing) = events.get(&event.timestamp) {
            return Err(existing.clone());
        }
        events.insert(event.timestamp, event.clone());
        Ok(event)
    }

    /// Insert, replacing whatever is stored at the same timestamp. The stored
    /// event keeps its id.
    pub fn upsert(&self, mut event: Event) -> Event {
        let mut events = self.events.write();
        if let Some(existing) = events.get(&event.timestamp) {
            event.id = existing.id;
        }
        events.insert(event.timestamp, event.clone());
        event
    }

    /// Grow the duration of the event at `timestamp`. Never shrinks it.
    pub fn extend_duration(&self, timestamp: DateTime<Utc>, duration: f64) -> Option<Event> {
        let mut events = self.events.write();
        let event = events.get_mut(&timestamp)?;
        if duration > event.duration {
            event.duration = duration;
        }
        Some(event.clone())
    }

    pub fn replace_data(&self, timestamp: DateTime<Utc>, data: EventData) -> Option<Event> {
        let mut events = self.events.write();
        let event = events.get_mut(&timestamp)?;
        event.data = data;
        Some(event.clone())
    }

    /// Events with `start <= timestamp <= end`, oldest first.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Event> {
        if start > end {
            return Vec::new();
        }
        self.events
            .read()
            .range(start..=end)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Newest-first listing with optional inclusive bounds.
    pub fn latest(
        &self,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Event> {
        self.events
            .read()
            .values()
            .rev()
            .filter(|e| start.map_or(true, |s| e.timestamp >= s))
            .filter(|e| end.map_or(true, |t| e.timestamp <= t))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn max_id(&self) -> i64 {
        self.events
            .read()
            .values()
            .filter_map(|e| e.id)
            .max()
            .unwrap_or(0)
    }
}
