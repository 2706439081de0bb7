use chrono::{DateTime, Utc};

use crate::data::time::seconds_between;
use crate::data::{BucketConfig, Event, EventData};
use crate::storage::{EventStore, StoreError};

/// Pulse window used when the client does not send one
pub const DEFAULT_PULSETIME: f64 = 60.0;

/// Whether a heartbeat at `at` may extend `last` (whose data already matched).
///
/// The heartbeat must land at most `pulsetime` seconds after the end of
/// `last`, or, for a zero-duration `last`, after its start. Heartbeats that
/// land before that point never merge.
pub fn should_merge(last: &Event, at: DateTime<Utc>, pulsetime: f64) -> bool {
    let window = 0.0..=pulsetime;
    let gap_from_end = seconds_between(last.end(), at);
    let gap_from_start = seconds_between(last.timestamp, at);

    window.contains(&gap_from_end) || (last.duration == 0.0 && window.contains(&gap_from_start))
}

/// Apply one heartbeat to `bucket_id` and return the event that now
/// represents it.
///
/// Either the newest event is extended to reach the heartbeat (same data,
/// inside the pulse window) or a zero-duration event is started at the
/// heartbeat's timestamp. Never creates a second event at an already used
/// timestamp, including when another writer wins a race to that instant.
pub fn heartbeat<S: EventStore + ?Sized>(
    store: &S,
    bucket_id: &str,
    candidate: Event,
    pulsetime: f64,
) -> Result<Event, HeartbeatError> {
    let pulsetime = if pulsetime.is_finite() { pulsetime.max(0.0) } else { DEFAULT_PULSETIME };

    store.ensure_bucket(bucket_id, BucketConfig::implicit("heartbeat"))?;

    if let Some(last) = store.last_event(bucket_id)? {
        if last.data == candidate.data && should_merge(&last, candidate.timestamp, pulsetime) {
            let duration = seconds_between(last.timestamp, candidate.timestamp);
            let merged = store.extend_duration(bucket_id, last.timestamp, duration)?;
            tracing::debug!(
                "Heartbeat merged into {} @ {} (duration {:.3}s)",
                bucket_id,
                merged.timestamp,
                merged.duration
            );
            return Ok(merged);
        }
    }

    let timestamp = candidate.timestamp;
    if let Some(existing) = store.event_at(bucket_id, timestamp)? {
        return resolve_duplicate(store, bucket_id, existing, candidate.data);
    }

    match store.insert_if_absent(bucket_id, Event::new(timestamp, 0.0, candidate.data)) {
        Ok(event) => {
            tracing::debug!("Heartbeat started new event in {} @ {}", bucket_id, timestamp);
            Ok(event)
        }
        Err(StoreError::DuplicateTimestamp { .. }) => {
            tracing::warn!(
                "Concurrent heartbeat already created {} @ {}, returning stored event",
                bucket_id,
                timestamp
            );
            store
                .event_at(bucket_id, timestamp)?
                .ok_or_else(|| {
                    HeartbeatError::Store(StoreError::EventNotFound {
                        bucket: bucket_id.to_string(),
                        timestamp,
                    })
                })
        }
        Err(e) => Err(e.into()),
    }
}

/// A heartbeat repeated an existing timestamp: keep the event, refreshing its
/// data if the new heartbeat disagrees.
fn resolve_duplicate<S: EventStore + ?Sized>(
    store: &S,
    bucket_id: &str,
    existing: Event,
    data: EventData,
) -> Result<Event, HeartbeatError> {
    if existing.data == data {
        return Ok(existing);
    }
    Ok(store.replace_data(bucket_id, existing.timestamp, data)?)
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
