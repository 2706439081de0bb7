//! Write paths into the event store
//!
//! - Heartbeats, merged into the newest event of a bucket when possible
//! - Direct event insertion, via [`StorageEngine::upsert_events`](crate::storage::StorageEngine::upsert_events)

pub mod heartbeat;

pub use heartbeat::{heartbeat, should_merge, HeartbeatError, DEFAULT_PULSETIME};
