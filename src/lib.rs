//! Timekeep: Activity Tracking Server
//!
//! Clients push timestamped events (active window, AFK status) into named
//! buckets, and a small query language turns stored events into aggregated
//! views such as time spent per application.
//!
//! # Features
//!
//! - **Heartbeats**: consecutive identical heartbeats grow one event instead of
//!   creating many
//! - **Unique Timestamps**: at most one event per bucket and instant, also under
//!   concurrent writers
//! - **Query Language**: assignments over a fixed operator set, evaluated per
//!   time period in parallel
//! - **Interval Intersection**: clip events to the periods covered by another bucket
//! - **Key Merging**: group events by data keys and sum their durations
//! - **Snapshots**: lz4-compressed snapshots of all buckets, restored on start-up
//!
//! # Example
//!
//! ```no_run
//! use timekeep::data::{Event, EventData};
//! use timekeep::ingest::heartbeat;
//! use timekeep::query::run_query;
//! use timekeep::storage::StorageEngine;
//!
//! let engine = StorageEngine::new();
//!
//! let mut data = EventData::new();
//! data.insert("app".to_string(), "editor".into());
//! heartbeat(&engine, "aw-watcher-window_laptop", Event::new(chrono::Utc::now(), 0.0, data), 60.0).unwrap();
//!
//! let periods = vec!["2024-03-01T00:00:00Z/2024-03-02T00:00:00Z".to_string()];
//! let query = vec![
//!     "events = query_bucket(\"aw-watcher-window_laptop\");".to_string(),
//!     "RETURN = merge_events_by_keys(events, [\"app\"]);".to_string(),
//! ];
//! let results = run_query(&engine, &periods, &query).unwrap();
//! println!("Results: {:?}", results);
//! ```

pub mod api;
pub mod data;
pub mod ingest;
pub mod query;
pub mod storage;

// Re-export commonly used types
pub use data::{Bucket, Event, EventData, Value};
pub use query::{run_query, QueryError};
pub use storage::{EventStore, StorageEngine, StoreError};
