//! Query operators over in-memory event sequences
//!
//! Every function here is pure: inputs are borrowed, results are fresh vectors.

use chrono::DateTime;
use fxhash::FxHashMap;

use crate::data::time::seconds_to_micros;
use crate::data::{Bucket, Event, EventData};

/// Keep events whose `data[key]` equals one of `values`.
///
/// Numbers compare by value, so a literal `1` matches a stored `1.0`.
pub fn filter_keyvals(events: &[Event], key: &str, values: &[serde_json::Value]) -> Vec<Event> {
    events
        .iter()
        .filter(|e| {
            e.data
                .get(key)
                .map_or(false, |stored| values.iter().any(|v| json_eq(stored, v)))
        })
        .cloned()
        .collect()
}

fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Clip `events` to the periods covered by `filter`.
///
/// Both inputs are ordered by start and walked with two cursors. Every
/// overlap emits a copy of the `events` element trimmed to the overlap, so an
/// event spanning several filter periods yields several fragments. With no
/// filter events the input is returned unchanged.
pub fn filter_period_intersect(events: &[Event], filter: &[Event]) -> Vec<Event> {
    if filter.is_empty() {
        return events.to_vec();
    }

    let left = spans(events);
    let right = spans(filter);

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        let (e1, s1, end1) = left[i];
        let (_, s2, end2) = right[j];

        let start = s1.max(s2);
        let end = end1.min(end2);

        if start < end {
            if let Some(timestamp) = DateTime::from_timestamp_micros(start) {
                let mut clipped = e1.clone();
                clipped.timestamp = timestamp;
                clipped.duration = end.saturating_sub(start) as f64 / 1_000_000.0;
                out.push(clipped);
            }
            if end1 <= end2 {
                i += 1;
            } else {
                j += 1;
            }
        } else if end1 <= s2 {
            i += 1;
        } else if end2 <= s1 {
            j += 1;
        } else {
            // A zero-length interval inside the other one
            i += 1;
            j += 1;
        }
    }
    out
}

/// `(event, start_us, end_us)` sorted by start; the sort is stable.
/// Ends saturate at `i64::MAX`.
fn spans(events: &[Event]) -> Vec<(&Event, i64, i64)> {
    let mut spans: Vec<_> = events
        .iter()
        .map(|e| {
            let start = e.timestamp.timestamp_micros();
            (e, start, start.saturating_add(seconds_to_micros(e.duration)))
        })
        .collect();
    spans.sort_by_key(|&(_, start, _)| start);
    spans
}

/// Group events by the values of `keys` and sum durations per group.
///
/// The composite key only contains the keys an event actually has, and
/// numbers compare by value so `1` and `1.0` share a group. Groups
/// appear in first-seen order and keep the timestamp of their first event;
/// their data holds the requested keys, later events overwriting earlier ones.
pub fn merge_events_by_keys(events: &[Event], keys: &[String]) -> Vec<Event> {
    let mut index: FxHashMap<Vec<String>, usize> = FxHashMap::default();
    let mut merged: Vec<Event> = Vec::new();

    for event in events {
        let composite: Vec<String> = keys
            .iter()
            .filter_map(|k| event.data.get(k))
            .map(group_key)
            .collect();

        let slot = match index.get(&composite) {
            Some(&slot) => {
                merged[slot].duration += event.duration;
                slot
            }
            None => {
                merged.push(Event::new(event.timestamp, event.duration, EventData::new()));
                index.insert(composite, merged.len() - 1);
                merged.len() - 1
            }
        };

        for key in keys {
            if let Some(value) = event.data.get(key) {
                merged[slot].data.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn group_key(value: &serde_json::Value) -> String {
    match value.as_f64() {
        Some(n) => format!("#{}", n),
        None => value.to_string(),
    }
}

/// Longest first; equal durations keep their input order
pub fn sort_by_duration(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by(|a, b| b.duration.total_cmp(&a.duration));
    events
}

pub fn sort_by_timestamp(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by_key(|e| e.timestamp);
    events
}

pub fn sum_durations(events: &[Event]) -> f64 {
    events.iter().map(|e| e.duration).sum()
}

pub fn limit_events(mut events: Vec<Event>, count: usize) -> Vec<Event> {
    events.truncate(count);
    events
}

/// `a` followed by `b`. Also backs `union_no_overlap` and `period_union`.
pub fn concat(mut a: Vec<Event>, b: Vec<Event>) -> Vec<Event> {
    a.extend(b);
    a
}

pub const UNCATEGORIZED: &str = "Uncategorized";

/// Tag every event with the `Uncategorized` category.
///
/// Category rules are not matched; every event gets the same tag.
pub fn categorize(events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .map(|mut e| {
            e.data.insert(
                "$category".to_string(),
                serde_json::json!([UNCATEGORIZED]),
            );
            e
        })
        .collect()
}

/// Gap filling is not performed; events pass through unchanged.
pub fn flood(events: Vec<Event>) -> Vec<Event> {
    events
}

/// First bucket id containing `pattern`, optionally restricted to a hostname
pub fn find_bucket<'a>(
    buckets: &'a [Bucket],
    pattern: &str,
    hostname: Option<&str>,
) -> Option<&'a str> {
    buckets
        .iter()
        .filter(|b| hostname.map_or(true, |h| b.hostname == h))
        .find(|b| b.id.contains(pattern))
        .map(|b| b.id.as_str())
}
