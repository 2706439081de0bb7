use serde::Serialize;
use std::collections::BTreeMap;

use super::event::Event;

/// A value produced by the query language.
///
/// Top-level results are normally `Events`, `Number` or `Object`; the other
/// variants exist for literals and intermediate results (`find_bucket`
/// returns a `String` or `Null`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Events(Vec<Event>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn empty() -> Self {
        Value::Events(Vec::new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Events(_) => "events",
            Value::Object(_) => "object",
        }
    }

    pub fn as_events(&self) -> Option<&[Event]> {
        match self {
            Value::Events(events) => Some(events),
            _ => None,
        }
    }

    /// Elements of a list literal. The empty sequence `[]` counts as an empty list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            Value::Events(events) if events.is_empty() => Some(&[]),
            _ => None,
        }
    }

    /// Convert a scalar literal into the JSON value it would match in event data.
    ///
    /// Whole numbers become JSON integers so `1` matches a stored `1`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    serde_json::json!(*n as i64)
                } else {
                    serde_json::json!(*n)
                }
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Events(events) => serde_json::to_value(events).unwrap_or_default(),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::empty()
    }
}

impl From<Vec<Event>> for Value {
    fn from(events: Vec<Event>) -> Self {
        Value::Events(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_is_empty_sequence() {
        assert_eq!(Value::default(), Value::Events(vec![]));
        assert_eq!(serde_json::to_value(Value::default()).unwrap(), json!([]));
    }

    #[test]
    fn test_nested_serialization() {
        let mut inner = BTreeMap::new();
        inner.insert("total".to_string(), Value::Number(180.0));
        let mut outer = BTreeMap::new();
        outer.insert("window".to_string(), Value::Object(inner));
        outer.insert("events".to_string(), Value::empty());

        let wire = serde_json::to_value(Value::Object(outer)).unwrap();
        assert_eq!(wire, json!({"window": {"total": 180.0}, "events": []}));
    }

    #[test]
    fn test_literal_to_json() {
        assert_eq!(Value::Number(3.0).to_json(), json!(3));
        assert_eq!(Value::Number(2.5).to_json(), json!(2.5));
        assert_eq!(Value::String("afk".into()).to_json(), json!("afk"));
        assert_eq!(Value::Bool(true).to_json(), json!(true));
    }

    #[test]
    fn test_empty_sequence_is_empty_list() {
        assert_eq!(Value::empty().as_list().map(|l| l.len()), Some(0));
        assert!(Value::Number(1.0).as_list().is_none());
    }
}
