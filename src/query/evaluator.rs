use std::collections::BTreeMap;

use fxhash::FxHashMap;
use thiserror::Error;

use super::functions;
use super::parser::{Expr, Function, Program, Statement};
use super::period::TimePeriod;
use crate::data::{Event, Value};
use crate::storage::{EventStore, StoreError};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("{function}: argument {position} must be {expected}, got {found}")]
    TypeMismatch {
        function: Function,
        position: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{function}: missing argument {position}")]
    MissingArgument { function: Function, position: usize },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Evaluate `program` over one time period.
///
/// Statements run in order against a fresh variable scope. A statement that
/// failed to parse or to evaluate binds its target to an empty sequence and
/// evaluation continues. The result is the value of the last `RETURN`, or an
/// empty sequence when there is none. Only store unavailability is returned
/// as an error.
pub fn evaluate<S: EventStore + ?Sized>(
    store: &S,
    program: &Program,
    period: TimePeriod,
) -> Result<Value, StoreError> {
    let mut evaluator = Evaluator {
        store,
        period,
        variables: FxHashMap::default(),
    };
    let mut result = None;

    for statement in &program.statements {
        match statement {
            Statement::Assign { target, expr } => {
                let value = evaluator.contain(target, expr)?;
                evaluator.variables.insert(target.clone(), value);
            }
            Statement::Return(expr) => {
                result = Some(evaluator.contain("RETURN", expr)?);
            }
            Statement::Invalid { target, error } => {
                tracing::warn!("Skipping invalid query statement: {}", error);
                match target.as_deref() {
                    Some("RETURN") => result = Some(Value::empty()),
                    Some(name) => {
                        evaluator.variables.insert(name.to_string(), Value::empty());
                    }
                    None => {}
                }
            }
        }
    }

    Ok(result.unwrap_or_default())
}

struct Evaluator<'a, S: EventStore + ?Sized> {
    store: &'a S,
    period: TimePeriod,
    variables: FxHashMap<String, Value>,
}

impl<'a, S: EventStore + ?Sized> Evaluator<'a, S> {
    /// Evaluate one statement's expression, turning recoverable errors into
    /// an empty sequence
    fn contain(&self, target: &str, expr: &Expr) -> Result<Value, StoreError> {
        match self.eval(expr) {
            Ok(value) => {
                tracing::debug!("{} = <{}>", target, value.type_name());
                Ok(value)
            }
            Err(EvalError::Store(e @ StoreError::Unavailable(_))) => Err(e),
            Err(e) => {
                tracing::warn!("Query statement '{}' failed: {}", target, e);
                Ok(Value::empty())
            }
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        Ok(match expr {
            Expr::Null => Value::Null,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Number(n) => Value::Number(*n),
            Expr::String(s) => Value::String(s.clone()),
            Expr::List(items) if items.is_empty() => Value::empty(),
            Expr::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Object(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Value::Object(map)
            }
            Expr::Variable(name) => match self.variables.get(name) {
                Some(value) => value.clone(),
                None => {
                    tracing::debug!("Unknown query variable '{}'", name);
                    Value::empty()
                }
            },
            Expr::Call { function, args } => self.call(*function, args)?,
        })
    }

    fn arg(&self, function: Function, args: &[Expr], position: usize) -> Result<Value, EvalError> {
        let expr = args
            .get(position)
            .ok_or(EvalError::MissingArgument { function, position })?;
        self.eval(expr)
    }

    fn events(
        &self,
        function: Function,
        args: &[Expr],
        position: usize,
    ) -> Result<Vec<Event>, EvalError> {
        match self.arg(function, args, position)? {
            Value::Events(events) => Ok(events),
            other => Err(mismatch(function, position, "events", &other)),
        }
    }

    fn string(&self, function: Function, args: &[Expr], position: usize) -> Result<String, EvalError> {
        match self.arg(function, args, position)? {
            Value::String(s) => Ok(s),
            other => Err(mismatch(function, position, "a string", &other)),
        }
    }

    fn list(&self, function: Function, args: &[Expr], position: usize) -> Result<Vec<Value>, EvalError> {
        let value = self.arg(function, args, position)?;
        match value.as_list() {
            Some(items) => Ok(items.to_vec()),
            None => Err(mismatch(function, position, "a list", &value)),
        }
    }

    fn call(&self, function: Function, args: &[Expr]) -> Result<Value, EvalError> {
        let value = match function {
            Function::QueryBucket => match self.arg(function, args, 0)? {
                Value::Null => Value::empty(),
                Value::String(bucket_id) => {
                    match self.store.range(&bucket_id, self.period.start, self.period.end) {
                        Ok(events) => Value::Events(events),
                        Err(StoreError::BucketNotFound(_)) => {
                            tracing::debug!("query_bucket: no bucket '{}'", bucket_id);
                            Value::empty()
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                other => return Err(mismatch(function, 0, "a bucket id", &other)),
            },

            Function::FindBucket => {
                let pattern = self.string(function, args, 0)?;
                let hostname = match args.get(1).map(|e| self.eval(e)).transpose()? {
                    None | Some(Value::Null) => None,
                    Some(Value::String(h)) => Some(h),
                    Some(other) => return Err(mismatch(function, 1, "a hostname", &other)),
                };
                let buckets = self.store.list_buckets()?;
                match functions::find_bucket(&buckets, &pattern, hostname.as_deref()) {
                    Some(id) => Value::String(id.to_string()),
                    None => Value::Null,
                }
            }

            Function::FilterKeyvals => {
                let events = self.events(function, args, 0)?;
                let key = self.string(function, args, 1)?;
                let values: Vec<serde_json::Value> =
                    self.list(function, args, 2)?.iter().map(Value::to_json).collect();
                Value::Events(functions::filter_keyvals(&events, &key, &values))
            }

            Function::FilterPeriodIntersect => {
                let events = self.events(function, args, 0)?;
                let filter = self.events(function, args, 1)?;
                Value::Events(functions::filter_period_intersect(&events, &filter))
            }

            Function::MergeEventsByKeys => {
                let events = self.events(function, args, 0)?;
                let keys = self
                    .list(function, args, 1)?
                    .into_iter()
                    .map(|key| match key {
                        Value::String(s) => Ok(s),
                        other => Err(mismatch(function, 1, "a list of strings", &other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Events(functions::merge_events_by_keys(&events, &keys))
            }

            Function::SortByDuration => {
                Value::Events(functions::sort_by_duration(self.events(function, args, 0)?))
            }
            Function::SortByTimestamp => {
                Value::Events(functions::sort_by_timestamp(self.events(function, args, 0)?))
            }

            Function::SumDurations => {
                Value::Number(functions::sum_durations(&self.events(function, args, 0)?))
            }

            Function::LimitEvents => {
                let events = self.events(function, args, 0)?;
                let count = match self.arg(function, args, 1)? {
                    Value::Number(n) if n.is_finite() => n.max(0.0) as usize,
                    other => return Err(mismatch(function, 1, "a number", &other)),
                };
                Value::Events(functions::limit_events(events, count))
            }

            Function::Concat | Function::UnionNoOverlap | Function::PeriodUnion => {
                let a = self.events(function, args, 0)?;
                let b = self.events(function, args, 1)?;
                Value::Events(functions::concat(a, b))
            }

            // Rules are accepted but never evaluated
            Function::Categorize => {
                Value::Events(functions::categorize(self.events(function, args, 0)?))
            }

            Function::Flood => Value::Events(functions::flood(self.events(function, args, 0)?)),

            Function::Nop => Value::Events(self.events(function, args, 0)?),
        };
        Ok(value)
    }
}

fn mismatch(function: Function, position: usize, expected: &'static str, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        function,
        position,
        expected,
        found: found.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BucketConfig, EventData};
    use crate::query::parser::parse_program;
    use crate::storage::StorageEngine;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn data(value: serde_json::Value) -> EventData {
        match value {
            serde_json::Value::Object(map) => map,
            _ => EventData::new(),
        }
    }

    fn day() -> TimePeriod {
        TimePeriod {
            start: at(0, 0),
            end: at(23, 59),
        }
    }

    fn store() -> StorageEngine {
        let engine = StorageEngine::with_hostname("laptop");
        engine.create_or_update_bucket("aw-watcher-window_laptop", BucketConfig::default());
        engine.upsert_events(
            "aw-watcher-window_laptop",
            vec![
                Event::new(at(10, 0), 60.0, data(json!({"app": "A", "title": "one"}))),
                Event::new(at(10, 5), 120.0, data(json!({"app": "B", "title": "two"}))),
                Event::new(at(10, 10), 30.0, data(json!({"app": "A", "title": "three"}))),
            ],
        );
        engine.create_or_update_bucket("aw-watcher-afk_laptop", BucketConfig::default());
        engine.upsert_events(
            "aw-watcher-afk_laptop",
            vec![
                Event::new(at(10, 0), 480.0, data(json!({"status": "not-afk"}))),
                Event::new(at(10, 8), 600.0, data(json!({"status": "afk"}))),
            ],
        );
        engine
    }

    fn run(source: &str) -> Value {
        evaluate(&store(), &parse_program(source), day()).unwrap()
    }

    #[test]
    fn test_query_bucket_and_return() {
        let value = run("events = query_bucket(\"aw-watcher-window_laptop\");\nRETURN = events;");
        assert_eq!(value.as_events().map(|e| e.len()), Some(3));
    }

    #[test]
    fn test_query_bucket_respects_period() {
        let program = parse_program("RETURN = query_bucket(\"aw-watcher-window_laptop\");");
        let period = TimePeriod {
            start: at(10, 5),
            end: at(10, 10),
        };
        let value = evaluate(&store(), &program, period).unwrap();
        // Both bounds are inclusive
        assert_eq!(value.as_events().map(|e| e.len()), Some(2));
    }

    #[test]
    fn test_missing_bucket_and_null_bucket() {
        assert_eq!(run("RETURN = query_bucket(\"nope\");"), Value::empty());
        assert_eq!(
            run("b = find_bucket(\"aw-watcher-input\");\nRETURN = query_bucket(b);"),
            Value::empty()
        );
    }

    #[test]
    fn test_find_bucket() {
        assert_eq!(
            run("RETURN = find_bucket(\"aw-watcher-afk\");"),
            Value::String("aw-watcher-afk_laptop".into())
        );
        assert_eq!(
            run("RETURN = find_bucket(\"aw-watcher-afk\", \"desktop\");"),
            Value::Null
        );
    }

    #[test]
    fn test_afk_filtered_summary() {
        let value = run(r#"
            window = query_bucket(find_bucket("aw-watcher-window"));
            afk = query_bucket(find_bucket("aw-watcher-afk"));
            not_afk = filter_keyvals(afk, "status", ["not-afk"]);
            events = filter_period_intersect(window, not_afk);
            apps = sort_by_duration(merge_events_by_keys(events, ["app"]));
            RETURN = {"apps": apps, "duration": sum_durations(events)};
        "#);

        let Value::Object(result) = value else {
            panic!("expected object, got {:?}", value);
        };
        assert_eq!(result["duration"], Value::Number(180.0));
        let apps = result["apps"].as_events().unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].data["app"], json!("B"));
        assert_eq!(apps[0].duration, 120.0);
        assert_eq!(apps[1].data["app"], json!("A"));
        assert_eq!(apps[1].duration, 60.0);
    }

    #[test]
    fn test_unknown_operator_binds_empty_and_continues() {
        let value = run(r#"
            y = query_bucket("aw-watcher-window_laptop");
            x = unknown_fn(y);
            z = concat(x, y);
            RETURN = {"x": x, "z": sum_durations(z)};
        "#);
        let Value::Object(result) = value else {
            panic!("expected object");
        };
        assert_eq!(result["x"], Value::empty());
        assert_eq!(result["z"], Value::Number(210.0));
    }

    #[test]
    fn test_type_mismatch_is_contained() {
        let value = run("x = sum_durations(\"text\");\nRETURN = x;");
        assert_eq!(value, Value::empty());

        let value = run("x = limit_events(query_bucket(\"aw-watcher-window_laptop\"), \"2\");\ny = nop(x);\nRETURN = y;");
        assert_eq!(value, Value::empty());
    }

    #[test]
    fn test_missing_variable_is_empty() {
        assert_eq!(run("RETURN = nop(never_assigned);"), Value::empty());
    }

    #[test]
    fn test_no_return_yields_empty_sequence() {
        assert_eq!(run("x = query_bucket(\"aw-watcher-window_laptop\");"), Value::empty());
        assert_eq!(run(""), Value::empty());
    }

    #[test]
    fn test_last_return_wins() {
        assert_eq!(run("RETURN = 1;\nRETURN = 2;"), Value::Number(2.0));
    }

    #[test]
    fn test_invalid_return_resets_result() {
        assert_eq!(run("RETURN = 1;\nRETURN = bogus(1);"), Value::empty());
    }

    #[test]
    fn test_limit_sort_and_categorize() {
        let value = run(r#"
            events = query_bucket("aw-watcher-window_laptop");
            events = limit_events(sort_by_timestamp(sort_by_duration(events)), 2);
            RETURN = categorize(events, [["Work"], {"type": "regex", "regex": "A"}]);
        "#);
        let events = value.as_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, at(10, 0));
        assert_eq!(events[0].data["$category"], json!(["Uncategorized"]));
    }

    #[test]
    fn test_filter_keyvals_with_empty_list() {
        let value = run("RETURN = filter_keyvals(query_bucket(\"aw-watcher-afk_laptop\"), \"status\", []);");
        assert_eq!(value, Value::empty());
    }

    struct DownStore;

    impl EventStore for DownStore {
        fn ensure_bucket(&self, _: &str, _: BucketConfig) -> Result<crate::data::Bucket, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn list_buckets(&self) -> Result<Vec<crate::data::Bucket>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn last_event(&self, _: &str) -> Result<Option<Event>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn event_at(&self, _: &str, _: DateTime<Utc>) -> Result<Option<Event>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn insert_if_absent(&self, _: &str, _: Event) -> Result<Event, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn extend_duration(&self, _: &str, _: DateTime<Utc>, _: f64) -> Result<Event, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn replace_data(&self, _: &str, _: DateTime<Utc>, _: EventData) -> Result<Event, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn range(&self, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_store_unavailable_is_fatal() {
        let program = parse_program("x = query_bucket(\"w\");\nRETURN = x;");
        let err = evaluate(&DownStore, &program, day()).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
