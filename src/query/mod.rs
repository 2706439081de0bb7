//! Query language over stored events
//!
//! A query is a list of statement lines such as
//!
//! ```text
//! events = query_bucket(find_bucket("aw-watcher-window_"));
//! not_afk = filter_keyvals(query_bucket(find_bucket("aw-watcher-afk_")), "status", ["not-afk"]);
//! events = filter_period_intersect(events, not_afk);
//! RETURN = sort_by_duration(merge_events_by_keys(events, ["app"]));
//! ```
//!
//! evaluated once per requested time period.

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod period;

use rayon::prelude::*;

pub use evaluator::{evaluate, EvalError};
pub use parser::{parse_program, Expr, Function, ParseError, Program, Statement};
pub use period::{parse_period, TimePeriod};

use crate::data::Value;
use crate::storage::{EventStore, StoreError};

/// Parse the query and evaluate it for every period, in parallel.
///
/// Results come back in the order of `timeperiods`. Content errors never fail
/// the call: they degrade to an empty result for the affected statement or
/// period. Only a store outage is returned as an error.
pub fn run_query<S: EventStore + ?Sized>(
    store: &S,
    timeperiods: &[String],
    query: &[String],
) -> Result<Vec<Value>, QueryError> {
    let program = parse_program(&query.join("\n"));
    if program.has_errors() {
        tracing::warn!("Query contains statements that failed to parse");
    }

    let results = timeperiods
        .par_iter()
        .map(|text| {
            let period = parse_period(text);
            tracing::debug!("Evaluating query for {} .. {}", period.start, period.end);
            evaluate(store, &program, period)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(results)
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
