use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::data::parse_instant;

/// Time range a query is evaluated over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Parse `"<start>/<end>"` or a lone `"<start>"`.
///
/// Never fails: an unparseable start becomes 24 hours before now, and a
/// missing or unparseable end becomes now.
pub fn parse_period(text: &str) -> TimePeriod {
    parse_period_at(text, Utc::now())
}

pub fn parse_period_at(text: &str, now: DateTime<Utc>) -> TimePeriod {
    let (start_text, end_text) = match text.split_once('/') {
        Some((start, end)) => (start, Some(end)),
        None => (text, None),
    };

    let start = parse_instant(start_text).unwrap_or_else(|| {
        tracing::debug!("Unparseable period start '{}', using now - 24h", start_text);
        now - Duration::days(1)
    });
    let end = end_text.and_then(parse_instant).unwrap_or(now);

    TimePeriod { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_full_interval() {
        let period = parse_period_at("2024-03-01T00:00:00Z/2024-03-02T00:00:00Z", now());
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_offsets_are_normalised_to_utc() {
        let period = parse_period_at("2024-03-01T02:00:00+02:00/2024-03-01T03:00:00+02:00", now());
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap());
    }

    #[test]
    fn test_single_instant_ends_now() {
        let period = parse_period_at("2024-03-01T08:00:00Z", now());
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap());
        assert_eq!(period.end, now());
    }

    #[test]
    fn test_malformed_parts_fall_back() {
        let period = parse_period_at("garbage/also garbage", now());
        assert_eq!(period.start, now() - Duration::days(1));
        assert_eq!(period.end, now());

        let period = parse_period_at("", now());
        assert_eq!(period.start, now() - Duration::days(1));
        assert_eq!(period.end, now());
    }
}
