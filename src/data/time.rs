use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

/// Parse an ISO-8601 instant into UTC.
///
/// Accepts RFC 3339 (`2024-01-01T10:00:00Z`, `...+02:00`), naive date-times
/// which are taken as UTC (`2024-01-01T10:00:00`, `2024-01-01 10:00:00.123`)
/// and bare dates (`2024-01-01`, midnight UTC). Returns `None` for anything else.
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse an instant, falling back to the current time when malformed or absent.
pub fn parse_instant_or_now(s: Option<&str>) -> DateTime<Utc> {
    s.and_then(parse_instant).unwrap_or_else(Utc::now)
}

/// Signed number of seconds from `from` to `to`, at microsecond precision.
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}

/// `ts + seconds`, rounded to the nearest microsecond. Saturates at the
/// bounds of the representable range.
pub fn add_seconds(ts: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    let micros = seconds_to_micros(seconds);
    ts.checked_add_signed(Duration::microseconds(micros))
        .unwrap_or(if micros < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// Seconds as whole microseconds. Out-of-range values saturate at the `i64`
/// bounds and NaN becomes 0.
pub fn seconds_to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}
