//! Best-effort timestamp parsing for the `timestamp` field.
//!
//! Extracted timestamps come in whatever shape the log format uses, so a list
//! of common layouts is tried in turn. Values without an offset are read in the
//! local time zone. Anything unrecognised returns `None`.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};

const OFFSET_FORMATS: &[&str] = &[
    "%d/%b/%Y:%H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%a %b %e %H:%M:%S %z %Y",
    "%a, %d %b %Y %H:%M:%S %z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%b/%Y:%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m-%d-%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%a %b %e %H:%M:%S %Y",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

const UTC_SUFFIXES: &[&str] = &[" UTC", " GMT", "Z"];

/// Unix seconds for `raw`, if it looks like a timestamp.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(ts) = parse_epoch(value) {
        return Some(ts);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.timestamp());
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.timestamp());
        }
    }
    for suffix in UTC_SUFFIXES {
        if let Some(rest) = value.strip_suffix(suffix) {
            if let Some(naive) = parse_naive(rest.trim_end()) {
                return Some(Utc.from_utc_datetime(&naive).timestamp());
            }
        }
    }
    if let Some(naive) = parse_naive(value) {
        return local_seconds(&naive);
    }
    parse_syslog(value)
}

fn parse_epoch(value: &str) -> Option<i64> {
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: i64 = value.parse().ok()?;
    match value.len() {
        9 | 10 => Some(number),
        13 => Some(number / 1_000),
        _ => None,
    }
}

fn parse_naive(value: &str) -> Option<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

// Syslog stamps carry no year; assume the current one.
fn parse_syslog(value: &str) -> Option<i64> {
    let with_year = format!("{} {}", Local::now().year(), value);
    let naive = NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S").ok()?;
    local_seconds(&naive)
}

fn local_seconds(naive: &NaiveDateTime) -> Option<i64> {
    Local
        .from_local_datetime(naive)
        .earliest()
        .map(|dt| dt.timestamp())
}
