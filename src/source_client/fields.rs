//! Lenient accessors over a single JSON entry.
//!
//! Upstream servers disagree on whether numbers arrive as JSON numbers or as
//! strings, so every numeric accessor accepts both.

use chrono::NaiveTime;
use serde_json::{Map, Value};

pub type Entry = Map<String, Value>;

pub fn required_int(entry: &Entry, key: &str) -> Result<i64, String> {
    optional_int(entry, key)?.ok_or_else(|| format!("missing required field '{}'", key))
}

pub fn optional_int(entry: &Entry, key: &str) -> Result<Option<i64>, String> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("field '{}' is not an integer: {}", key, n)),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("field '{}' is not an integer: '{}'", key, s)),
        Some(other) => Err(format!("field '{}' has unexpected type: {}", key, other)),
    }
}

pub fn required_str(entry: &Entry, key: &str) -> Result<String, String> {
    optional_str(entry, key).ok_or_else(|| format!("missing required field '{}'", key))
}

/// Non-empty, trimmed string value. Numbers are rendered as strings.
pub fn optional_str(entry: &Entry, key: &str) -> Option<String> {
    let value = match entry.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

pub fn required_decimal(entry: &Entry, key: &str) -> Result<f64, String> {
    let value = match entry.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        None | Some(Value::Null) => return Err(format!("missing required field '{}'", key)),
        _ => None,
    };
    value
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("field '{}' is not a decimal number", key))
}

/// `"1"`, `1`, `true` are truthy; anything else present is falsy.
pub fn flag(entry: &Entry, key: &str) -> Option<bool> {
    match entry.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_i64() == Some(1)),
        Value::String(s) => Some(matches!(s.trim(), "1" | "true" | "TRUE" | "True")),
        _ => None,
    }
}

/// Parses "HH:MM", "HH:MM:SS", or a bare number of minutes after midnight.
pub fn parse_clock_time(value: &str) -> Result<NaiveTime, String> {
    let value = value.trim();
    if !value.contains(':') {
        let minutes: u32 = value
            .parse()
            .map_err(|_| format!("invalid time '{}'", value))?;
        // BMLT uses 24:00 for meetings that run until midnight.
        let minutes = minutes.min(24 * 60 - 1);
        return NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)
            .ok_or_else(|| format!("invalid time '{}'", value));
    }

    let parts = split_clock(value)?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m] => (*h, *m, 0),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(format!("invalid time '{}'", value)),
    };
    if hours == 24 && minutes == 0 && seconds == 0 {
        return NaiveTime::from_hms_opt(23, 59, 0).ok_or_else(|| "invalid time".to_string());
    }
    NaiveTime::from_hms_opt(hours, minutes, seconds)
        .ok_or_else(|| format!("invalid time '{}'", value))
}

/// Longest duration accepted for a single meeting.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// Parses "HH:MM", "HH:MM:SS", or a bare number of minutes into whole minutes.
/// Durations of more than a day are rejected.
pub fn parse_duration_minutes(value: &str) -> Result<u32, String> {
    let value = value.trim();
    let minutes = if !value.contains(':') {
        value
            .parse::<u32>()
            .map_err(|_| format!("invalid duration '{}'", value))?
    } else {
        let parts = split_clock(value)?;
        match parts.as_slice() {
            [h, m] | [h, m, _] if *m < 60 => h
                .checked_mul(60)
                .and_then(|x| x.checked_add(*m))
                .ok_or_else(|| format!("invalid duration '{}'", value))?,
            _ => return Err(format!("invalid duration '{}'", value)),
        }
    };
    if minutes > MAX_DURATION_MINUTES {
        return Err(format!("duration '{}' exceeds one day", value));
    }
    Ok(minutes)
}

fn split_clock(value: &str) -> Result<Vec<u32>, String> {
    value
        .split(':')
        .map(|p| {
            p.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid time component in '{}'", value))
        })
        .collect()
}

/// Splits a comma separated list, trimming blanks.
pub fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: Value) -> Entry {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn ints_accept_numbers_and_strings() {
        let e = entry(json!({"a": 12, "b": "34", "c": " ", "d": "x", "e": 1.5}));
        assert_eq!(required_int(&e, "a"), Ok(12));
        assert_eq!(required_int(&e, "b"), Ok(34));
        assert_eq!(optional_int(&e, "c"), Ok(None));
        assert!(optional_int(&e, "d").is_err());
        assert!(optional_int(&e, "e").is_err());
        assert!(required_int(&e, "missing").is_err());
    }

    #[test]
    fn strings_are_trimmed_and_blank_is_none() {
        let e = entry(json!({"a": "  hi ", "b": "", "c": 7}));
        assert_eq!(optional_str(&e, "a").as_deref(), Some("hi"));
        assert_eq!(optional_str(&e, "b"), None);
        assert_eq!(optional_str(&e, "c").as_deref(), Some("7"));
    }

    #[test]
    fn clock_times() {
        assert_eq!(
            parse_clock_time("19:30"),
            Ok(NaiveTime::from_hms_opt(19, 30, 0).unwrap())
        );
        assert_eq!(
            parse_clock_time("07:05:10"),
            Ok(NaiveTime::from_hms_opt(7, 5, 10).unwrap())
        );
        assert_eq!(
            parse_clock_time("90"),
            Ok(NaiveTime::from_hms_opt(1, 30, 0).unwrap())
        );
        assert_eq!(
            parse_clock_time("24:00:00"),
            Ok(NaiveTime::from_hms_opt(23, 59, 0).unwrap())
        );
        assert!(parse_clock_time("25:00").is_err());
        assert!(parse_clock_time("noon").is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_minutes("01:30:00"), Ok(90));
        assert_eq!(parse_duration_minutes("1:00"), Ok(60));
        assert_eq!(parse_duration_minutes("45"), Ok(45));
        assert!(parse_duration_minutes("1:75").is_err());
        assert_eq!(parse_duration_minutes("24:00"), Ok(24 * 60));
    }

    #[test]
    fn oversized_durations_are_errors() {
        assert!(parse_duration_minutes("99999999:00").is_err());
        assert!(parse_duration_minutes("4294967295:59").is_err());
        assert!(parse_duration_minutes("25:00").is_err());
        assert!(parse_duration_minutes("1441").is_err());
        assert!(parse_duration_minutes("99999999999").is_err());
    }

    #[test]
    fn flags() {
        let e = entry(json!({"a": "1", "b": "0", "c": true, "d": 1}));
        assert_eq!(flag(&e, "a"), Some(true));
        assert_eq!(flag(&e, "b"), Some(false));
        assert_eq!(flag(&e, "c"), Some(true));
        assert_eq!(flag(&e, "d"), Some(true));
        assert_eq!(flag(&e, "z"), None);
    }

    #[test]
    fn comma_lists_skip_blanks() {
        assert_eq!(comma_list("O, D,,BT "), vec!["O", "D", "BT"]);
        assert!(comma_list("").is_empty());
    }
}
