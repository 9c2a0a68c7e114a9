//! Human-readable durations
//!
//! Load scripts express stage lengths and timeouts as strings such as
//! `10s`, `1m30s` or `250ms`. A bare number is read as seconds.
//! Values are converted through whole nanoseconds, so anything
//! [`format_duration`] writes parses back to the same duration.

use std::time::Duration;

use thiserror::Error;

/// Duration parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration '{input}': expected a number before '{rest}'")]
    MissingNumber { input: String, rest: String },

    #[error("invalid duration '{input}': unknown unit '{unit}' (use ns, us, ms, s, m or h)")]
    UnknownUnit { input: String, unit: String },

    #[error("invalid duration '{input}': value out of range")]
    OutOfRange { input: String },
}

/// Parse a duration like `1h2m3s500ms`, `1.5s` or `30`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }

    // Bare number means seconds
    if let Ok(secs) = trimmed.parse::<f64>() {
        return scaled(input, secs, NANOS_PER_SEC);
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(DurationError::MissingNumber {
                input: input.to_string(),
                rest: rest.to_string(),
            });
        }
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number.parse().map_err(|_| DurationError::MissingNumber {
            input: input.to_string(),
            rest: rest.to_string(),
        })?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let unit_nanos = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => NANOS_PER_SEC,
            "m" => 60.0 * NANOS_PER_SEC,
            "h" => 3600.0 * NANOS_PER_SEC,
            _ => {
                return Err(DurationError::UnknownUnit {
                    input: input.to_string(),
                    unit: unit.to_string(),
                })
            }
        };

        total = total
            .checked_add(scaled(input, value, unit_nanos)?)
            .ok_or_else(|| out_of_range(input))?;
        rest = next;
    }

    Ok(total)
}

const NANOS_PER_SEC: f64 = 1e9;

/// `value` units of `unit_nanos` each, rounded to the nearest nanosecond
fn scaled(input: &str, value: f64, unit_nanos: f64) -> Result<Duration, DurationError> {
    let nanos = (value * unit_nanos).round();
    // Largest whole-second count a Duration holds is u64::MAX
    if !nanos.is_finite() || nanos < 0.0 || nanos >= u64::MAX as f64 * NANOS_PER_SEC {
        return Err(out_of_range(input));
    }
    let nanos = nanos as u128;
    Ok(Duration::new(
        (nanos / 1_000_000_000) as u64,
        (nanos % 1_000_000_000) as u32,
    ))
}

fn out_of_range(input: &str) -> DurationError {
    DurationError::OutOfRange {
        input: input.to_string(),
    }
}

/// Render a duration compactly (`1m30s`, `250ms`, `500us`, `0s`).
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }

    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let sub_nanos = duration.subsec_nanos();
    let millis = sub_nanos / 1_000_000;
    let micros = (sub_nanos / 1000) % 1000;
    let nanos = sub_nanos % 1000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    if millis > 0 {
        out.push_str(&format!("{}ms", millis));
    }
    if micros > 0 {
        out.push_str(&format!("{}us", micros));
    }
    if nanos > 0 {
        out.push_str(&format!("{}ns", nanos));
    }
    out
}

/// [`format_duration`] truncated to whole milliseconds, for measured times
pub fn format_elapsed(elapsed: Duration) -> String {
    format_duration(Duration::from_millis(elapsed.as_millis() as u64))
}

/// Serde adapter for durations written as human-readable strings.
///
/// Numbers are accepted too and read as seconds.
pub mod serde_duration {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
            Raw::Secs(secs) => Duration::try_from_secs_f64(secs).map_err(de::Error::custom),
        }
    }
}

/// Same as [`serde_duration`] for optional fields.
pub mod option_serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serde_duration::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::serde_duration")] Duration);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_compound_and_fractional() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_duration("1h2m3s500ms").unwrap(),
            Duration::from_millis(3_723_500)
        );
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_bare_number_is_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration(" 0 ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert!(matches!(
            parse_duration("10d"),
            Err(DurationError::UnknownUnit { unit, .. }) if unit == "d"
        ));
        assert!(matches!(
            parse_duration("s"),
            Err(DurationError::MissingNumber { .. })
        ));
        assert!(matches!(
            parse_duration("-5s"),
            Err(DurationError::MissingNumber { .. })
        ));
        assert!(matches!(
            parse_duration("-5"),
            Err(DurationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_oversized_durations_are_out_of_range() {
        assert!(matches!(
            parse_duration("10000000000000000000s10000000000000000000s"),
            Err(DurationError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse_duration("1e300"),
            Err(DurationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_sub_millisecond_values_survive_formatting() {
        assert_eq!(parse_duration("0.5ms").unwrap(), Duration::from_micros(500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));

        for duration in [
            Duration::from_micros(500),
            Duration::from_nanos(1_500_250_007),
            Duration::new(3723, 999_999_999),
        ] {
            let text = format_duration(duration);
            assert_eq!(parse_duration(&text).unwrap(), duration, "{}", text);
        }
        assert_eq!(format_duration(Duration::from_micros(500)), "500us");
        assert_eq!(format_elapsed(Duration::from_nanos(2_003_412_118)), "2s3ms");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(3_723_500)), "1h2m3s500ms");
    }

    #[test]
    fn test_serde_adapter_accepts_strings_and_numbers() {
        #[derive(serde::Deserialize)]
        struct Holder {
            #[serde(with = "serde_duration")]
            d: Duration,
        }

        let h: Holder = serde_json::from_str(r#"{"d":"1m"}"#).unwrap();
        assert_eq!(h.d, Duration::from_secs(60));

        let h: Holder = serde_json::from_str(r#"{"d":2.5}"#).unwrap();
        assert_eq!(h.d, Duration::from_millis(2500));

        assert!(serde_json::from_str::<Holder>(r#"{"d":"soon"}"#).is_err());
    }
}
