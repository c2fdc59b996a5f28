//! Timestamp and duration formatting shared by the ledger, registry and logs.
//!
//! Ledger timestamps are UTC RFC 3339 with nanosecond precision and trailing
//! fractional zeros trimmed (`2024-05-01T10:00:00.5Z`). Durations use the
//! compact `1h2m3s` form that also appears in orchestration log lines.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Format a UTC instant as trimmed-nanosecond RFC 3339 with a `Z` suffix.
pub fn format_rfc3339_nano(ts: DateTime<Utc>) -> String {
    let base = ts.format("%Y-%m-%dT%H:%M:%S");
    let nanos = ts.timestamp_subsec_nanos();
    if nanos == 0 {
        return format!("{}Z", base);
    }
    let frac = format!("{:09}", nanos);
    format!("{}.{}Z", base, frac.trim_end_matches('0'))
}

/// Current time in ledger format.
pub fn now_rfc3339_nano() -> String {
    format_rfc3339_nano(Utc::now())
}

/// Parse any RFC 3339 timestamp into UTC.
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// True when `value` survives a parse/format round trip unchanged.
///
/// Rejects non-UTC offsets (including `+00:00`), padded fractions and
/// anything else that would not be produced by [`format_rfc3339_nano`].
pub fn is_canonical_utc(value: &str) -> bool {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => format_rfc3339_nano(parsed.with_timezone(&Utc)) == value,
        Err(_) => false,
    }
}

/// Render a duration as `1h2m3s`, `2m0s`, `45s`, `1.5s` or `300ms`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", with_fraction(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", with_fraction(nanos, 1_000_000));
    }

    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = u128::from(total % 60) * 1_000_000_000 + u128::from(d.subsec_nanos());

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&with_fraction(seconds, 1_000_000_000));
    out.push('s');
    out
}

fn with_fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }
    let width = unit.to_string().len() - 1;
    let frac = format!("{:0width$}", rem, width = width);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Parse the `1h2m3.5s` form back into a duration.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return None;
    }
    if rest == "0" {
        return Some(Duration::ZERO);
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total_nanos += value * scale;
        rest = &rest[unit_len..];
    }

    Some(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_trims_fraction() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(500_000_000);
        assert_eq!(format_rfc3339_nano(ts), "2024-05-01T10:00:00.5Z");

        let whole = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(format_rfc3339_nano(whole), "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_canonical_utc() {
        assert!(is_canonical_utc("2024-05-01T10:00:00.123456789Z"));
        assert!(is_canonical_utc("2024-05-01T10:00:00Z"));
        assert!(!is_canonical_utc("2024-05-01T10:00:00.500Z"));
        assert!(!is_canonical_utc("2024-05-01T12:00:00+02:00"));
        assert!(!is_canonical_utc("2024-05-01T10:00:00+00:00"));
        assert!(!is_canonical_utc("yesterday"));
        assert!(is_canonical_utc(&now_rfc3339_nano()));
    }

    #[test]
    fn test_duration_format() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m0s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_millis(300)), "300ms");
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(parse_duration("2m0s"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_duration("300ms"), Some(Duration::from_millis(300)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5x"), None);
    }
}
