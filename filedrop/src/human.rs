//! Human-friendly duration and byte-size notations.
//!
//! Durations are written as a sequence of `<number><unit>` groups with the
//! units in strictly descending order, e.g. `1d12h`.  Time determination
//! beyond days resp. weeks is a more complex issue; there is no clear
//! duration of a month, so the monthly average of the Gregorian calendar is
//! used.
//!
//! Byte sizes use binary prefixes where the decimal and binary spellings
//! share the same multiplier: both `1KB` and `1KiB` are 1024 bytes.

use derive_more::Display;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
// 30.44 days
const MONTH: u64 = 2_630_016;
const YEAR: u64 = 12 * MONTH;

/// Units in strictly descending order, with their pretty names.
const UNITS: [(&str, u64, &str); 7] = [
    ("y", YEAR, "year"),
    ("mo", MONTH, "month"),
    ("w", WEEK, "week"),
    ("d", DAY, "day"),
    ("h", HOUR, "hour"),
    ("m", MINUTE, "minute"),
    ("s", SECOND, "second"),
];

/// The input did not match the expected pattern.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[display(fmt = "input does not match pattern")]
pub struct NoMatch;

impl std::error::Error for NoMatch {}

static DURATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let mut pattern = String::from(r"\A");
    for (unit, _, _) in UNITS {
        pattern.push_str(&format!(r"((?P<{0}>\d+){0})?", unit));
    }
    pattern.push_str(r"\z");

    Regex::new(&pattern).expect("duration pattern")
});

/// Pattern for client-side validation of duration inputs.
pub fn duration_input_pattern() -> String {
    UNITS
        .iter()
        .map(|(unit, _, _)| format!(r"(\d+{})?", unit))
        .collect()
}

/// Parse a positive duration string like `1d5m`.
///
/// Valid time units are `y`, `mo`, `w`, `d`, `h`, `m` and `s`; each may
/// appear at most once and they must be ordered from largest to smallest.
pub fn parse_duration(input: &str) -> Result<Duration, NoMatch> {
    if input.is_empty() {
        return Err(NoMatch);
    }

    let captures = DURATION_PATTERN.captures(input).ok_or(NoMatch)?;

    let mut seconds: u64 = 0;
    for (unit, unit_seconds, _) in UNITS {
        if let Some(amount) = captures.name(unit) {
            let amount: u64 = amount.as_str().parse().map_err(|_| NoMatch)?;
            seconds = seconds
                .checked_add(amount.checked_mul(unit_seconds).ok_or(NoMatch)?)
                .ok_or(NoMatch)?;
        }
    }

    Ok(Duration::from_secs(seconds))
}

/// Render a duration as English words, e.g. `2 hours 4 minutes 10 seconds`.
pub fn pretty_duration(duration: Duration) -> String {
    let mut rest = duration.as_secs();
    let mut parts = Vec::new();

    for (_, unit_seconds, name) in UNITS {
        if unit_seconds > rest {
            continue;
        }

        let amount = rest / unit_seconds;
        rest %= unit_seconds;

        if amount == 1 {
            parts.push(format!("{} {}", amount, name));
        } else {
            parts.push(format!("{} {}s", amount, name));
        }
    }

    parts.join(" ")
}

const BYTE_PREFIXES: [char; 6] = ['B', 'K', 'M', 'G', 'T', 'P'];

static BYTESIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\A(?P<size>\d+)(?P<unit>([KMGTP]i?)?B)\z").expect("bytesize pattern"));

/// Parse a positive, whole byte amount like `1B` or `23KiB`.
pub fn parse_bytesize(input: &str) -> Result<u64, NoMatch> {
    let captures = BYTESIZE_PATTERN.captures(input).ok_or(NoMatch)?;

    let mut size: u64 = captures["size"].parse().map_err(|_| NoMatch)?;
    if size == 0 {
        return Err(NoMatch);
    }

    let unit = captures["unit"].chars().next().ok_or(NoMatch)?;
    for prefix in BYTE_PREFIXES {
        if prefix == unit {
            return Ok(size);
        }
        size = size.checked_mul(1024).ok_or(NoMatch)?;
    }

    Err(NoMatch)
}

/// Render a byte amount with its closest binary prefix, e.g. `1.5 MiB`.
pub fn pretty_bytesize(size: u64) -> String {
    for (i, prefix) in BYTE_PREFIXES.iter().enumerate() {
        if size >= 1024u64.pow(i as u32 + 1) {
            continue;
        }

        let relative = size as f64 / 1024f64.powi(i as i32);
        if i == 0 {
            return format!("{:.1} B", relative);
        }
        return format!("{:.1} {}iB", relative, prefix);
    }

    // It's a feature, okay?!
    "too big to fail".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_durations() {
        let tests: [(&str, u64, bool); 6] = [
            ("1d5m", DAY + 5 * MINUTE, true),
            ("4w", 4 * WEEK, true),
            ("1y2mo3w4d5h6m7s", YEAR + 2 * MONTH + 3 * WEEK + 4 * DAY + 5 * HOUR + 6 * MINUTE + 7, true),
            ("1m10h", 0, false),
            ("", 0, false),
            ("-1m", 0, false),
        ];

        for (input, seconds, valid) in tests {
            let parsed = parse_duration(input);
            assert_eq!(parsed.is_ok(), valid, "{:?} -> {:?}", input, parsed);

            if valid {
                assert_eq!(parsed.unwrap(), Duration::from_secs(seconds), "{:?}", input);
            }
        }
    }

    #[test]
    fn pretty_durations() {
        let tests: [(u64, &str); 6] = [
            (MINUTE, "1 minute"),
            (5 * MINUTE, "5 minutes"),
            (2 * HOUR + 4 * MINUTE + 10, "2 hours 4 minutes 10 seconds"),
            (YEAR, "1 year"),
            (12 * MONTH, "1 year"),
            (13 * MONTH, "1 year 1 month"),
        ];

        for (seconds, expected) in tests {
            assert_eq!(pretty_duration(Duration::from_secs(seconds)), expected);
        }
    }

    #[test]
    fn duration_round_trips() {
        for seconds in [1, 59, MINUTE, HOUR + 23 * MINUTE, 3 * DAY, WEEK, MONTH, YEAR] {
            let duration = Duration::from_secs(seconds);
            let pretty = pretty_duration(duration);

            let mut compact = String::new();
            for word in pretty.split(' ').collect::<Vec<_>>().chunks(2) {
                let unit = UNITS
                    .iter()
                    .find(|(_, _, name)| word[1].trim_end_matches('s') == *name)
                    .unwrap()
                    .0;
                compact.push_str(word[0]);
                compact.push_str(unit);
            }

            assert_eq!(parse_duration(&compact), Ok(duration), "{:?}", pretty);
        }
    }

    #[test]
    fn parse_bytesizes() {
        let tests: [(&str, u64, bool); 7] = [
            ("1B", 1, true),
            ("1MB", 1024 * 1024, true),
            ("1MiB", 1024 * 1024, true),
            ("23KiB", 23 * 1024, true),
            ("1Mi", 0, false),
            ("0B", 0, false),
            ("", 0, false),
        ];

        for (input, size, valid) in tests {
            let parsed = parse_bytesize(input);
            assert_eq!(parsed.is_ok(), valid, "{:?} -> {:?}", input, parsed);

            if valid {
                assert_eq!(parsed.unwrap(), size, "{:?}", input);
            }
        }
    }

    #[test]
    fn pretty_bytesizes() {
        let tests: [(u64, &str); 6] = [
            (1, "1.0 B"),
            (1024, "1.0 KiB"),
            (1536, "1.5 KiB"),
            (1536 * 1024, "1.5 MiB"),
            (1536 * 1024 * 1024, "1.5 GiB"),
            (u64::MAX, "too big to fail"),
        ];

        for (size, expected) in tests {
            assert_eq!(pretty_bytesize(size), expected);
        }
    }
}
