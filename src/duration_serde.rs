//! Human-readable durations for config files and flags: `"60"`, `"1.5s"`,
//! `"500ms"`, `"2m"`, `"1h"`. A bare number is seconds.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse(&s).map_err(serde::de::Error::custom)
}

/// Shortest exact representation, falling back to milliseconds.
pub fn format(duration: &Duration) -> String {
    let millis = duration.as_millis();
    match millis {
        m if m != 0 && m % 3_600_000 == 0 => format!("{}h", m / 3_600_000),
        m if m != 0 && m % 60_000 == 0 => format!("{}m", m / 60_000),
        m if m % 1000 == 0 => format!("{}s", m / 1000),
        m => format!("{m}ms"),
    }
}

pub fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        return Err(format!("missing number in duration {s:?}"));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid number in duration {s:?}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("duration must be a non-negative number, got {s:?}"));
    }

    let seconds = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    Ok(Duration::from_secs_f64(seconds))
}
