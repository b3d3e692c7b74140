// src/config/duration.rs

//! Human-friendly duration strings: `"250ms"`, `"3s"`, `"2m"`, `"1h"`.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::errors::{FlotillaError, Result};

/// Parse a duration string made of an integer and a unit suffix.
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    if digits.is_empty() {
        return Err(FlotillaError::ConfigError(format!(
            "invalid duration '{input}': expected a number followed by ms, s, m or h"
        )));
    }

    let value: u64 = digits.parse().map_err(|_| {
        FlotillaError::ConfigError(format!("invalid duration '{input}': number out of range"))
    })?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => {
            return Err(FlotillaError::ConfigError(format!(
                "invalid duration '{input}': unknown unit '{other}'"
            )));
        }
    };

    Ok(duration)
}

/// `deserialize_with` helper for required duration fields.
pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// `deserialize_with` helper for optional duration fields.
pub fn deserialize_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}
