//! Human-readable size and duration strings.
//!
//! Sizes always use binary multiples: `"1GB"` and `"1GiB"` both mean
//! 1024³ bytes. A bare number is bytes for sizes and hours for durations.

use std::time::Duration;
use thiserror::Error;

const KIB: f64 = 1024.0;
const HOUR_SECS: f64 = 60.0 * 60.0;
const DAY_SECS: f64 = 24.0 * HOUR_SECS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid format `{0}`")]
    InvalidFormat(String),
}

pub type UnitResult<T> = Result<T, UnitError>;

/// Split `"2.5 GB"` into `(2.5, "gb")`.
///
/// The input is trimmed and lowercased; the number must start with a digit.
fn split_quantity(input: &str) -> UnitResult<(f64, String)> {
    let normalized = input.trim().to_ascii_lowercase();
    if !normalized.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(UnitError::InvalidFormat(input.to_string()));
    }

    let split_at = normalized
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(normalized.len());
    let (number, unit) = normalized.split_at(split_at);

    let value = number
        .parse::<f64>()
        .map_err(|_| UnitError::InvalidFormat(input.to_string()))?;
    if !value.is_finite() {
        return Err(UnitError::InvalidFormat(input.to_string()));
    }

    Ok((value, unit.trim().to_string()))
}

/// Parse a size such as `"5GB"`, `"100MiB"` or `"2048"` into bytes.
pub fn parse_size(input: &str) -> UnitResult<u64> {
    let (value, unit) = split_quantity(input)?;
    let multiplier = match unit.as_str() {
        "" | "b" | "byte" | "bytes" => 1.0,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => KIB.powi(2),
        "g" | "gb" | "gib" => KIB.powi(3),
        "t" | "tb" | "tib" => KIB.powi(4),
        _ => return Err(UnitError::InvalidFormat(input.to_string())),
    };

    let bytes = (value * multiplier).round();
    if bytes > u64::MAX as f64 {
        return Err(UnitError::InvalidFormat(input.to_string()));
    }
    Ok(bytes as u64)
}

/// Parse a duration such as `"3d"`, `"1W"` or `"90min"`.
///
/// Months are 30 days and years 365 days.
pub fn parse_duration(input: &str) -> UnitResult<Duration> {
    let (value, unit) = split_quantity(input)?;
    let unit_secs = match unit.as_str() {
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "" | "h" | "hr" | "hrs" | "hour" | "hours" => HOUR_SECS,
        "d" | "day" | "days" => DAY_SECS,
        "w" | "week" | "weeks" => 7.0 * DAY_SECS,
        "mo" | "month" | "months" => 30.0 * DAY_SECS,
        "y" | "year" | "years" => 365.0 * DAY_SECS,
        _ => return Err(UnitError::InvalidFormat(input.to_string())),
    };

    Duration::try_from_secs_f64(value * unit_secs)
        .map_err(|_| UnitError::InvalidFormat(input.to_string()))
}

/// Render a byte count with two decimals, e.g. `"1.50 KB"`.
pub fn format_bytes(bytes: u64) -> String {
    const LABELS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= KIB && idx < LABELS.len() - 1 {
        value /= KIB;
        idx += 1;
    }
    format!("{:.2} {}", value, LABELS[idx])
}
