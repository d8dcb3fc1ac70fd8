//! Human-readable duration parsing
//!
//! Library scan intervals are stored as strings like "90s", "15m" or
//! "1h30m". Parsing accepts any sequence of `<number><unit>` components
//! with units `s`, `m`, `h` and `d`; a bare number is seconds.

use crate::{Error, Result};
use std::time::Duration;

/// Parse a human duration string into a [`Duration`].
///
/// Returns `InvalidInput` for empty strings, unknown units, or components
/// without a numeric part. Callers that schedule scans fall back to a
/// default interval on error rather than propagating it.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidInput("empty duration".to_string()));
    }

    // Bare seconds, e.g. "90"
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total_secs = 0u64;
    let mut number = String::new();
    let mut seen_component = false;

    for c in s.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }

        let value: u64 = number.parse().map_err(|_| {
            Error::InvalidInput(format!("invalid duration component in {:?}", s))
        })?;
        number.clear();

        let unit_secs = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown duration unit {:?} in {:?}",
                    other, s
                )))
            }
        };
        total_secs += value * unit_secs;
        seen_component = true;
    }

    if !number.is_empty() || !seen_component {
        return Err(Error::InvalidInput(format!("invalid duration {:?}", s)));
    }

    Ok(Duration::from_secs(total_secs))
}

/// Format a duration back to the compact form accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit_secs, suffix) in [(86400, 'd'), (3600, 'h'), (60, 'm'), (1, 's')] {
        if secs >= unit_secs {
            out.push_str(&format!("{}{}", secs / unit_secs, suffix));
            secs %= unit_secs;
        }
    }
    out
}
