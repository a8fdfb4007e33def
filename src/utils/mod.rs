//! Utility functions.

use std::time::Duration;

/// Parse a duration string like "30s", "10m", "1h", "1d".
///
/// Returns `None` for empty input, a missing or unknown unit, or an amount
/// too large to represent.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let (split, unit) = input.char_indices().last()?;
    let amount: u64 = input[..split].parse().ok()?;

    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return None,
    };
    let seconds = amount.checked_mul(scale)?;

    Some(Duration::from_secs(seconds))
}
