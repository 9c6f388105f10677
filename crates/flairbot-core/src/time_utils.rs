use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `expires_unix_ms` is present and no longer in the future.
pub fn is_expired_unix_ms(expires_unix_ms: Option<u64>, now_unix_ms: u64) -> bool {
    matches!(expires_unix_ms, Some(value) if value <= now_unix_ms)
}

/// Converts fractional Unix seconds (as reported by Reddit's `created_utc`)
/// into whole milliseconds, clamping negative and non-finite input to zero.
pub fn unix_seconds_f64_to_ms(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    let millis = seconds * 1_000.0;
    if millis >= u64::MAX as f64 {
        return u64::MAX;
    }
    millis as u64
}
