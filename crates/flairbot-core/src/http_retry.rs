use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Upper bound for any single retry pause, including server-requested ones.
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Reads `Retry-After` as (possibly fractional) seconds or an HTTP date.
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        return Some(Duration::from_millis((seconds * 1_000.0) as u64));
    }
    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    Some(Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0)))
}

/// Pause before retrying after `attempt` (1-based) failed. A server hint is
/// honoured but never shortens the base delay; everything is capped.
pub fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after: Option<Duration>) -> Duration {
    let cap = Duration::from_millis(MAX_RETRY_DELAY_MS);
    if let Some(delay) = retry_after {
        return delay.max(Duration::from_millis(base_delay_ms)).min(cap);
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    let scaled = base_delay_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(scaled).min(cap)
}

/// Timeouts, throttling and server-side failures.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

/// Keeps error bodies readable in logs without splitting a character.
pub fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
