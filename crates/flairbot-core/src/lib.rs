//! Low-level helpers shared across flairbot crates.
//!
//! Provides the atomic snapshot writer used for moderation state, the rotating
//! JSONL appender behind the action log, the HTTP retry policy shared by the
//! Reddit and Gemini clients, and the clock helpers used by rate windows,
//! token expiry and thread-age checks.

pub mod atomic_io;
pub mod http_retry;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use http_retry::{
    is_retryable_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};
pub use log_rotation::{append_jsonl_line, JsonlRotation};
pub use time_utils::{current_unix_timestamp_ms, is_expired_unix_ms, unix_seconds_f64_to_ms};
