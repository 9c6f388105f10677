//! Moderation runtime for the flairbot no-flair responder.
//!
//! Hosts the per-comment decision pipeline, the dual-window generation
//! budget, persisted per-thread state and the Reddit adapters that feed and
//! act on it.

mod moderation_runtime;

pub use moderation_runtime::*;
