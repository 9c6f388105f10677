//! Pure decision logic for one comment against one thread's state.

use std::time::Duration;

use super::{CommentEvent, ThreadModerationState};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Tunable thresholds consulted by [`decide`].
pub struct ModerationPolicy {
    pub bot_username: String,
    pub max_replies_per_thread: usize,
    pub final_warning_threshold: u64,
    pub max_thread_age: Duration,
}

impl ModerationPolicy {
    pub const DEFAULT_MAX_REPLIES_PER_THREAD: usize = 3;
    pub const DEFAULT_FINAL_WARNING_THRESHOLD: u64 = 10;
    pub const DEFAULT_MAX_THREAD_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    pub fn new(bot_username: impl Into<String>) -> Self {
        Self {
            bot_username: bot_username.into(),
            max_replies_per_thread: Self::DEFAULT_MAX_REPLIES_PER_THREAD,
            final_warning_threshold: Self::DEFAULT_FINAL_WARNING_THRESHOLD,
            max_thread_age: Self::DEFAULT_MAX_THREAD_AGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a comment was left alone. Variants are listed in evaluation order.
pub enum SkipReason {
    DeletedAuthor,
    FinalWarningAlreadyPosted,
    AuthorHasFlair,
    AlreadyReplied,
    SelfAuthored,
    LikelyBot,
    ModTeam,
    ThreadTooOld,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeletedAuthor => "deleted_author",
            Self::FinalWarningAlreadyPosted => "final_warning_already_posted",
            Self::AuthorHasFlair => "author_has_flair",
            Self::AlreadyReplied => "already_replied",
            Self::SelfAuthored => "self_authored",
            Self::LikelyBot => "likely_bot",
            Self::ModTeam => "mod_team",
            Self::ThreadTooOld => "thread_too_old",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of [`decide`]. Every variant except `Skip` is a qualifying
/// violation and increments the thread's violation count exactly once.
pub enum Decision {
    Skip(SkipReason),
    /// Counted, but the per-thread reply cap is reached and the warning
    /// threshold is not crossed.
    CountOnly,
    Reply,
    FinalWarning,
    ReplyThenFinalWarning,
}

impl Decision {
    pub fn is_violation(self) -> bool {
        !matches!(self, Self::Skip(_))
    }

    pub fn wants_reply(self) -> bool {
        matches!(self, Self::Reply | Self::ReplyThenFinalWarning)
    }

    pub fn wants_final_warning(self) -> bool {
        matches!(self, Self::FinalWarning | Self::ReplyThenFinalWarning)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip(reason) => reason.as_str(),
            Self::CountOnly => "count_only",
            Self::Reply => "reply",
            Self::FinalWarning => "final_warning",
            Self::ReplyThenFinalWarning => "reply_then_final_warning",
        }
    }
}

/// Evaluates the ordered skip checks and, for a qualifying violation, which
/// side effects apply. `thread` is `None` for threads never seen before.
pub fn decide(
    event: &CommentEvent,
    thread: Option<&ThreadModerationState>,
    policy: &ModerationPolicy,
    now_unix_ms: u64,
) -> Decision {
    let Some(author) = event.author.as_deref().filter(|name| !name.is_empty()) else {
        return Decision::Skip(SkipReason::DeletedAuthor);
    };
    if thread.is_some_and(|state| state.final_warning_posted) {
        return Decision::Skip(SkipReason::FinalWarningAlreadyPosted);
    }
    if event
        .author_flair
        .as_deref()
        .is_some_and(|flair| !flair.trim().is_empty())
    {
        return Decision::Skip(SkipReason::AuthorHasFlair);
    }
    if thread.is_some_and(|state| state.replied_users.contains(author)) {
        return Decision::Skip(SkipReason::AlreadyReplied);
    }
    if author.eq_ignore_ascii_case(policy.bot_username.trim()) {
        return Decision::Skip(SkipReason::SelfAuthored);
    }
    let lowered = author.to_lowercase();
    if lowered.contains("bot") {
        return Decision::Skip(SkipReason::LikelyBot);
    }
    if lowered.contains("modteam") {
        return Decision::Skip(SkipReason::ModTeam);
    }
    if thread_age(event, now_unix_ms) > policy.max_thread_age {
        return Decision::Skip(SkipReason::ThreadTooOld);
    }

    let replied = thread.map_or(0, |state| state.replied_users.len());
    let next_count = thread
        .map_or(0, |state| state.violation_count)
        .saturating_add(1);
    let reply = replied < policy.max_replies_per_thread;
    let final_warning = next_count >= policy.final_warning_threshold;
    match (reply, final_warning) {
        (true, true) => Decision::ReplyThenFinalWarning,
        (true, false) => Decision::Reply,
        (false, true) => Decision::FinalWarning,
        (false, false) => Decision::CountOnly,
    }
}

fn thread_age(event: &CommentEvent, now_unix_ms: u64) -> Duration {
    Duration::from_millis(now_unix_ms.saturating_sub(event.thread_created_unix_ms))
}
