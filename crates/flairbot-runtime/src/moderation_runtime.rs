//! Moderation runtime that consumes comment events and enforces the flair rule.

use std::{future::Future, panic::AssertUnwindSafe, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use flairbot_core::current_unix_timestamp_ms;
use futures_util::FutureExt;

pub use flairbot_core::JsonlRotation;

pub const STATE_FILE_NAME: &str = "bot_state.json";
pub const ACTION_LOG_FILE_NAME: &str = "actions.jsonl";

pub const DEFAULT_REPLY_FOOTER_TEMPLATE: &str = "*I am a bot, and this action was performed \
automatically. You won't be replied to again in this thread. Please add a user flair to follow \
the rules of r/{subreddit}. [Contact the moderators](https://www.reddit.com/message/compose/?to=/r/{subreddit}) \
if you have questions.*";

pub const DEFAULT_FINAL_WARNING_MESSAGE: &str = "Pinning this because this thread is overrun \
with flairless commenters. Nobody here cares about an opinion from someone too scared to show \
their team. Pick a flair from the sidebar or take it somewhere else. If your team is missing, \
edit one of the existing flairs.";

#[derive(Debug, Clone)]
/// Runtime configuration for the moderation loop.
pub struct ModerationRuntimeConfig {
    pub policy: ModerationPolicy,
    pub short_window: RateWindowConfig,
    pub long_window: RateWindowConfig,
    /// Drop events that arrive while the budget is exhausted instead of
    /// waiting and re-evaluating them.
    pub drop_rate_limited_events: bool,
    pub reply_footer: String,
    pub final_warning_message: String,
    pub state_dir: PathBuf,
    pub action_log_rotation: JsonlRotation,
    pub restart_delay: Duration,
}

mod action_log;
mod policy;
mod rate_budget;
mod reddit_api_client;
mod reddit_comment_stream;
mod response_generator;
mod thread_state_store;

pub use action_log::{ActionLog, ModerationActionKind, ModerationActionRecord};
pub use policy::{decide, Decision, ModerationPolicy, SkipReason};
pub use rate_budget::{
    BudgetDecision, RateBudget, RateBudgetUsage, RateWindowConfig, RateWindowKind,
};
pub use reddit_api_client::{
    RedditApiClient, RedditApiClientConfig, RedditCredentials, DEFAULT_REDDIT_API_BASE,
    DEFAULT_REDDIT_AUTH_BASE,
};
pub use reddit_comment_stream::{RedditCommentStream, RedditCommentStreamConfig};
pub use response_generator::{
    render_prompt, screen_generated_text, GenerationFailure, PromptResponseGenerator,
    ResponseGenerator, DEFAULT_PROMPT_TEMPLATE,
};
pub use thread_state_store::{ThreadModerationState, ThreadStateStore};

#[derive(Debug, Clone, PartialEq, Eq)]
/// One comment observed on the live stream.
pub struct CommentEvent {
    pub comment_id: String,
    /// Bare thread id, also the key of the persisted state maps.
    pub thread_id: String,
    /// `None` for deleted accounts.
    pub author: Option<String>,
    pub author_flair: Option<String>,
    pub body: String,
    pub thread_created_unix_ms: u64,
}

#[async_trait]
/// Blocking source of comment events. An error ends the current consumption
/// pass; the outer runner restarts it after the restart delay.
pub trait CommentSource: Send {
    async fn next_comment(&mut self) -> Result<CommentEvent>;
}

#[async_trait]
/// Outbound moderator writes. Each call returns the id of the created reply.
pub trait ModerationActions: Send + Sync {
    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<String>;
    async fn reply_to_thread(&self, thread_id: &str, text: &str) -> Result<String>;
    async fn distinguish(&self, reply_id: &str, sticky: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What processing one event did.
pub struct EventOutcome {
    pub decision: Decision,
    pub reply_id: Option<String>,
    pub final_warning_id: Option<String>,
    pub failures: Vec<ModerationActionKind>,
    pub persisted: bool,
}

impl EventOutcome {
    fn new(decision: Decision) -> Self {
        Self {
            decision,
            reply_id: None,
            final_warning_id: None,
            failures: Vec::new(),
            persisted: false,
        }
    }
}

/// Fills the `{subreddit}` placeholder of a footer template.
pub fn render_footer(template: &str, subreddit: &str) -> String {
    template.replace("{subreddit}", subreddit)
}

/// Owns thread state, the rate budget and the action log, and applies one
/// event at a time.
pub struct ModerationDispatcher {
    config: ModerationRuntimeConfig,
    state_store: ThreadStateStore,
    rate_budget: RateBudget,
    action_log: ActionLog,
    generator: Arc<dyn ResponseGenerator>,
    actions: Arc<dyn ModerationActions>,
}

impl ModerationDispatcher {
    pub fn new(
        config: ModerationRuntimeConfig,
        generator: Arc<dyn ResponseGenerator>,
        actions: Arc<dyn ModerationActions>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir).with_context(|| {
            format!(
                "failed to create state directory {}",
                config.state_dir.display()
            )
        })?;
        let state_store = ThreadStateStore::load(config.state_dir.join(STATE_FILE_NAME));
        let action_log = ActionLog::open(
            config.state_dir.join(ACTION_LOG_FILE_NAME),
            config.action_log_rotation,
        )?;
        let rate_budget = RateBudget::new(config.short_window, config.long_window);
        Ok(Self {
            config,
            state_store,
            rate_budget,
            action_log,
            generator,
            actions,
        })
    }

    pub fn state(&self) -> &ThreadStateStore {
        &self.state_store
    }

    pub fn rate_budget_usage(&self) -> RateBudgetUsage {
        self.rate_budget.usage()
    }

    /// Pulls events from `source` until `shutdown` resolves or the source
    /// fails. Shutdown is only observed between events.
    pub async fn consume<S, F>(&mut self, source: &mut S, shutdown: F) -> Result<()>
    where
        S: CommentSource + ?Sized,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                event = source.next_comment() => event.context("comment stream failed")?,
            };
            self.handle_event(event).await;
        }
    }

    /// Applies the rate gate, then processes the event. An exhausted budget
    /// always waits for the soonest reset; in drop mode the event is then
    /// abandoned and `None` is returned.
    pub async fn handle_event(&mut self, event: CommentEvent) -> Option<EventOutcome> {
        loop {
            match self.rate_budget.check() {
                BudgetDecision::Granted => break,
                BudgetDecision::Exhausted { window, wait } => {
                    tracing::info!(
                        comment_id = %event.comment_id,
                        window = window.as_str(),
                        wait_ms = wait.as_millis() as u64,
                        "rate budget exhausted; waiting for the window to reset"
                    );
                    tokio::time::sleep(wait).await;
                    if self.config.drop_rate_limited_events {
                        tracing::warn!(
                            comment_id = %event.comment_id,
                            window = window.as_str(),
                            "dropping comment that arrived while rate limited"
                        );
                        return None;
                    }
                }
            }
        }
        Some(self.process_event(&event, current_unix_timestamp_ms()).await)
    }

    /// Decides, executes side effects, mutates thread state and persists.
    /// Skipped events leave state untouched.
    pub async fn process_event(&mut self, event: &CommentEvent, now_unix_ms: u64) -> EventOutcome {
        let decision = decide(
            event,
            self.state_store.thread(&event.thread_id),
            &self.config.policy,
            now_unix_ms,
        );
        let outcome = EventOutcome::new(decision);
        if let Decision::Skip(reason) = decision {
            tracing::debug!(
                comment_id = %event.comment_id,
                thread_id = %event.thread_id,
                author = event.author.as_deref().unwrap_or("[deleted]"),
                reason = reason.as_str(),
                "skipped comment"
            );
            return outcome;
        }
        self.apply_violation(event, outcome).await
    }

    async fn apply_violation(
        &mut self,
        event: &CommentEvent,
        mut outcome: EventOutcome,
    ) -> EventOutcome {
        let Some(author) = event.author.clone() else {
            return outcome;
        };
        if outcome.decision.wants_reply() {
            outcome.reply_id = self.post_reply(event, &author, &mut outcome.failures).await;
        }
        if outcome.decision.wants_final_warning() {
            outcome.final_warning_id = self.post_final_warning(event, &mut outcome.failures).await;
        }

        let thread = self.state_store.thread_mut(&event.thread_id);
        thread.violation_count = thread.violation_count.saturating_add(1);
        if outcome.reply_id.is_some() {
            thread.replied_users.insert(author.clone());
        }
        if outcome.final_warning_id.is_some() {
            thread.final_warning_posted = true;
        }
        let violation_count = thread.violation_count;

        match self.state_store.save() {
            Ok(()) => outcome.persisted = true,
            Err(error) => tracing::error!(
                state_file = %self.state_store.path().display(),
                error = %format!("{error:#}"),
                "failed to persist moderation state"
            ),
        }

        tracing::info!(
            comment_id = %event.comment_id,
            thread_id = %event.thread_id,
            author = %author,
            decision = outcome.decision.as_str(),
            violation_count,
            replied = outcome.reply_id.is_some(),
            final_warning = outcome.final_warning_id.is_some(),
            failures = outcome.failures.len(),
            "processed flairless comment"
        );
        outcome
    }

    async fn post_reply(
        &mut self,
        event: &CommentEvent,
        author: &str,
        failures: &mut Vec<ModerationActionKind>,
    ) -> Option<String> {
        if let BudgetDecision::Exhausted { window, .. } = self.rate_budget.try_acquire() {
            self.record_failure(
                failures,
                ModerationActionKind::BudgetExhausted,
                event,
                format!("{} rate window exhausted", window.as_str()),
            );
            return None;
        }
        let usage = self.rate_budget.usage();
        tracing::debug!(
            short_count = usage.short_count,
            short_limit = usage.short_limit,
            long_count = usage.long_count,
            long_limit = usage.long_limit,
            "generation call budgeted"
        );

        let text = match self.generator.generate(event).await {
            Ok(text) => text,
            Err(failure) => {
                tracing::warn!(
                    comment_id = %event.comment_id,
                    author,
                    kind = failure.kind(),
                    error = %failure,
                    "no reply generated"
                );
                self.record_failure(
                    failures,
                    ModerationActionKind::GenerationFailed,
                    event,
                    failure.to_string(),
                );
                return None;
            }
        };

        let body = self.with_footer(&text);
        let reply_id = match self.actions.reply_to_comment(&event.comment_id, &body).await {
            Ok(reply_id) => reply_id,
            Err(error) => {
                tracing::warn!(
                    comment_id = %event.comment_id,
                    author,
                    error = %format!("{error:#}"),
                    "failed to post reply"
                );
                self.record_failure(
                    failures,
                    ModerationActionKind::ReplyFailed,
                    event,
                    format!("{error:#}"),
                );
                return None;
            }
        };
        self.record(ModerationActionKind::ReplyPosted, event, Some(&reply_id), None);

        if let Err(error) = self.actions.distinguish(&reply_id, false).await {
            tracing::warn!(
                reply_id = %reply_id,
                error = %format!("{error:#}"),
                "failed to distinguish reply"
            );
            failures.push(ModerationActionKind::DistinguishFailed);
            self.record(
                ModerationActionKind::DistinguishFailed,
                event,
                Some(&reply_id),
                Some(format!("{error:#}")),
            );
        }
        Some(reply_id)
    }

    async fn post_final_warning(
        &mut self,
        event: &CommentEvent,
        failures: &mut Vec<ModerationActionKind>,
    ) -> Option<String> {
        let body = self.with_footer(&self.config.final_warning_message);
        let reply_id = match self.actions.reply_to_thread(&event.thread_id, &body).await {
            Ok(reply_id) => reply_id,
            Err(error) => {
                tracing::warn!(
                    thread_id = %event.thread_id,
                    error = %format!("{error:#}"),
                    "failed to post final warning; will retry on the next violation"
                );
                self.record_failure(
                    failures,
                    ModerationActionKind::FinalWarningFailed,
                    event,
                    format!("{error:#}"),
                );
                return None;
            }
        };
        tracing::info!(
            thread_id = %event.thread_id,
            reply_id = %reply_id,
            "posted final warning"
        );
        self.record(
            ModerationActionKind::FinalWarningPosted,
            event,
            Some(&reply_id),
            None,
        );

        if let Err(error) = self.actions.distinguish(&reply_id, true).await {
            tracing::warn!(
                reply_id = %reply_id,
                error = %format!("{error:#}"),
                "failed to pin final warning"
            );
            failures.push(ModerationActionKind::DistinguishFailed);
            self.record(
                ModerationActionKind::DistinguishFailed,
                event,
                Some(&reply_id),
                Some(format!("{error:#}")),
            );
        }
        Some(reply_id)
    }

    fn with_footer(&self, text: &str) -> String {
        let footer = self.config.reply_footer.trim();
        if footer.is_empty() {
            return text.to_string();
        }
        format!("{text}\n\n{footer}")
    }

    fn record_failure(
        &self,
        failures: &mut Vec<ModerationActionKind>,
        kind: ModerationActionKind,
        event: &CommentEvent,
        detail: String,
    ) {
        failures.push(kind);
        self.record(kind, event, None, Some(detail));
    }

    fn record(
        &self,
        kind: ModerationActionKind,
        event: &CommentEvent,
        reply_id: Option<&str>,
        detail: Option<String>,
    ) {
        let record = ModerationActionRecord {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            kind,
            thread_id: event.thread_id.clone(),
            comment_id: event.comment_id.clone(),
            author: event.author.clone(),
            reply_id: reply_id.map(ToOwned::to_owned),
            detail,
        };
        if let Err(error) = self.action_log.append(&record) {
            tracing::warn!(
                action_log = %self.action_log.path().display(),
                error = %format!("{error:#}"),
                "failed to append action record"
            );
        }
    }
}

/// Runs the moderation loop until ctrl-c.
pub async fn run_moderation_bot<S>(
    dispatcher: &mut ModerationDispatcher,
    source: &mut S,
    restart_delay: Duration,
) -> Result<()>
where
    S: CommentSource + ?Sized,
{
    run_moderation_loop(dispatcher, source, restart_delay, ctrl_c_signal).await
}

/// Consumes `source` and restarts consumption after `restart_delay` whenever
/// the source fails or event handling panics. Returns once a future produced
/// by `shutdown` resolves.
pub async fn run_moderation_loop<S, F, Fut>(
    dispatcher: &mut ModerationDispatcher,
    source: &mut S,
    restart_delay: Duration,
    mut shutdown: F,
) -> Result<()>
where
    S: CommentSource + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut restarts = 0_u64;
    loop {
        let consumption = AssertUnwindSafe(dispatcher.consume(source, shutdown()))
            .catch_unwind()
            .await;
        match consumption {
            Ok(Ok(())) => {
                tracing::info!("moderation bot shutdown requested");
                return Ok(());
            }
            Ok(Err(error)) => {
                tracing::error!(
                    error = %format!("{error:#}"),
                    restart_delay_ms = restart_delay.as_millis() as u64,
                    "comment consumption failed; restarting after delay"
                );
            }
            Err(panic) => {
                tracing::error!(
                    panic = panic_message(panic.as_ref()),
                    restart_delay_ms = restart_delay.as_millis() as u64,
                    "comment consumption panicked; restarting after delay"
                );
            }
        }
        restarts = restarts.saturating_add(1);

        tokio::select! {
            _ = shutdown() => {
                tracing::info!(restarts, "moderation bot shutdown requested");
                return Ok(());
            }
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

async fn ctrl_c_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to listen for ctrl-c; shutdown signal disabled");
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message;
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.as_str();
    }
    "non-string panic payload"
}

#[cfg(test)]
mod tests;
