//! Tests for the moderation dispatcher and its restart loop.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use flairbot_core::current_unix_timestamp_ms;
use tempfile::tempdir;
use tokio::sync::watch;

use super::{
    render_footer, run_moderation_loop, CommentEvent, CommentSource, Decision, GenerationFailure,
    JsonlRotation, ModerationActionKind, ModerationActions, ModerationDispatcher, ModerationPolicy,
    ModerationRuntimeConfig, RateWindowConfig, ResponseGenerator, SkipReason, ThreadStateStore,
    ACTION_LOG_FILE_NAME, STATE_FILE_NAME,
};

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Default)]
struct RecordingActions {
    comment_replies: Mutex<Vec<(String, String)>>,
    thread_replies: Mutex<Vec<(String, String)>>,
    distinguished: Mutex<Vec<(String, bool)>>,
    fail_comment_reply: AtomicBool,
    fail_thread_reply: AtomicBool,
    fail_distinguish: AtomicBool,
    next_id: AtomicUsize,
}

impl RecordingActions {
    fn next_reply_id(&self) -> String {
        format!("t1_reply{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn comment_replies(&self) -> Vec<(String, String)> {
        self.comment_replies.lock().expect("replies lock").clone()
    }

    fn thread_replies(&self) -> Vec<(String, String)> {
        self.thread_replies.lock().expect("thread replies lock").clone()
    }

    fn distinguished(&self) -> Vec<(String, bool)> {
        self.distinguished.lock().expect("distinguish lock").clone()
    }
}

#[async_trait]
impl ModerationActions for RecordingActions {
    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<String> {
        if self.fail_comment_reply.load(Ordering::SeqCst) {
            bail!("reddit api api/comment failed with status 503");
        }
        self.comment_replies
            .lock()
            .expect("replies lock")
            .push((comment_id.to_string(), text.to_string()));
        Ok(self.next_reply_id())
    }

    async fn reply_to_thread(&self, thread_id: &str, text: &str) -> Result<String> {
        if self.fail_thread_reply.load(Ordering::SeqCst) {
            bail!("reddit api api/comment failed with status 403");
        }
        self.thread_replies
            .lock()
            .expect("thread replies lock")
            .push((thread_id.to_string(), text.to_string()));
        Ok(self.next_reply_id())
    }

    async fn distinguish(&self, reply_id: &str, sticky: bool) -> Result<()> {
        if self.fail_distinguish.load(Ordering::SeqCst) {
            bail!("reddit api api/distinguish failed with status 403");
        }
        self.distinguished
            .lock()
            .expect("distinguish lock")
            .push((reply_id.to_string(), sticky));
        Ok(())
    }
}

#[derive(Default)]
struct CountingGenerator {
    calls: AtomicUsize,
    fail: AtomicBool,
}

#[async_trait]
impl ResponseGenerator for CountingGenerator {
    async fn generate(&self, event: &CommentEvent) -> Result<String, GenerationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GenerationFailure::ErrorMarker);
        }
        Ok(format!(
            "/u/{} flair up.",
            event.author.as_deref().unwrap_or_default()
        ))
    }
}

impl CountingGenerator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn test_config(state_dir: &Path) -> ModerationRuntimeConfig {
    ModerationRuntimeConfig {
        policy: ModerationPolicy::new("NoFlairBot"),
        short_window: RateWindowConfig::new(5, Duration::from_secs(60)),
        long_window: RateWindowConfig::new(250, Duration::from_secs(86_400)),
        drop_rate_limited_events: false,
        reply_footer: "footer".to_string(),
        final_warning_message: "final warning".to_string(),
        state_dir: state_dir.to_path_buf(),
        action_log_rotation: JsonlRotation::default(),
        restart_delay: Duration::from_millis(5),
    }
}

struct Harness {
    dispatcher: ModerationDispatcher,
    generator: Arc<CountingGenerator>,
    actions: Arc<RecordingActions>,
}

fn harness(config: ModerationRuntimeConfig) -> Harness {
    let generator = Arc::new(CountingGenerator::default());
    let actions = Arc::new(RecordingActions::default());
    let dispatcher = ModerationDispatcher::new(config, generator.clone(), actions.clone())
        .expect("dispatcher");
    Harness {
        dispatcher,
        generator,
        actions,
    }
}

fn comment(comment_id: &str, thread_id: &str, author: &str, now_ms: u64) -> CommentEvent {
    CommentEvent {
        comment_id: format!("t1_{comment_id}"),
        thread_id: thread_id.to_string(),
        author: Some(author.to_string()),
        author_flair: None,
        body: "west is the best".to_string(),
        thread_created_unix_ms: now_ms.saturating_sub(DAY_MS),
    }
}

fn action_kinds(state_dir: &Path) -> Vec<String> {
    let raw = std::fs::read_to_string(state_dir.join(ACTION_LOG_FILE_NAME)).unwrap_or_default();
    raw.lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("action json");
            value["kind"].as_str().unwrap_or_default().to_string()
        })
        .collect()
}

#[tokio::test]
async fn functional_flaired_author_is_skipped_without_mutation_or_calls() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    let now = current_unix_timestamp_ms();
    let mut event = comment("c1", "p1", "lurker", now);
    event.author_flair = Some(":phx: Suns".to_string());

    let outcome = harness.dispatcher.process_event(&event, now).await;

    assert_eq!(outcome.decision, Decision::Skip(SkipReason::AuthorHasFlair));
    assert!(!outcome.persisted);
    assert_eq!(harness.generator.calls(), 0);
    assert!(harness.actions.comment_replies().is_empty());
    assert!(harness.dispatcher.state().thread("p1").is_none());
    assert!(!temp.path().join(STATE_FILE_NAME).exists());
    assert_eq!(harness.dispatcher.rate_budget_usage().short_count, 0);
}

#[tokio::test]
async fn functional_fourth_distinct_author_is_counted_without_reply() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    let now = current_unix_timestamp_ms();

    let mut decisions = Vec::new();
    for (index, author) in ["a", "b", "c", "d"].into_iter().enumerate() {
        let event = comment(&format!("c{index}"), "p1", author, now);
        decisions.push(harness.dispatcher.process_event(&event, now).await.decision);
    }

    assert_eq!(
        decisions,
        vec![
            Decision::Reply,
            Decision::Reply,
            Decision::Reply,
            Decision::CountOnly
        ]
    );
    let thread = harness.dispatcher.state().thread("p1").expect("thread");
    assert_eq!(thread.violation_count, 4);
    assert_eq!(
        thread.replied_users.iter().cloned().collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
    assert_eq!(harness.generator.calls(), 3);

    let replies = harness.actions.comment_replies();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].0, "t1_c0");
    assert_eq!(replies[0].1, "/u/a flair up.\n\nfooter");
    assert!(harness
        .actions
        .distinguished()
        .iter()
        .all(|(_, sticky)| !sticky));
    assert_eq!(harness.dispatcher.rate_budget_usage().short_count, 3);
}

#[tokio::test]
async fn functional_tenth_violation_posts_exactly_one_final_warning() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    let now = current_unix_timestamp_ms();

    for index in 0..9 {
        let event = comment(&format!("c{index}"), "p1", &format!("user{index}"), now);
        let outcome = harness.dispatcher.process_event(&event, now).await;
        assert!(outcome.final_warning_id.is_none());
    }
    assert!(harness.actions.thread_replies().is_empty());

    let tenth = comment("c9", "p1", "user9", now);
    let outcome = harness.dispatcher.process_event(&tenth, now).await;
    assert_eq!(outcome.decision, Decision::FinalWarning);
    assert!(outcome.final_warning_id.is_some());

    let thread_replies = harness.actions.thread_replies();
    assert_eq!(thread_replies.len(), 1);
    assert_eq!(thread_replies[0].0, "p1");
    assert_eq!(thread_replies[0].1, "final warning\n\nfooter");
    let pinned = harness
        .actions
        .distinguished()
        .into_iter()
        .filter(|(_, sticky)| *sticky)
        .count();
    assert_eq!(pinned, 1);

    let snapshot = harness.dispatcher.state().thread("p1").cloned().expect("thread");
    assert!(snapshot.final_warning_posted);
    assert_eq!(snapshot.violation_count, 10);

    let eleventh = comment("c10", "p1", "user10", now);
    let outcome = harness.dispatcher.process_event(&eleventh, now).await;
    assert_eq!(
        outcome.decision,
        Decision::Skip(SkipReason::FinalWarningAlreadyPosted)
    );
    assert_eq!(harness.actions.thread_replies().len(), 1);
    assert_eq!(harness.dispatcher.state().thread("p1"), Some(&snapshot));

    let reloaded = ThreadStateStore::load(temp.path().join(STATE_FILE_NAME));
    assert_eq!(reloaded.thread("p1"), Some(&snapshot));
    assert_eq!(reloaded.finalized_threads().collect::<Vec<_>>(), vec!["p1"]);
}

#[tokio::test]
async fn functional_reply_cap_holds_for_many_authors() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    let now = current_unix_timestamp_ms();

    for index in 0..25 {
        let event = comment(&format!("c{index}"), "p1", &format!("user{index}"), now);
        harness.dispatcher.process_event(&event, now).await;
        let thread = harness.dispatcher.state().thread("p1").expect("thread");
        assert!(thread.replied_users.len() <= 3);
    }
    assert_eq!(harness.actions.comment_replies().len(), 3);
    assert_eq!(harness.actions.thread_replies().len(), 1);
}

#[tokio::test]
async fn regression_generation_failure_still_counts_and_persists() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    harness.generator.fail.store(true, Ordering::SeqCst);
    let now = current_unix_timestamp_ms();

    let outcome = harness
        .dispatcher
        .process_event(&comment("c1", "p1", "lurker", now), now)
        .await;

    assert_eq!(outcome.decision, Decision::Reply);
    assert!(outcome.reply_id.is_none());
    assert_eq!(outcome.failures, vec![ModerationActionKind::GenerationFailed]);
    assert!(outcome.persisted);
    assert!(harness.actions.comment_replies().is_empty());

    let reloaded = ThreadStateStore::load(temp.path().join(STATE_FILE_NAME));
    let thread = reloaded.thread("p1").expect("persisted thread");
    assert_eq!(thread.violation_count, 1);
    assert!(thread.replied_users.is_empty());
    assert_eq!(action_kinds(temp.path()), vec!["generation_failed"]);
}

#[tokio::test]
async fn regression_failed_reply_leaves_author_eligible() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    let now = current_unix_timestamp_ms();

    harness
        .actions
        .fail_comment_reply
        .store(true, Ordering::SeqCst);
    let failed = harness
        .dispatcher
        .process_event(&comment("c1", "p1", "lurker", now), now)
        .await;
    assert_eq!(failed.failures, vec![ModerationActionKind::ReplyFailed]);

    harness
        .actions
        .fail_comment_reply
        .store(false, Ordering::SeqCst);
    let retried = harness
        .dispatcher
        .process_event(&comment("c2", "p1", "lurker", now), now)
        .await;
    assert_eq!(retried.decision, Decision::Reply);
    assert!(retried.reply_id.is_some());

    let thread = harness.dispatcher.state().thread("p1").expect("thread");
    assert_eq!(thread.violation_count, 2);
    assert!(thread.replied_users.contains("lurker"));
    assert_eq!(
        action_kinds(temp.path()),
        vec!["reply_failed", "reply_posted"]
    );
}

#[tokio::test]
async fn regression_distinguish_failure_still_marks_author_replied() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    harness.actions.fail_distinguish.store(true, Ordering::SeqCst);
    let now = current_unix_timestamp_ms();

    let outcome = harness
        .dispatcher
        .process_event(&comment("c1", "p1", "lurker", now), now)
        .await;

    assert!(outcome.reply_id.is_some());
    assert_eq!(
        outcome.failures,
        vec![ModerationActionKind::DistinguishFailed]
    );
    let thread = harness.dispatcher.state().thread("p1").expect("thread");
    assert!(thread.replied_users.contains("lurker"));
}

#[tokio::test]
async fn regression_failed_final_warning_is_retried_on_next_violation() {
    let temp = tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.policy.max_replies_per_thread = 0;
    config.policy.final_warning_threshold = 2;
    let mut harness = harness(config);
    let now = current_unix_timestamp_ms();

    let first = harness
        .dispatcher
        .process_event(&comment("c1", "p1", "a", now), now)
        .await;
    assert_eq!(first.decision, Decision::CountOnly);

    harness.actions.fail_thread_reply.store(true, Ordering::SeqCst);
    let second = harness
        .dispatcher
        .process_event(&comment("c2", "p1", "b", now), now)
        .await;
    assert_eq!(second.decision, Decision::FinalWarning);
    assert_eq!(
        second.failures,
        vec![ModerationActionKind::FinalWarningFailed]
    );
    assert!(!harness
        .dispatcher
        .state()
        .thread("p1")
        .expect("thread")
        .final_warning_posted);

    harness
        .actions
        .fail_thread_reply
        .store(false, Ordering::SeqCst);
    let third = harness
        .dispatcher
        .process_event(&comment("c3", "p1", "c", now), now)
        .await;
    assert_eq!(third.decision, Decision::FinalWarning);
    assert!(third.final_warning_id.is_some());
    assert_eq!(harness.generator.calls(), 0);

    let thread = harness.dispatcher.state().thread("p1").expect("thread");
    assert_eq!(thread.violation_count, 3);
    assert!(thread.final_warning_posted);
}

#[tokio::test]
async fn functional_rate_limited_event_is_requeued_until_budget_resets() {
    let temp = tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.short_window = RateWindowConfig::new(1, Duration::from_millis(150));
    let mut harness = harness(config);
    let now = current_unix_timestamp_ms();

    let first = harness
        .dispatcher
        .handle_event(comment("c1", "p1", "a", now))
        .await
        .expect("first handled");
    assert!(first.reply_id.is_some());

    let started = Instant::now();
    let second = harness
        .dispatcher
        .handle_event(comment("c2", "p2", "b", now))
        .await
        .expect("second handled after waiting");
    assert!(second.reply_id.is_some());
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(harness.generator.calls(), 2);
}

#[tokio::test]
async fn functional_drop_mode_waits_for_reset_then_discards_event() {
    let temp = tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.short_window = RateWindowConfig::new(1, Duration::from_millis(300));
    config.drop_rate_limited_events = true;
    let mut harness = harness(config);
    let now = current_unix_timestamp_ms();

    let started = Instant::now();
    assert!(harness
        .dispatcher
        .handle_event(comment("c1", "p1", "a", now))
        .await
        .is_some());
    assert!(harness
        .dispatcher
        .handle_event(comment("c2", "p2", "b", now))
        .await
        .is_none());
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "dropped after only {:?}",
        started.elapsed()
    );
    assert!(harness.dispatcher.state().thread("p2").is_none());
    assert_eq!(harness.generator.calls(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let third = harness
        .dispatcher
        .handle_event(comment("c3", "p3", "c", now))
        .await
        .expect("budget reset after the wait");
    assert!(third.reply_id.is_some());
    assert_eq!(harness.generator.calls(), 2);
}

#[tokio::test]
async fn regression_budget_exhausted_before_generation_is_logged_as_such() {
    let temp = tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.short_window = RateWindowConfig::new(1, Duration::from_secs(60));
    let mut harness = harness(config);
    let now = current_unix_timestamp_ms();

    harness
        .dispatcher
        .process_event(&comment("c1", "p1", "a", now), now)
        .await;
    let outcome = harness
        .dispatcher
        .process_event(&comment("c2", "p1", "b", now), now)
        .await;

    assert_eq!(outcome.decision, Decision::Reply);
    assert_eq!(outcome.failures, vec![ModerationActionKind::BudgetExhausted]);
    assert!(outcome.persisted);
    assert_eq!(harness.generator.calls(), 1);
    let thread = harness.dispatcher.state().thread("p1").expect("thread");
    assert_eq!(thread.violation_count, 2);
    assert!(!thread.replied_users.contains("b"));
    assert_eq!(
        action_kinds(temp.path()),
        vec!["reply_posted", "budget_exhausted"]
    );
}

enum ScriptStep {
    Event(CommentEvent),
    Fail,
    Panic,
}

struct ScriptedSource {
    steps: VecDeque<ScriptStep>,
    done: watch::Sender<bool>,
    failures: usize,
}

#[async_trait]
impl CommentSource for ScriptedSource {
    async fn next_comment(&mut self) -> Result<CommentEvent> {
        match self.steps.pop_front() {
            Some(ScriptStep::Event(event)) => Ok(event),
            Some(ScriptStep::Fail) => {
                self.failures += 1;
                bail!("listing request failed")
            }
            Some(ScriptStep::Panic) => panic!("scripted source panic"),
            None => {
                self.done.send_replace(true);
                std::future::pending::<Result<CommentEvent>>().await
            }
        }
    }
}

#[tokio::test]
async fn integration_run_loop_restarts_after_stream_failure_and_panic() {
    let temp = tempdir().expect("tempdir");
    let mut harness = harness(test_config(temp.path()));
    let now = current_unix_timestamp_ms();
    let (done, done_rx) = watch::channel(false);
    let mut source = ScriptedSource {
        steps: VecDeque::from([
            ScriptStep::Event(comment("c1", "p1", "a", now)),
            ScriptStep::Fail,
            ScriptStep::Event(comment("c2", "p1", "b", now)),
            ScriptStep::Panic,
            ScriptStep::Event(comment("c3", "p2", "c", now)),
        ]),
        done,
        failures: 0,
    };

    let shutdown = move || {
        let mut done_rx = done_rx.clone();
        async move {
            let _ = done_rx.wait_for(|done| *done).await;
        }
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        run_moderation_loop(
            &mut harness.dispatcher,
            &mut source,
            Duration::from_millis(5),
            shutdown,
        ),
    )
    .await
    .expect("loop should stop on shutdown")
    .expect("loop result");

    assert_eq!(source.failures, 1);
    assert_eq!(harness.actions.comment_replies().len(), 3);
    assert_eq!(
        harness
            .dispatcher
            .state()
            .thread("p1")
            .expect("thread")
            .violation_count,
        2
    );
    assert!(harness.dispatcher.state().thread("p2").is_some());
}

#[test]
fn unit_render_footer_fills_subreddit() {
    assert_eq!(
        render_footer("ask r/{subreddit} mods", "NBAWestMemeWar"),
        "ask r/NBAWestMemeWar mods"
    );
}
