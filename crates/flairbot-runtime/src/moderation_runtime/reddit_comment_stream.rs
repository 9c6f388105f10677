//! Polling comment stream over the subreddit comment listing.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;

use super::reddit_api_client::{RedditApiClient, RedditComment};
use super::{CommentEvent, CommentSource};

const LISTING_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct RedditCommentStreamConfig {
    pub subreddit: String,
    pub poll_interval: Duration,
    pub seen_comment_cap: usize,
    /// When set, comments present at the first poll are recorded as seen
    /// and never yielded.
    pub skip_existing: bool,
}

/// Yields each new subreddit comment once, oldest first.
pub struct RedditCommentStream {
    client: RedditApiClient,
    config: RedditCommentStreamConfig,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
    thread_created: HashMap<String, u64>,
    thread_created_order: VecDeque<String>,
    pending: VecDeque<CommentEvent>,
    primed: bool,
}

impl RedditCommentStream {
    pub fn new(client: RedditApiClient, config: RedditCommentStreamConfig) -> Self {
        Self {
            client,
            config: RedditCommentStreamConfig {
                subreddit: config.subreddit.trim().trim_start_matches("r/").to_string(),
                seen_comment_cap: config.seen_comment_cap.max(LISTING_LIMIT),
                ..config
            },
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
            thread_created: HashMap::new(),
            thread_created_order: VecDeque::new(),
            pending: VecDeque::new(),
            primed: false,
        }
    }

    pub fn subreddit(&self) -> &str {
        &self.config.subreddit
    }

    /// Polls the listing once and queues unseen comments. Returns how many
    /// events were queued.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let listing = self
            .client
            .list_new_comments(&self.config.subreddit, LISTING_LIMIT)
            .await?;
        let fresh = listing
            .into_iter()
            .rev()
            .filter(|comment| !self.seen.contains(&comment.fullname))
            .collect::<Vec<_>>();

        if !self.primed {
            self.primed = true;
            if self.config.skip_existing {
                tracing::info!(
                    subreddit = %self.config.subreddit,
                    skipped = fresh.len(),
                    "comment stream primed; existing comments skipped"
                );
                for comment in &fresh {
                    self.mark_seen(&comment.fullname);
                }
                return Ok(0);
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        self.resolve_thread_times(&fresh).await?;
        let mut queued = 0_usize;
        for comment in fresh {
            self.mark_seen(&comment.fullname);
            let Some(thread_created_unix_ms) =
                self.thread_created.get(&comment.thread_id).copied()
            else {
                tracing::warn!(
                    comment_id = %comment.fullname,
                    thread_id = %comment.thread_id,
                    "dropping comment whose thread could not be resolved"
                );
                continue;
            };
            self.pending
                .push_back(comment_event(comment, thread_created_unix_ms));
            queued = queued.saturating_add(1);
        }
        Ok(queued)
    }

    async fn resolve_thread_times(&mut self, comments: &[RedditComment]) -> Result<()> {
        let mut missing = comments
            .iter()
            .map(|comment| comment.thread_id.clone())
            .filter(|thread_id| !self.thread_created.contains_key(thread_id))
            .collect::<Vec<_>>();
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            return Ok(());
        }

        let resolved = self.client.fetch_thread_created(&missing).await?;
        for (thread_id, created) in resolved {
            if self.thread_created.insert(thread_id.clone(), created).is_none() {
                self.thread_created_order.push_back(thread_id);
            }
        }
        while self.thread_created_order.len() > self.config.seen_comment_cap {
            if let Some(evicted) = self.thread_created_order.pop_front() {
                self.thread_created.remove(&evicted);
            }
        }
        Ok(())
    }

    fn mark_seen(&mut self, fullname: &str) {
        if !self.seen.insert(fullname.to_string()) {
            return;
        }
        self.seen_order.push_back(fullname.to_string());
        while self.seen_order.len() > self.config.seen_comment_cap {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

#[async_trait]
impl CommentSource for RedditCommentStream {
    async fn next_comment(&mut self) -> Result<CommentEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if self.poll_once().await? == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }
}

fn comment_event(comment: RedditComment, thread_created_unix_ms: u64) -> CommentEvent {
    CommentEvent {
        comment_id: comment.fullname,
        thread_id: comment.thread_id,
        author: comment.author,
        author_flair: comment
            .author_flair_text
            .filter(|flair| !flair.trim().is_empty()),
        body: comment.body,
        thread_created_unix_ms,
    }
}
