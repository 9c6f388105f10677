//! Reddit OAuth API client used for comment polling and moderator writes.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use flairbot_core::{
    current_unix_timestamp_ms, is_expired_unix_ms, is_retryable_status,
    is_retryable_transport_error, parse_retry_after, retry_delay, truncate_for_error,
    unix_seconds_f64_to_ms,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::ModerationActions;

pub const DEFAULT_REDDIT_API_BASE: &str = "https://oauth.reddit.com";
pub const DEFAULT_REDDIT_AUTH_BASE: &str = "https://www.reddit.com";
const TOKEN_REFRESH_MARGIN_MS: u64 = 60_000;
const INFO_BATCH_SIZE: usize = 100;
const DELETED_AUTHOR: &str = "[deleted]";

#[derive(Clone)]
/// Script-app credentials for the password grant.
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RedditApiClientConfig {
    pub api_base: String,
    pub auth_base: String,
    pub user_agent: String,
    pub credentials: RedditCredentials,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// A comment as returned by the subreddit comment listing.
pub(super) struct RedditComment {
    pub(super) fullname: String,
    pub(super) thread_id: String,
    pub(super) author: Option<String>,
    pub(super) author_flair_text: Option<String>,
    pub(super) body: String,
}

#[derive(Debug, Deserialize)]
struct RedditAccessTokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RedditListing<T> {
    data: RedditListingData<T>,
}

#[derive(Debug, Deserialize)]
struct RedditListingData<T> {
    #[serde(default = "Vec::new")]
    children: Vec<RedditThing<T>>,
}

#[derive(Debug, Deserialize)]
struct RedditThing<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RedditCommentData {
    name: String,
    link_id: String,
    author: Option<String>,
    author_flair_text: Option<String>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct RedditLinkData {
    name: String,
    created_utc: f64,
}

#[derive(Debug, Deserialize)]
struct RedditJsonEnvelope {
    json: RedditJsonBody,
}

#[derive(Debug, Deserialize)]
struct RedditJsonBody {
    #[serde(default)]
    errors: Vec<Value>,
    data: Option<RedditJsonData>,
}

#[derive(Debug, Deserialize)]
struct RedditJsonData {
    #[serde(default)]
    things: Vec<RedditThing<RedditCreatedThing>>,
}

#[derive(Debug, Deserialize)]
struct RedditCreatedThing {
    name: String,
}

#[derive(Debug, Clone)]
struct CachedAccessToken {
    value: String,
    expires_unix_ms: u64,
}

#[derive(Clone)]
/// Authenticated Reddit client. Clones share one cached access token.
pub struct RedditApiClient {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
    credentials: RedditCredentials,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
    token: Arc<Mutex<Option<CachedAccessToken>>>,
}

impl RedditApiClient {
    pub fn new(config: RedditApiClientConfig) -> Result<Self> {
        if config.credentials.client_id.trim().is_empty()
            || config.credentials.username.trim().is_empty()
        {
            bail!("reddit client id and username are required");
        }
        let user_agent = reqwest::header::HeaderValue::from_str(config.user_agent.trim())
            .context("invalid reddit user agent")?;
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::USER_AGENT, user_agent);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create reddit api client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth_base: config.auth_base.trim_end_matches('/').to_string(),
            credentials: config.credentials,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// Fetches a fresh token, failing when the credentials are unusable.
    pub async fn authenticate(&self) -> Result<()> {
        let mut cached = self.token.lock().await;
        *cached = Some(self.fetch_access_token().await?);
        Ok(())
    }

    pub async fn resolve_username(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Me {
            name: Option<String>,
        }

        let token = self.access_token().await?;
        let me: Me = self
            .request_json(
                "api/v1/me",
                || {
                    self.http
                        .get(format!("{}/api/v1/me", self.api_base))
                        .bearer_auth(&token)
                },
                true,
            )
            .await?;
        me.name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| anyhow!("reddit api/v1/me did not return a username"))
    }

    /// Lists the newest comments in `subreddit`, newest first.
    pub(super) async fn list_new_comments(
        &self,
        subreddit: &str,
        limit: usize,
    ) -> Result<Vec<RedditComment>> {
        let token = self.access_token().await?;
        let limit = limit.clamp(1, 100).to_string();
        let listing: RedditListing<RedditCommentData> = self
            .request_json(
                "subreddit comments",
                || {
                    self.http
                        .get(format!("{}/r/{subreddit}/comments", self.api_base))
                        .bearer_auth(&token)
                        .query(&[("limit", limit.as_str()), ("raw_json", "1")])
                },
                true,
            )
            .await?;

        Ok(listing
            .data
            .children
            .into_iter()
            .map(|thing| {
                let data = thing.data;
                RedditComment {
                    fullname: data.name,
                    thread_id: strip_fullname_prefix(&data.link_id).to_string(),
                    author: data
                        .author
                        .filter(|author| !author.is_empty() && author != DELETED_AUTHOR),
                    author_flair_text: data.author_flair_text,
                    body: data.body,
                }
            })
            .collect())
    }

    /// Resolves creation times (unix ms) for bare thread ids. Threads Reddit
    /// does not return are absent from the result.
    pub(super) async fn fetch_thread_created(
        &self,
        thread_ids: &[String],
    ) -> Result<HashMap<String, u64>> {
        let mut created = HashMap::new();
        for chunk in thread_ids.chunks(INFO_BATCH_SIZE) {
            let token = self.access_token().await?;
            let ids = chunk
                .iter()
                .map(|thread_id| format!("t3_{thread_id}"))
                .collect::<Vec<_>>()
                .join(",");
            let listing: RedditListing<RedditLinkData> = self
                .request_json(
                    "api/info",
                    || {
                        self.http
                            .get(format!("{}/api/info", self.api_base))
                            .bearer_auth(&token)
                            .query(&[("id", ids.as_str()), ("raw_json", "1")])
                    },
                    true,
                )
                .await?;
            for thing in listing.data.children {
                created.insert(
                    strip_fullname_prefix(&thing.data.name).to_string(),
                    unix_seconds_f64_to_ms(thing.data.created_utc),
                );
            }
        }
        Ok(created)
    }

    /// Posts `text` under `parent_fullname`. Never retried: a request that
    /// reached Reddit may already have created the comment.
    pub(super) async fn submit_comment(&self, parent_fullname: &str, text: &str) -> Result<String> {
        let token = self.access_token().await?;
        let envelope: RedditJsonEnvelope = self
            .request_json(
                "api/comment",
                || {
                    self.http
                        .post(format!("{}/api/comment", self.api_base))
                        .bearer_auth(&token)
                        .form(&[
                            ("api_type", "json"),
                            ("thing_id", parent_fullname),
                            ("text", text),
                        ])
                },
                false,
            )
            .await?;
        ensure_no_json_errors("api/comment", &envelope.json.errors)?;
        envelope
            .json
            .data
            .and_then(|data| data.things.into_iter().next())
            .map(|thing| thing.data.name)
            .ok_or_else(|| anyhow!("reddit api/comment response did not include the new comment"))
    }

    pub(super) async fn distinguish_thing(&self, fullname: &str, sticky: bool) -> Result<()> {
        let token = self.access_token().await?;
        let sticky = if sticky { "true" } else { "false" };
        let envelope: RedditJsonEnvelope = self
            .request_json(
                "api/distinguish",
                || {
                    self.http
                        .post(format!("{}/api/distinguish", self.api_base))
                        .bearer_auth(&token)
                        .form(&[
                            ("api_type", "json"),
                            ("id", fullname),
                            ("how", "yes"),
                            ("sticky", sticky),
                        ])
                },
                true,
            )
            .await?;
        ensure_no_json_errors("api/distinguish", &envelope.json.errors)
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        let now_unix_ms = current_unix_timestamp_ms();
        if let Some(token) = cached.as_ref() {
            if !is_expired_unix_ms(Some(token.expires_unix_ms), now_unix_ms) {
                return Ok(token.value.clone());
            }
        }
        tracing::debug!("refreshing reddit access token");
        let token = self.fetch_access_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn fetch_access_token(&self) -> Result<CachedAccessToken> {
        let response: RedditAccessTokenResponse = self
            .request_json(
                "access_token",
                || {
                    self.http
                        .post(format!("{}/api/v1/access_token", self.auth_base))
                        .basic_auth(
                            &self.credentials.client_id,
                            Some(&self.credentials.client_secret),
                        )
                        .form(&[
                            ("grant_type", "password"),
                            ("username", self.credentials.username.as_str()),
                            ("password", self.credentials.password.as_str()),
                        ])
                },
                true,
            )
            .await?;
        if let Some(error) = response.error {
            bail!("reddit access_token request rejected: {error}");
        }
        let value = response
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| anyhow!("reddit access_token response missing access_token"))?;
        let lifetime_ms = response.expires_in.unwrap_or(3_600).saturating_mul(1_000);
        Ok(CachedAccessToken {
            value,
            expires_unix_ms: current_unix_timestamp_ms()
                .saturating_add(lifetime_ms.saturating_sub(TOKEN_REFRESH_MARGIN_MS)),
        })
    }

    async fn request_json<T, F>(&self, operation: &str, mut builder: F, retry: bool) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let max_attempts = if retry { self.retry_max_attempts } else { 1 };
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            match builder().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode reddit {operation}"));
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < max_attempts && is_retryable_status(status.as_u16()) {
                        let delay = retry_delay(self.retry_base_delay_ms, attempt, retry_after);
                        tracing::debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying reddit request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    bail!(
                        "reddit api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("reddit api {operation} request failed"));
                }
            }
        }
    }
}

#[async_trait]
impl ModerationActions for RedditApiClient {
    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<String> {
        self.submit_comment(comment_id, text).await
    }

    async fn reply_to_thread(&self, thread_id: &str, text: &str) -> Result<String> {
        self.submit_comment(&format!("t3_{}", strip_fullname_prefix(thread_id)), text)
            .await
    }

    async fn distinguish(&self, reply_id: &str, sticky: bool) -> Result<()> {
        self.distinguish_thing(reply_id, sticky).await
    }
}

fn strip_fullname_prefix(fullname: &str) -> &str {
    match fullname.split_once('_') {
        Some((prefix, id)) if prefix.len() == 2 && prefix.starts_with('t') => id,
        _ => fullname,
    }
}

fn ensure_no_json_errors(operation: &str, errors: &[Value]) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    bail!(
        "reddit {operation} returned errors: {}",
        truncate_for_error(&Value::Array(errors.to_vec()).to_string(), 400)
    )
}
