//! `flairbot` binary: wires Reddit, Gemini and the moderation runtime together.

mod bootstrap_helpers;
mod cli_args;

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use flairbot_ai::{GeminiClient, GeminiConfig, LlmClient};
use flairbot_runtime::{
    render_footer, run_moderation_bot, JsonlRotation, ModerationDispatcher, ModerationPolicy,
    ModerationRuntimeConfig, PromptResponseGenerator, RateWindowConfig, RedditApiClient,
    RedditApiClientConfig, RedditCommentStream, RedditCommentStreamConfig, RedditCredentials,
    DEFAULT_FINAL_WARNING_MESSAGE, DEFAULT_PROMPT_TEMPLATE, DEFAULT_REPLY_FOOTER_TEMPLATE,
};

use bootstrap_helpers::init_tracing;
use cli_args::Cli;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> Result<()> {
    let subreddit = normalize_subreddit(&cli.subreddit)?;
    let credentials = resolve_reddit_credentials(&cli)?;
    let gemini_api_key = resolve_non_empty_cli_value(cli.gemini_api_key.as_deref())
        .ok_or_else(|| anyhow!("--gemini-api-key (or GEMINI_API_KEY) is required"))?;
    let prompt_template = load_prompt_template(cli.prompt_template_file.as_deref())?;

    let reddit = RedditApiClient::new(build_reddit_client_config(&cli, credentials))?;
    reddit
        .authenticate()
        .await
        .context("reddit authentication failed")?;
    let bot_username = match resolve_non_empty_cli_value(cli.bot_username.as_deref()) {
        Some(name) => name,
        None => reddit
            .resolve_username()
            .await
            .context("failed to resolve bot username")?,
    };

    let gemini: Arc<dyn LlmClient> = Arc::new(
        GeminiClient::new(GeminiConfig {
            api_base: cli.gemini_api_base.clone(),
            api_key: gemini_api_key,
            request_timeout_ms: cli.generation_timeout_ms,
            max_retries: cli.gemini_max_retries,
            retry_base_delay_ms: cli.retry_base_delay_ms,
        })
        .context("failed to create gemini client")?,
    );
    let generator = Arc::new(
        PromptResponseGenerator::new(
            gemini,
            cli.model.clone(),
            prompt_template,
            Duration::from_millis(cli.generation_timeout_ms),
        )
        .with_max_output_tokens(cli.max_output_tokens)
        .with_temperature(cli.temperature),
    );

    let config = build_runtime_config(&cli, &subreddit, &bot_username);
    let restart_delay = config.restart_delay;
    let mut dispatcher = ModerationDispatcher::new(config, generator, Arc::new(reddit.clone()))?;
    let mut stream = RedditCommentStream::new(reddit, build_stream_config(&cli, &subreddit));

    tracing::info!(
        subreddit = %subreddit,
        bot_username = %bot_username,
        model = %cli.model,
        state_dir = %cli.state_dir.display(),
        known_threads = dispatcher.state().threads().len(),
        finalized_threads = dispatcher.state().finalized_threads().count(),
        "flairbot started"
    );
    run_moderation_bot(&mut dispatcher, &mut stream, restart_delay).await
}

fn resolve_non_empty_cli_value(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn normalize_subreddit(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_start_matches("/r/").trim_start_matches("r/");
    if trimmed.is_empty() || trimmed.contains('/') {
        bail!("--subreddit must be a subreddit name, got {raw:?}");
    }
    Ok(trimmed.to_string())
}

fn resolve_reddit_credentials(cli: &Cli) -> Result<RedditCredentials> {
    let required = |value: Option<&str>, flag: &str, env: &str| {
        resolve_non_empty_cli_value(value)
            .ok_or_else(|| anyhow!("{flag} (or {env}) is required"))
    };
    Ok(RedditCredentials {
        client_id: required(
            cli.reddit_client_id.as_deref(),
            "--reddit-client-id",
            "REDDIT_CLIENT_ID",
        )?,
        client_secret: required(
            cli.reddit_client_secret.as_deref(),
            "--reddit-client-secret",
            "REDDIT_CLIENT_SECRET",
        )?,
        username: required(
            cli.reddit_username.as_deref(),
            "--reddit-username",
            "REDDIT_USERNAME",
        )?,
        password: required(
            cli.reddit_password.as_deref(),
            "--reddit-password",
            "REDDIT_PASSWORD",
        )?,
    })
}

fn load_prompt_template(path: Option<&Path>) -> Result<String> {
    let Some(path) = path else {
        return Ok(DEFAULT_PROMPT_TEMPLATE.to_string());
    };
    let template = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompt template {}", path.display()))?;
    if template.trim().is_empty() {
        bail!("prompt template {} is empty", path.display());
    }
    Ok(template)
}

fn build_reddit_client_config(
    cli: &Cli,
    credentials: RedditCredentials,
) -> RedditApiClientConfig {
    RedditApiClientConfig {
        api_base: cli.reddit_api_base.clone(),
        auth_base: cli.reddit_auth_base.clone(),
        user_agent: cli.reddit_user_agent.clone(),
        credentials,
        request_timeout_ms: cli.request_timeout_ms,
        retry_max_attempts: cli.retry_max_attempts,
        retry_base_delay_ms: cli.retry_base_delay_ms,
    }
}

fn build_stream_config(cli: &Cli, subreddit: &str) -> RedditCommentStreamConfig {
    RedditCommentStreamConfig {
        subreddit: subreddit.to_string(),
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        seen_comment_cap: cli.seen_comment_cap,
        skip_existing: !cli.process_existing,
    }
}

fn build_runtime_config(cli: &Cli, subreddit: &str, bot_username: &str) -> ModerationRuntimeConfig {
    let footer_template = cli
        .reply_footer
        .as_deref()
        .unwrap_or(DEFAULT_REPLY_FOOTER_TEMPLATE);
    ModerationRuntimeConfig {
        policy: ModerationPolicy {
            max_replies_per_thread: cli.max_replies_per_thread,
            final_warning_threshold: cli.final_warning_threshold,
            max_thread_age: Duration::from_secs(
                cli.max_thread_age_days.saturating_mul(SECONDS_PER_DAY),
            ),
            ..ModerationPolicy::new(bot_username)
        },
        short_window: RateWindowConfig::new(
            cli.short_window_limit,
            Duration::from_secs(cli.short_window_seconds),
        ),
        long_window: RateWindowConfig::new(
            cli.long_window_limit,
            Duration::from_secs(cli.long_window_seconds),
        ),
        drop_rate_limited_events: cli.drop_rate_limited_events,
        reply_footer: render_footer(footer_template, subreddit),
        final_warning_message: cli
            .final_warning_message
            .clone()
            .unwrap_or_else(|| DEFAULT_FINAL_WARNING_MESSAGE.to_string()),
        state_dir: cli.state_dir.clone(),
        action_log_rotation: JsonlRotation {
            max_bytes: cli.action_log_max_bytes,
            max_backups: cli.action_log_max_backups,
        },
        restart_delay: Duration::from_secs(cli.restart_delay_seconds),
    }
}
