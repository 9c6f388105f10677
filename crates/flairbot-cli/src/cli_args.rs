use std::path::PathBuf;

use clap::Parser;
use flairbot_ai::DEFAULT_GEMINI_API_BASE;
use flairbot_runtime::{DEFAULT_REDDIT_API_BASE, DEFAULT_REDDIT_AUTH_BASE};

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_temperature(value: &str) -> Result<f32, String> {
    let parsed = value
        .parse::<f32>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() || !(0.0..=2.0).contains(&parsed) {
        return Err("value must be a number in range 0.0..=2.0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "flairbot",
    about = "Replies to unflaired Reddit commenters and pins a warning on overrun threads",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "FLAIRBOT_SUBREDDIT",
        default_value = "NBAWestMemeWar",
        help = "Subreddit whose comment stream is moderated"
    )]
    pub subreddit: String,

    #[arg(
        long = "reddit-client-id",
        env = "REDDIT_CLIENT_ID",
        hide_env_values = true,
        help = "Reddit script-app client id"
    )]
    pub reddit_client_id: Option<String>,

    #[arg(
        long = "reddit-client-secret",
        env = "REDDIT_CLIENT_SECRET",
        hide_env_values = true,
        help = "Reddit script-app client secret"
    )]
    pub reddit_client_secret: Option<String>,

    #[arg(
        long = "reddit-username",
        env = "REDDIT_USERNAME",
        help = "Moderator account the bot posts as"
    )]
    pub reddit_username: Option<String>,

    #[arg(
        long = "reddit-password",
        env = "REDDIT_PASSWORD",
        hide_env_values = true,
        help = "Password of the moderator account"
    )]
    pub reddit_password: Option<String>,

    #[arg(
        long = "reddit-user-agent",
        env = "FLAIRBOT_REDDIT_USER_AGENT",
        default_value = "flairbot/0.1 (no-flair moderation responder)",
        help = "User-Agent sent with every Reddit request"
    )]
    pub reddit_user_agent: String,

    #[arg(
        long = "reddit-api-base",
        env = "FLAIRBOT_REDDIT_API_BASE",
        default_value = DEFAULT_REDDIT_API_BASE,
        help = "Base URL for authenticated Reddit API calls"
    )]
    pub reddit_api_base: String,

    #[arg(
        long = "reddit-auth-base",
        env = "FLAIRBOT_REDDIT_AUTH_BASE",
        default_value = DEFAULT_REDDIT_AUTH_BASE,
        help = "Base URL for the Reddit OAuth token endpoint"
    )]
    pub reddit_auth_base: String,

    #[arg(
        long = "bot-username",
        env = "FLAIRBOT_BOT_USERNAME",
        help = "Account name the bot never replies to. Resolved from api/v1/me when omitted"
    )]
    pub bot_username: Option<String>,

    #[arg(
        long = "gemini-api-key",
        env = "GEMINI_API_KEY",
        hide_env_values = true,
        help = "API key for Google Gemini"
    )]
    pub gemini_api_key: Option<String>,

    #[arg(
        long = "gemini-api-base",
        env = "FLAIRBOT_GEMINI_API_BASE",
        default_value = DEFAULT_GEMINI_API_BASE,
        help = "Base URL for the Gemini generateContent API"
    )]
    pub gemini_api_base: String,

    #[arg(
        long,
        env = "FLAIRBOT_MODEL",
        default_value = "gemini-2.5-flash",
        help = "Gemini model used to write replies"
    )]
    pub model: String,

    #[arg(
        long = "prompt-template-file",
        env = "FLAIRBOT_PROMPT_TEMPLATE_FILE",
        help = "Prompt template with {username} and {usermessage} placeholders"
    )]
    pub prompt_template_file: Option<PathBuf>,

    #[arg(
        long = "max-output-tokens",
        env = "FLAIRBOT_MAX_OUTPUT_TOKENS",
        value_parser = parse_positive_u32,
        help = "Optional cap on generated reply tokens"
    )]
    pub max_output_tokens: Option<u32>,

    #[arg(
        long,
        env = "FLAIRBOT_TEMPERATURE",
        value_parser = parse_temperature,
        help = "Optional sampling temperature for generated replies"
    )]
    pub temperature: Option<f32>,

    #[arg(
        long = "generation-timeout-ms",
        env = "FLAIRBOT_GENERATION_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Upper bound for one generation call"
    )]
    pub generation_timeout_ms: u64,

    #[arg(
        long = "gemini-max-retries",
        env = "FLAIRBOT_GEMINI_MAX_RETRIES",
        default_value_t = 0,
        help = "Provider-level retries per generation. Each retry is an extra unbudgeted call"
    )]
    pub gemini_max_retries: usize,

    #[arg(
        long = "max-replies-per-thread",
        env = "FLAIRBOT_MAX_REPLIES_PER_THREAD",
        default_value_t = 3,
        help = "Distinct users individually replied to per thread"
    )]
    pub max_replies_per_thread: usize,

    #[arg(
        long = "final-warning-threshold",
        env = "FLAIRBOT_FINAL_WARNING_THRESHOLD",
        default_value_t = 10,
        value_parser = parse_positive_u64,
        help = "Violations in one thread that trigger the pinned warning"
    )]
    pub final_warning_threshold: u64,

    #[arg(
        long = "max-thread-age-days",
        env = "FLAIRBOT_MAX_THREAD_AGE_DAYS",
        default_value_t = 7,
        value_parser = parse_positive_u64,
        help = "Comments in older threads are ignored"
    )]
    pub max_thread_age_days: u64,

    #[arg(
        long = "short-window-limit",
        env = "FLAIRBOT_SHORT_WINDOW_LIMIT",
        default_value_t = 5,
        value_parser = parse_positive_u32,
        help = "Generation calls allowed per short window"
    )]
    pub short_window_limit: u32,

    #[arg(
        long = "short-window-seconds",
        env = "FLAIRBOT_SHORT_WINDOW_SECONDS",
        default_value_t = 60,
        value_parser = parse_positive_u64,
        help = "Length of the short rate window"
    )]
    pub short_window_seconds: u64,

    #[arg(
        long = "long-window-limit",
        env = "FLAIRBOT_LONG_WINDOW_LIMIT",
        default_value_t = 250,
        value_parser = parse_positive_u32,
        help = "Generation calls allowed per long window"
    )]
    pub long_window_limit: u32,

    #[arg(
        long = "long-window-seconds",
        env = "FLAIRBOT_LONG_WINDOW_SECONDS",
        default_value_t = 86_400,
        value_parser = parse_positive_u64,
        help = "Length of the long rate window"
    )]
    pub long_window_seconds: u64,

    #[arg(
        long = "drop-rate-limited-events",
        env = "FLAIRBOT_DROP_RATE_LIMITED_EVENTS",
        help = "Drop comments that arrive while the generation budget is exhausted instead of waiting for it"
    )]
    pub drop_rate_limited_events: bool,

    #[arg(
        long = "reply-footer",
        env = "FLAIRBOT_REPLY_FOOTER",
        help = "Footer appended to every reply. {subreddit} is replaced with the subreddit name"
    )]
    pub reply_footer: Option<String>,

    #[arg(
        long = "final-warning-message",
        env = "FLAIRBOT_FINAL_WARNING_MESSAGE",
        help = "Body of the pinned thread warning"
    )]
    pub final_warning_message: Option<String>,

    #[arg(
        long = "state-dir",
        env = "FLAIRBOT_STATE_DIR",
        default_value = ".flairbot",
        help = "Directory holding bot_state.json and actions.jsonl"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "action-log-max-bytes",
        env = "FLAIRBOT_ACTION_LOG_MAX_BYTES",
        default_value_t = 10 * 1024 * 1024,
        help = "Rotate actions.jsonl once it would exceed this size. 0 disables rotation"
    )]
    pub action_log_max_bytes: u64,

    #[arg(
        long = "action-log-max-backups",
        env = "FLAIRBOT_ACTION_LOG_MAX_BACKUPS",
        default_value_t = 4,
        help = "Rotated action log files kept next to actions.jsonl"
    )]
    pub action_log_max_backups: usize,

    #[arg(
        long = "poll-interval-ms",
        env = "FLAIRBOT_POLL_INTERVAL_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Delay between comment listing polls when nothing new arrived"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "seen-comment-cap",
        env = "FLAIRBOT_SEEN_COMMENT_CAP",
        default_value_t = 10_000,
        value_parser = parse_positive_usize,
        help = "Comment ids remembered for de-duplication"
    )]
    pub seen_comment_cap: usize,

    #[arg(
        long = "process-existing",
        env = "FLAIRBOT_PROCESS_EXISTING",
        help = "Also process comments already present at startup"
    )]
    pub process_existing: bool,

    #[arg(
        long = "restart-delay-seconds",
        env = "FLAIRBOT_RESTART_DELAY_SECONDS",
        default_value_t = 60,
        value_parser = parse_positive_u64,
        help = "Pause before restarting the comment stream after a failure"
    )]
    pub restart_delay_seconds: u64,

    #[arg(
        long = "request-timeout-ms",
        env = "FLAIRBOT_REQUEST_TIMEOUT_MS",
        default_value_t = 15_000,
        value_parser = parse_positive_u64,
        help = "Timeout for individual Reddit requests"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "retry-max-attempts",
        env = "FLAIRBOT_RETRY_MAX_ATTEMPTS",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        help = "Attempts for retryable Reddit requests. Comment posts are never retried"
    )]
    pub retry_max_attempts: usize,

    #[arg(
        long = "retry-base-delay-ms",
        env = "FLAIRBOT_RETRY_BASE_DELAY_MS",
        default_value_t = 500,
        value_parser = parse_positive_u64,
        help = "Base delay for exponential retry backoff of Reddit and Gemini requests"
    )]
    pub retry_base_delay_ms: u64,

    #[arg(
        long = "log-file",
        env = "FLAIRBOT_LOG_FILE",
        help = "Append logs to this file instead of stderr"
    )]
    pub log_file: Option<PathBuf>,
}
