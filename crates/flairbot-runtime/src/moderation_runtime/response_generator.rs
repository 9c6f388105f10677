//! Turns a reply decision into rebuke text through an [`LlmClient`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use flairbot_ai::{ChatRequest, FlairbotAiError, LlmClient};
use thiserror::Error;

use super::CommentEvent;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are a regular in a trash-talking NBA fan \
subreddit. Everyone there is expected to wear a user flair naming the team they root for; \
anyone posting without one is treated as a coward hiding their allegiance. The user \
\"/u/{username}\" just commented without a flair. Their comment was: \"{usermessage}\". \
Roast them for posting flairless. Be brutal but witty, mock their username, and never use \
slurs of any kind. Do not repeat their message back to them. Tell them to flair up or leave. \
Reply with exactly two short, rapid-fire sentences.";

/// Substring that marks a generated response as a provider error page rather
/// than usable text. This is a heuristic: a legitimate roast that happens to
/// say "error" is discarded too.
const ERROR_MARKER: &str = "error";

#[derive(Debug, Error)]
/// Reasons a generation attempt produced no usable reply.
pub enum GenerationFailure {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation provider failed: {0}")]
    Provider(#[from] FlairbotAiError),
    #[error("generation returned no text")]
    Empty,
    #[error("generation response contained an error marker")]
    ErrorMarker,
}

impl GenerationFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Provider(_) => "provider",
            Self::Empty => "empty",
            Self::ErrorMarker => "error_marker",
        }
    }
}

#[async_trait]
/// Produces the body of an individual rebuke.
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, event: &CommentEvent) -> Result<String, GenerationFailure>;
}

/// Renders the prompt template and issues one bounded completion request.
pub struct PromptResponseGenerator {
    client: Arc<dyn LlmClient>,
    model: String,
    prompt_template: String,
    timeout: Duration,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl PromptResponseGenerator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        prompt_template: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            prompt_template: prompt_template.into(),
            timeout,
            max_output_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: Option<u32>) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl ResponseGenerator for PromptResponseGenerator {
    async fn generate(&self, event: &CommentEvent) -> Result<String, GenerationFailure> {
        let mut request = ChatRequest::prompt(
            self.model.clone(),
            render_prompt(&self.prompt_template, event),
        );
        request.max_tokens = self.max_output_tokens;
        request.temperature = self.temperature;

        let response = tokio::time::timeout(self.timeout, self.client.complete(request))
            .await
            .map_err(|_| GenerationFailure::Timeout(self.timeout))??;
        tracing::debug!(
            comment_id = %event.comment_id,
            total_tokens = response.usage.total_tokens,
            finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
            "generation completed"
        );
        screen_generated_text(response.message.text_content())
    }
}

/// Fills `{username}` and `{usermessage}` placeholders.
pub fn render_prompt(template: &str, event: &CommentEvent) -> String {
    template
        .replace("{username}", event.author.as_deref().unwrap_or("[deleted]"))
        .replace("{usermessage}", event.body.trim())
}

/// Applies the acceptance checks to raw generated text.
pub fn screen_generated_text(text: &str) -> Result<String, GenerationFailure> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GenerationFailure::Empty);
    }
    if trimmed.to_lowercase().contains(ERROR_MARKER) {
        return Err(GenerationFailure::ErrorMarker);
    }
    Ok(trimmed.to_string())
}
