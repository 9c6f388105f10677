use async_trait::async_trait;
use flairbot_core::{
    is_retryable_status, is_retryable_transport_error, parse_retry_after, retry_delay,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::{
    ChatRequest, ChatResponse, ChatUsage, FlairbotAiError, LlmClient, Message, MessageRole,
};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
/// Connection settings for the Gemini `generateContent` endpoint.
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
    /// Extra attempts after the first. Each one is an additional provider call.
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone)]
/// Gemini text generation client.
pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, FlairbotAiError> {
        if config.api_key.trim().is_empty() {
            return Err(FlairbotAiError::MissingApiKey);
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    fn generate_content_url(&self, model: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.contains(":generateContent") {
            return base.replace("{model}", model);
        }
        let model = model.trim_start_matches("models/");
        format!("{base}/models/{model}:generateContent")
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, FlairbotAiError> {
        let body = build_generate_content_body(&request);
        let url = self.generate_content_url(&request.model);
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0_usize;

        loop {
            attempt = attempt.saturating_add(1);
            let response = self
                .client
                .post(&url)
                .query(&[("key", self.config.api_key.as_str())])
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let raw = response.text().await?;
                        return parse_generate_content_response(&raw);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let raw = response.text().await?;
                    if attempt < max_attempts && is_retryable_status(status.as_u16()) {
                        let delay =
                            retry_delay(self.config.retry_base_delay_ms, attempt, retry_after);
                        tracing::debug!(
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying gemini generateContent"
                        );
                        sleep(delay).await;
                        continue;
                    }

                    return Err(FlairbotAiError::HttpStatus {
                        status: status.as_u16(),
                        body: raw,
                    });
                }
                Err(error) => {
                    if attempt < max_attempts && is_retryable_transport_error(&error) {
                        sleep(retry_delay(self.config.retry_base_delay_ms, attempt, None)).await;
                        continue;
                    }
                    return Err(FlairbotAiError::Http(error));
                }
            }
        }
    }
}

fn build_generate_content_body(request: &ChatRequest) -> Value {
    let system = request
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(Message::text_content)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents = request
        .messages
        .iter()
        .filter(|message| !message.text.trim().is_empty())
        .filter_map(|message| {
            let role = match message.role {
                MessageRole::System => return None,
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            Some(json!({
                "role": role,
                "parts": [{ "text": message.text }],
            }))
        })
        .collect::<Vec<_>>();

    let mut body = json!({ "contents": contents });
    if !system.is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{ "text": system }],
        });
    }

    if request.temperature.is_some() || request.max_tokens.is_some() {
        let mut generation_config = json!({});
        if let Some(temperature) = request.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        body["generationConfig"] = generation_config;
    }

    body
}

fn parse_generate_content_response(raw: &str) -> Result<ChatResponse, FlairbotAiError> {
    let parsed: GenerateContentResponse = serde_json::from_str(raw)?;
    let candidate = match parsed.candidates.and_then(|candidates| candidates.into_iter().next())
    {
        Some(candidate) => candidate,
        None => {
            let reason = parsed
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(FlairbotAiError::InvalidResponse(format!(
                "response contained no candidates ({reason})"
            )));
        }
    };

    let text = candidate
        .content
        .and_then(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let usage = parsed
        .usage_metadata
        .map(|usage| ChatUsage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            total_tokens: usage.total_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message::assistant_text(text),
        finish_reason: candidate.finish_reason,
        usage,
    })
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<GenerateContentCandidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeneratePromptFeedback>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GenerateContentUsage>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentCandidate {
    content: Option<GenerateContentContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentContent {
    parts: Option<Vec<GenerateContentPart>>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratePromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::{build_generate_content_body, parse_generate_content_response};
    use crate::{ChatRequest, FlairbotAiError, Message};

    #[test]
    fn serializes_system_instruction_and_generation_overrides() {
        let request = ChatRequest {
            model: "gemini-2.5-flash".to_string(),
            messages: vec![Message::system("be brief"), Message::user("roast them")],
            max_tokens: Some(120),
            temperature: Some(0.9),
        };

        let body = build_generate_content_body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "roast them");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 120);
    }

    #[test]
    fn plain_prompt_omits_generation_config() {
        let body = build_generate_content_body(&ChatRequest::prompt("gemini-2.5-flash", "hi"));
        assert!(body.get("generationConfig").is_none());
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn parses_multi_part_text_and_usage() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "first"}, {"text": "second"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 4, "totalTokenCount": 14}
        }"#;
        let response = parse_generate_content_response(raw).expect("parse");
        assert_eq!(response.message.text_content(), "first\nsecond");
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage.total_tokens, 14);
    }

    #[test]
    fn regression_blocked_prompt_surfaces_block_reason() {
        let raw = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let error = parse_generate_content_response(raw).expect_err("blocked");
        match error {
            FlairbotAiError::InvalidResponse(message) => assert!(message.contains("SAFETY")),
            other => panic!("expected InvalidResponse, got {other:?}"),
        }
    }
}
