//! Text generation client surface used by the flairbot moderation runtime.
mod gemini;
mod types;

pub use gemini::{GeminiClient, GeminiConfig, DEFAULT_GEMINI_API_BASE};
pub use types::{
    ChatRequest, ChatResponse, ChatUsage, FlairbotAiError, LlmClient, Message, MessageRole,
};
