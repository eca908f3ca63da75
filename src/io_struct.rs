use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chat turn. Extra provider-specific fields ride along untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,

    #[serde(flatten)]
    pub other: Value,
}

/// Client-facing request body: the conversation so far.
#[derive(Debug, Deserialize, Serialize)]
pub struct ChatReqInput {
    pub messages: Vec<ChatMessage>,
}

/// Body forwarded to the completion provider. Messages pass through
/// verbatim; the relay pins the model parameters.
#[derive(Debug, Serialize)]
pub struct UpstreamChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_completion_tokens: u32,
}

/// Structured error returned when a request is rejected before any
/// streamed byte has been written.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
