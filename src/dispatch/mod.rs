pub mod http;
pub mod pool;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::conversation::{ChatMessage, ToolCall};
use crate::deadline::RequestDeadline;
use crate::error::DispatchError;
use crate::tools::ToolSpec;

/// Token sequence produced by a streaming backend call. Ends after the last
/// token; a mid-stream failure arrives as a single `Err` item.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, DispatchError>> + Send>>;

/// How the model may use the declared tools on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    /// Force a specific tool by name.
    Pinned(String),
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Answered with text.
    Text,
    /// Requested one or more tool invocations.
    ToolCalls,
    /// Cut off by the token limit or a content filter.
    Truncated,
    Other,
}

/// Non-streaming call parameters. `tools: None` omits the tool catalog
/// entirely (text-only response).
pub struct GenerateRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub tools: Option<&'a [ToolSpec]>,
    pub tool_choice: Option<ToolChoice>,
}

impl<'a> GenerateRequest<'a> {
    pub fn text_only(messages: &'a [ChatMessage]) -> Self {
        Self {
            messages,
            tools: None,
            tool_choice: None,
        }
    }
}

/// Result of a non-streaming call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Text,
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: String::new(),
            tool_calls,
            finish_reason: FinishReason::ToolCalls,
        }
    }

    pub fn requests_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// One generation backend. Implementations must observe `signal` and stop
/// work promptly once it is cancelled.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Provider name for logging and error attribution.
    fn provider(&self) -> &str;

    async fn generate(
        &self,
        req: GenerateRequest<'_>,
        signal: CancellationToken,
    ) -> Result<Generation, DispatchError>;

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        signal: CancellationToken,
    ) -> Result<TokenStream, DispatchError>;
}

/// The standard two-message prompt.
pub fn prompt_messages(system_prompt: &str, user_message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_message),
    ]
}

/// Non-streaming call bounded by the request deadline and by `call_timeout`.
/// Either bound elapsing before or during the call surfaces as `Timeout`.
pub async fn generate_within(
    backend: &dyn Backend,
    req: GenerateRequest<'_>,
    deadline: &RequestDeadline,
    call_timeout: Duration,
) -> Result<Generation, DispatchError> {
    if deadline.is_expired() {
        return Err(DispatchError::Timeout(deadline.elapsed_ms()));
    }
    let call = tokio::time::timeout(call_timeout, backend.generate(req, deadline.cancel_signal()));
    tokio::select! {
        biased;
        _ = deadline.expired() => Err(DispatchError::Timeout(deadline.elapsed_ms())),
        result = call => match result {
            Err(_) => {
                tracing::warn!(
                    provider = backend.provider(),
                    timeout_ms = call_timeout.as_millis() as u64,
                    "backend call timed out"
                );
                Err(DispatchError::Timeout(call_timeout.as_millis() as u64))
            }
            Ok(Err(DispatchError::Cancelled)) if deadline.is_expired() => {
                Err(DispatchError::Timeout(deadline.elapsed_ms()))
            }
            Ok(other) => other,
        },
    }
}
