use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, ProviderKind};
use crate::conversation::{ChatMessage, Role, ToolCall};
use crate::dispatch::{Backend, FinishReason, GenerateRequest, Generation, TokenStream, ToolChoice};
use crate::error::DispatchError;
use crate::tools::ToolSpec;

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// OpenAI-compatible chat-completions backend (direct API or managed
/// deployment).
pub struct HttpBackend {
    client: Client,
    config: ProviderConfig,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    message: String,
}

impl HttpBackend {
    pub fn new(config: ProviderConfig) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        tool_choice: Option<&ToolChoice>,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "messages": wire_messages(messages),
            "stream": stream,
        });
        // Managed deployments select the model by URL and reject the field.
        if self.config.kind == ProviderKind::DirectApi {
            body["model"] = json!(self.config.model);
        }
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(tools.iter().map(wire_tool).collect());
            if let Some(choice) = tool_choice {
                body["tool_choice"] = wire_tool_choice(choice);
            }
        }
        body
    }

    async fn send(
        &self,
        body: &Value,
        signal: &CancellationToken,
    ) -> Result<reqwest::Response, DispatchError> {
        let provider = self.config.name.as_str();
        let mut request = self
            .client
            .post(self.config.endpoint())
            .header("Content-Type", "application/json")
            .json(body);
        request = match self.config.kind {
            ProviderKind::DirectApi => {
                request.header("Authorization", format!("Bearer {}", self.config.api_key))
            }
            ProviderKind::ManagedDeployment { .. } => {
                request.header("api-key", self.config.api_key.as_str())
            }
        };

        let response = tokio::select! {
            _ = signal.cancelled() => return Err(DispatchError::Cancelled),
            r = request.send() => r?,
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DispatchError::RateLimited {
                provider: provider.to_string(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(DispatchError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{status}"),
            });
        }
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            return Err(DispatchError::Backend {
                provider: provider.to_string(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn provider(&self) -> &str {
        &self.config.name
    }

    async fn generate(
        &self,
        req: GenerateRequest<'_>,
        signal: CancellationToken,
    ) -> Result<Generation, DispatchError> {
        let provider = self.config.name.as_str();
        let body = self.request_body(req.messages, req.tools, req.tool_choice.as_ref(), false);
        let response = self.send(&body, &signal).await?;

        let bytes = tokio::select! {
            _ = signal.cancelled() => return Err(DispatchError::Cancelled),
            b = response.bytes() => b.map_err(|e| {
                DispatchError::backend(provider, format!("failed to read response body: {e}"))
            })?,
        };
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(DispatchError::backend(
                provider,
                format!(
                    "response too large: {} bytes (max {})",
                    bytes.len(),
                    MAX_RESPONSE_BYTES
                ),
            ));
        }
        parse_completion(provider, &bytes)
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        signal: CancellationToken,
    ) -> Result<TokenStream, DispatchError> {
        let body = self.request_body(messages, None, None, true);
        let response = self.send(&body, &signal).await?;
        let events = Box::pin(response.bytes_stream().eventsource());
        let provider = self.config.name.clone();

        let tokens = futures_util::stream::unfold(Some((events, signal)), move |state| {
            let provider = provider.clone();
            async move {
                let (mut events, signal) = state?;
                loop {
                    let event = tokio::select! {
                        _ = signal.cancelled() => {
                            return Some((Err(DispatchError::Cancelled), None));
                        }
                        ev = events.next() => ev,
                    };
                    match event {
                        None => return None,
                        Some(Err(e)) => {
                            let err =
                                DispatchError::backend(&provider, format!("stream read failed: {e}"));
                            return Some((Err(err), None));
                        }
                        Some(Ok(event)) => match parse_stream_data(&provider, &event.data) {
                            StreamFrame::Done => return None,
                            StreamFrame::Token(token) => {
                                return Some((Ok(token), Some((events, signal))));
                            }
                            StreamFrame::Skip => continue,
                            StreamFrame::Failed(err) => return Some((Err(err), None)),
                        },
                    }
                }
            }
        });
        Ok(Box::pin(tokens))
    }
}

#[derive(Debug)]
enum StreamFrame {
    Token(String),
    Skip,
    Done,
    Failed(DispatchError),
}

fn parse_stream_data(provider: &str, data: &str) -> StreamFrame {
    let data = data.trim();
    if data == "[DONE]" {
        return StreamFrame::Done;
    }
    if data.is_empty() {
        return StreamFrame::Skip;
    }
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            return StreamFrame::Failed(DispatchError::SchemaParse(format!(
                "{provider} stream chunk: {e}"
            )));
        }
    };
    if let Some(err) = chunk.error {
        return StreamFrame::Failed(DispatchError::backend(provider, err.message));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        StreamFrame::Skip
    } else {
        StreamFrame::Token(text)
    }
}

fn parse_completion(provider: &str, bytes: &[u8]) -> Result<Generation, DispatchError> {
    let completion: ChatCompletion = serde_json::from_slice(bytes)
        .map_err(|e| DispatchError::SchemaParse(format!("failed to parse response: {e}")))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| DispatchError::backend(provider, "empty choices"))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            // Unparseable arguments are kept raw; the tool layer reports them.
            arguments: serde_json::from_str(&tc.function.arguments)
                .unwrap_or(Value::String(tc.function.arguments)),
            name: tc.function.name,
        })
        .collect();

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls" | "function_call") => FinishReason::ToolCalls,
        Some("length" | "content_filter") => FinishReason::Truncated,
        Some("stop") | None if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some("stop") | None => FinishReason::Text,
        Some(_) => FinishReason::Other,
    };

    Ok(Generation {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason,
    })
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Assistant if !m.tool_calls.is_empty() => {
                let content = if m.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(m.content.clone())
                };
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments.to_string()},
                        })
                    })
                    .collect();
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id,
                "content": m.content,
            }),
            role => json!({"role": role.as_str(), "content": m.content}),
        })
        .collect()
}

fn wire_tool(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.json_schema,
        }
    })
}

fn wire_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Pinned(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frames() {
        assert!(matches!(parse_stream_data("p", "[DONE]"), StreamFrame::Done));
        assert!(matches!(
            parse_stream_data("p", r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            StreamFrame::Token(ref t) if t == "Hel"
        ));
        assert!(matches!(
            parse_stream_data("p", r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            StreamFrame::Skip
        ));
        assert!(matches!(
            parse_stream_data("p", r#"{"error":{"message":"overloaded"}}"#),
            StreamFrame::Failed(DispatchError::Backend { .. })
        ));
        assert!(matches!(
            parse_stream_data("p", "not json"),
            StreamFrame::Failed(DispatchError::SchemaParse(_))
        ));
    }

    #[test]
    fn completion_with_tool_calls() {
        let body = br#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"call_1","type":"function","function":{"name":"search_documents","arguments":"{\"query\":\"rust\"}"}},
            {"id":"call_2","type":"function","function":{"name":"fetch_url","arguments":"{broken"}}
        ]},"finish_reason":"tool_calls"}]}"#;
        let generation = parse_completion("p", body).unwrap();
        assert_eq!(generation.finish_reason, FinishReason::ToolCalls);
        assert_eq!(generation.tool_calls.len(), 2);
        assert_eq!(generation.tool_calls[0].arguments["query"], "rust");
        assert_eq!(
            generation.tool_calls[1].arguments,
            Value::String("{broken".to_string())
        );
        assert!(generation.text.is_empty());
    }

    #[test]
    fn completion_finish_reasons() {
        let text = br#"{"choices":[{"message":{"content":"42"},"finish_reason":"stop"}]}"#;
        let generation = parse_completion("p", text).unwrap();
        assert_eq!(generation.text, "42");
        assert_eq!(generation.finish_reason, FinishReason::Text);

        let cut = br#"{"choices":[{"message":{"content":"4"},"finish_reason":"length"}]}"#;
        assert_eq!(
            parse_completion("p", cut).unwrap().finish_reason,
            FinishReason::Truncated
        );

        let empty = br#"{"choices":[]}"#;
        assert!(matches!(
            parse_completion("p", empty),
            Err(DispatchError::Backend { .. })
        ));
    }

    #[test]
    fn wire_format_for_tool_round_trip() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::assistant_with_tools(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "fetch_url".into(),
                    arguments: json!({"url": "https://example.com"}),
                }],
            ),
            ChatMessage::tool_result("c1", r#"{"ok":true}"#),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert!(wire[1]["content"].is_null());
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "fetch_url");
        assert!(wire[1]["tool_calls"][0]["function"]["arguments"].is_string());
        assert_eq!(wire[2]["tool_call_id"], "c1");
        assert_eq!(
            wire_tool_choice(&ToolChoice::Pinned("fetch_url".into()))["function"]["name"],
            "fetch_url"
        );
    }
}
