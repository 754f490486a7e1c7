//! Scripted in-process backends and tool executors shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tandem::conversation::{ChatMessage, Role, ToolCall};
use tandem::deadline::RequestDeadline;
use tandem::dispatch::{Backend, GenerateRequest, Generation, TokenStream, ToolChoice};
use tandem::error::DispatchError;
use tandem::sanitizer::{PromptSanitizer, RiskAssessment, RiskLevel};
use tandem::tools::{ToolExecutor, ToolInvocation, success_result};

/// One step of a scripted token stream.
#[derive(Clone)]
pub enum Step {
    Wait(Duration),
    Token(&'static str),
    Fail(&'static str),
    /// Expire the deadline, then carry on with the script.
    Expire(RequestDeadline),
    /// Block until the call's signal is cancelled.
    Hang,
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Scripted reply for a non-streaming call.
#[derive(Clone)]
pub enum Reply {
    Text(String),
    Tools(Vec<ToolCall>),
    Fail(String),
    /// `"{provider}:{last user message}"`.
    Echo,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub offered_tools: usize,
    pub tool_choice: Option<ToolChoice>,
}

pub struct ScriptedBackend {
    name: String,
    stream_steps: Vec<Step>,
    open_delay: Duration,
    open_error: Option<String>,
    replies: Mutex<VecDeque<Reply>>,
    default_reply: Reply,
    reply_delay: Duration,
    fail_when_contains: Option<String>,
    pub generate_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub recorded: Mutex<Vec<RecordedCall>>,
    /// Set when a token stream handed out by this backend is dropped.
    pub stream_dropped: Arc<AtomicBool>,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stream_steps: Vec::new(),
            open_delay: Duration::ZERO,
            open_error: None,
            replies: Mutex::new(VecDeque::new()),
            default_reply: Reply::Echo,
            reply_delay: Duration::ZERO,
            fail_when_contains: None,
            generate_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn streaming(mut self, steps: Vec<Step>) -> Self {
        self.stream_steps = steps;
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn open_error(mut self, message: &str) -> Self {
        self.open_error = Some(message.to_string());
        self
    }

    /// Replies consumed in call order before falling back to the default.
    pub fn replies(self, replies: Vec<Reply>) -> Self {
        *self.replies.lock().unwrap() = replies.into();
        self
    }

    pub fn default_reply(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    pub fn reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn fail_when_contains(mut self, needle: &str) -> Self {
        self.fail_when_contains = Some(needle.to_string());
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn generate_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn stream_count(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.recorded.lock().unwrap().clone()
    }
}

fn last_user(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        req: GenerateRequest<'_>,
        signal: CancellationToken,
    ) -> Result<Generation, DispatchError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().unwrap().push(RecordedCall {
            messages: req.messages.to_vec(),
            offered_tools: req.tools.map_or(0, |t| t.len()),
            tool_choice: req.tool_choice.clone(),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());

        tokio::select! {
            _ = signal.cancelled() => return Err(DispatchError::Cancelled),
            _ = tokio::time::sleep(self.reply_delay) => {}
        }

        let user = last_user(req.messages);
        if let Some(needle) = &self.fail_when_contains
            && user.contains(needle.as_str())
        {
            return Err(DispatchError::backend(&self.name, "scripted failure"));
        }
        match reply {
            Reply::Text(text) => Ok(Generation::text(text)),
            Reply::Tools(calls) => Ok(Generation::tool_calls(calls)),
            Reply::Fail(message) => Err(DispatchError::backend(&self.name, message)),
            Reply::Echo => Ok(Generation::text(format!("{}:{user}", self.name))),
        }
    }

    async fn generate_stream(
        &self,
        _messages: &[ChatMessage],
        signal: CancellationToken,
    ) -> Result<TokenStream, DispatchError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = signal.cancelled() => return Err(DispatchError::Cancelled),
            _ = tokio::time::sleep(self.open_delay) => {}
        }
        if let Some(message) = &self.open_error {
            return Err(DispatchError::backend(&self.name, message.clone()));
        }

        let name = self.name.clone();
        let guard = DropFlag(self.stream_dropped.clone());
        let state = (self.stream_steps.clone().into_iter(), signal, guard);
        let tokens = futures_util::stream::unfold(Some(state), move |state| {
            let name = name.clone();
            async move {
                let (mut steps, signal, guard) = state?;
                loop {
                    match steps.next()? {
                        Step::Wait(delay) => {
                            tokio::select! {
                                _ = signal.cancelled() => {
                                    return Some((Err(DispatchError::Cancelled), None));
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        Step::Token(token) => {
                            return Some((Ok(token.to_string()), Some((steps, signal, guard))));
                        }
                        Step::Fail(message) => {
                            return Some((Err(DispatchError::backend(&name, message)), None));
                        }
                        Step::Expire(deadline) => deadline.expire_now(),
                        Step::Hang => {
                            signal.cancelled().await;
                            return Some((Err(DispatchError::Cancelled), None));
                        }
                    }
                }
            }
        });
        Ok(Box::pin(tokens))
    }
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// Executor that answers every invocation with its own name and records
/// what it ran. `panic_on` makes one tool name panic mid-execution.
pub struct RecordingExecutor {
    pub executed: Mutex<Vec<String>>,
    /// Invocations that got past their delay.
    pub finished: AtomicUsize,
    delay: Duration,
    panic_on: Option<String>,
    payload_len: usize,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
            delay: Duration::ZERO,
            panic_on: None,
            payload_len: 0,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panic_on(mut self, tool: &str) -> Self {
        self.panic_on = Some(tool.to_string());
        self
    }

    /// Pad every result with this many filler characters.
    pub fn payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute(&self, invocation: &ToolInvocation) -> String {
        self.executed
            .lock()
            .unwrap()
            .push(invocation.name().to_string());
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        if self.panic_on.as_deref() == Some(invocation.name()) {
            panic!("tool blew up");
        }
        let detail = match invocation {
            ToolInvocation::SearchDocuments(args) => json!({"query": args.query}),
            ToolInvocation::FetchUrl(args) => json!({"url": args.url}),
            ToolInvocation::RunCommand(args) => json!({"command": args.command}),
            ToolInvocation::Unknown { name, .. } => json!({"unknown": name}),
        };
        success_result(json!({
            "tool": invocation.name(),
            "detail": detail,
            "padding": "x".repeat(self.payload_len),
        }))
    }
}

/// Flags text containing "ignore previous" and rewrites it to a marker.
pub struct KeywordSanitizer;

impl PromptSanitizer for KeywordSanitizer {
    fn score(&self, text: &str) -> RiskAssessment {
        if text.to_lowercase().contains("ignore previous") {
            RiskAssessment {
                risk_level: RiskLevel::High,
                risk_score: 0.9,
                detected_patterns: vec!["instruction_override".into()],
            }
        } else {
            RiskAssessment::benign()
        }
    }

    fn rewrite(&self, _text: &str, strict: bool) -> String {
        if strict {
            "[removed:strict]".into()
        } else {
            "[removed]".into()
        }
    }
}
