//! Incremental answer delivery.
//!
//! A producer task owns one [`StreamSession`] and pushes buffered text to the
//! consumer's [`AnswerStream`] whenever the buffer reaches the flush
//! threshold. The producer selects on the request deadline, so expiry
//! force-completes the session within one scheduling tick whether or not the
//! backend call has actually stopped. Opening the backend stream and every
//! gap between two tokens is also bounded by the per-call timeout.
//!
//! With tools enabled the answer comes from the tool loop instead of a
//! backend stream, and is pushed through the same session once it is known.

pub mod racing;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::DispatchSettings;
use crate::conversation::ChatMessage;
use crate::deadline::RequestDeadline;
use crate::dispatch::pool::{BackendSlot, ProviderPool};
use crate::dispatch::{Backend, prompt_messages};
use crate::error::DispatchError;
use crate::sanitizer::{PromptSanitizer, SanitizePolicy};
use crate::tool_loop::ToolLoopEngine;
use crate::tools::ToolExecutor;

pub use racing::{RaceOutcome, RaceResolution, RacingStreamCoordinator};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

const CHANNEL_CAPACITY: usize = 32;

type StreamItem = Result<String, DispatchError>;

/// Consumer side of a streamed answer: text chunks, then at most one
/// terminal error. Dropping it tears down the producer and its backend call.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamItem>,
    _teardown: DropGuard,
}

impl AnswerStream {
    /// Drain the stream into one string, or the terminal error.
    pub async fn collect_text(mut self) -> Result<String, DispatchError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?);
        }
        Ok(text)
    }
}

impl Stream for AnswerStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub started_at: Instant,
    pub question_index: usize,
    pub question_text: String,
}

/// Producer side of one streamed answer. Owned by exactly one task.
///
/// Once complete, appends are rejected and the channel has been closed;
/// the buffer is always flushed before closing.
pub struct StreamSession {
    id: u64,
    buffer: String,
    is_complete: bool,
    terminal_error: Option<String>,
    metadata: SessionMetadata,
    flush_threshold: usize,
    emitted_bytes: usize,
    tx: Option<mpsc::Sender<StreamItem>>,
    consumer: CancellationToken,
}

impl StreamSession {
    /// Open a session and the matching consumer stream.
    pub fn open(
        question_index: usize,
        question_text: &str,
        flush_threshold: usize,
    ) -> (Self, AnswerStream) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let consumer = CancellationToken::new();
        let session = Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            buffer: String::new(),
            is_complete: false,
            terminal_error: None,
            metadata: SessionMetadata {
                started_at: Instant::now(),
                question_index,
                question_text: question_text.to_string(),
            },
            flush_threshold,
            emitted_bytes: 0,
            tx: Some(tx),
            consumer: consumer.clone(),
        };
        let stream = AnswerStream {
            rx,
            _teardown: consumer.drop_guard(),
        };
        (session, stream)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn terminal_error(&self) -> Option<&str> {
        self.terminal_error.as_deref()
    }

    /// Cancelled when the consumer drops its stream.
    pub fn consumer_gone(&self) -> CancellationToken {
        self.consumer.clone()
    }

    /// Whether any text has been produced, flushed or not.
    pub fn has_output(&self) -> bool {
        self.emitted_bytes > 0 || !self.buffer.is_empty()
    }

    /// Append a token. Returns false once the session is complete.
    pub fn append(&mut self, token: &str) -> bool {
        if self.is_complete {
            return false;
        }
        self.buffer.push_str(token);
        true
    }

    /// Flush when the buffer has reached the threshold. Returns false if the
    /// consumer has gone away.
    pub async fn flush_if_ready(&mut self) -> bool {
        if self.buffer.len() >= self.flush_threshold {
            self.flush().await
        } else {
            true
        }
    }

    /// Push the whole buffer to the consumer. Returns false if the consumer
    /// has gone away.
    pub async fn flush(&mut self) -> bool {
        if self.buffer.is_empty() {
            return true;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        let chunk = std::mem::take(&mut self.buffer);
        self.emitted_bytes += chunk.len();
        tx.send(Ok(chunk)).await.is_ok()
    }

    /// Flush the remainder and close successfully.
    pub async fn complete(&mut self) {
        if self.is_complete {
            return;
        }
        self.flush().await;
        self.close();
    }

    /// Flush whatever was produced, deliver `err` as the terminal item and close.
    pub async fn fail(&mut self, err: DispatchError) {
        if self.is_complete {
            return;
        }
        self.flush().await;
        tracing::warn!(
            session_id = self.id,
            question_index = self.metadata.question_index,
            "stream closed with error: {err}"
        );
        self.terminal_error = Some(err.to_string());
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(err)).await;
        }
        self.close();
    }

    /// Deadline-driven completion: partial output stands as the answer;
    /// with no output at all the stream ends in a timeout error.
    pub async fn force_complete(&mut self, deadline: &RequestDeadline) {
        if self.has_output() {
            tracing::debug!(
                session_id = self.id,
                question_index = self.metadata.question_index,
                "deadline expired, completing with partial output"
            );
            self.complete().await;
        } else {
            self.fail(DispatchError::Timeout(deadline.elapsed_ms())).await;
        }
    }

    fn close(&mut self) {
        self.is_complete = true;
        // Dropping the only sender closes the channel exactly once.
        self.tx = None;
    }
}

/// Streams answers from a single backend per question.
#[derive(Clone)]
pub struct StreamCoordinator {
    pool: ProviderPool,
    sanitizer: Arc<dyn PromptSanitizer>,
    policy: SanitizePolicy,
    flush_threshold: usize,
    call_timeout: Duration,
    tool_loop: Option<Arc<ToolLoopEngine>>,
}

impl StreamCoordinator {
    pub fn new(
        pool: ProviderPool,
        sanitizer: Arc<dyn PromptSanitizer>,
        settings: &DispatchSettings,
    ) -> Self {
        Self {
            pool,
            sanitizer,
            policy: SanitizePolicy::new(settings.risk_threshold),
            flush_threshold: settings.stream_flush_size,
            call_timeout: settings.call_timeout(),
            tool_loop: None,
        }
    }

    /// Answer through the tool loop when tools are enabled. The final text
    /// is streamed once the loop settles.
    pub fn with_tools(mut self, executor: Arc<dyn ToolExecutor>, settings: &DispatchSettings) -> Self {
        if settings.tools_enabled {
            self.tool_loop = Some(Arc::new(ToolLoopEngine::new(executor, settings)));
        }
        self
    }

    pub fn tools_enabled(&self) -> bool {
        self.tool_loop.is_some()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Sanitized two-message prompt.
    pub(crate) fn prepare(&self, system_prompt: &str, user_message: &str) -> Vec<ChatMessage> {
        let (system_prompt, user_message) =
            self.policy
                .apply_pair(self.sanitizer.as_ref(), system_prompt, user_message);
        prompt_messages(&system_prompt, &user_message)
    }

    /// Stream one answer from the primary backend.
    pub fn stream_one(
        &self,
        system_prompt: &str,
        user_message: &str,
        deadline: &RequestDeadline,
    ) -> AnswerStream {
        self.stream_on(BackendSlot::Primary, 0, system_prompt, user_message, deadline)
    }

    /// Stream one answer from a specific backend of the pool.
    pub fn stream_on(
        &self,
        slot: BackendSlot,
        question_index: usize,
        system_prompt: &str,
        user_message: &str,
        deadline: &RequestDeadline,
    ) -> AnswerStream {
        let (session, stream) =
            StreamSession::open(question_index, user_message, self.flush_threshold);
        let backend = self.pool.backend(slot).clone();

        if let Some(engine) = &self.tool_loop {
            let (system_prompt, user_message) =
                self.policy
                    .apply_pair(self.sanitizer.as_ref(), system_prompt, user_message);
            tokio::spawn(run_with_tools(
                engine.clone(),
                backend,
                system_prompt,
                user_message,
                deadline.clone(),
                session,
            ));
            return stream;
        }

        let messages = self.prepare(system_prompt, user_message);
        tokio::spawn(run_single(
            backend,
            messages,
            deadline.clone(),
            self.call_timeout,
            session,
        ));
        stream
    }
}

async fn run_with_tools(
    engine: Arc<ToolLoopEngine>,
    backend: Arc<dyn Backend>,
    system_prompt: String,
    user_message: String,
    deadline: RequestDeadline,
    mut session: StreamSession,
) {
    let consumer = session.consumer_gone();
    let result = tokio::select! {
        biased;
        _ = consumer.cancelled() => return,
        _ = deadline.expired() => Err(DispatchError::Timeout(deadline.elapsed_ms())),
        outcome = engine.run(backend.as_ref(), &system_prompt, &user_message, &deadline) => outcome,
    };
    match result {
        Ok(outcome) => {
            tracing::debug!(
                provider = backend.provider(),
                session_id = session.id(),
                backend_calls = outcome.backend_calls,
                tool_invocations = outcome.tool_invocations,
                exhausted = outcome.exhausted,
                "tool loop finished, streaming answer"
            );
            session.append(&outcome.text);
            if session.flush_if_ready().await {
                session.complete().await;
            }
        }
        Err(_) if deadline.is_expired() => session.force_complete(&deadline).await,
        Err(e) => session.fail(e).await,
    }
}

async fn run_single(
    backend: Arc<dyn Backend>,
    messages: Vec<ChatMessage>,
    deadline: RequestDeadline,
    call_timeout: Duration,
    mut session: StreamSession,
) {
    let consumer = session.consumer_gone();
    let stalled = || DispatchError::Timeout(call_timeout.as_millis() as u64);
    let open = tokio::time::timeout(
        call_timeout,
        backend.generate_stream(&messages, deadline.cancel_signal()),
    );
    let opened = tokio::select! {
        biased;
        _ = consumer.cancelled() => return,
        _ = deadline.expired() => Err(DispatchError::Timeout(deadline.elapsed_ms())),
        opened = open => opened.unwrap_or_else(|_| Err(stalled())),
    };
    let mut tokens = match opened {
        Ok(tokens) => tokens,
        Err(_) if deadline.is_expired() => {
            session.force_complete(&deadline).await;
            return;
        }
        Err(e) => {
            session.fail(e).await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = consumer.cancelled() => {
                tracing::debug!(
                    provider = backend.provider(),
                    session_id = session.id(),
                    "consumer went away, dropping backend stream"
                );
                return;
            }
            _ = deadline.expired() => {
                session.force_complete(&deadline).await;
                return;
            }
            item = tokio::time::timeout(call_timeout, tokens.next()) => match item {
                Err(_) => {
                    tracing::warn!(
                        provider = backend.provider(),
                        session_id = session.id(),
                        timeout_ms = call_timeout.as_millis() as u64,
                        "backend stream stalled"
                    );
                    session.fail(stalled()).await;
                    return;
                }
                Ok(Some(Ok(token))) => {
                    session.append(&token);
                    if deadline.is_expired() {
                        session.force_complete(&deadline).await;
                        return;
                    }
                    if !session.flush_if_ready().await {
                        return;
                    }
                }
                Ok(Some(Err(_))) if deadline.is_expired() => {
                    session.force_complete(&deadline).await;
                    return;
                }
                Ok(Some(Err(e))) => {
                    session.fail(e).await;
                    return;
                }
                Ok(None) => {
                    session.complete().await;
                    return;
                }
            }
        }
    }
}
