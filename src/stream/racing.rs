//! Two-backend racing for a single streamed answer.
//!
//! Both backends stream into private buffers through one event channel; a
//! single arbiter task consumes the channel in arrival order and owns the
//! [`RaceOutcome`], so exactly one winner can ever be chosen. The first
//! non-empty token seen before the deadline wins; only the winner's tokens
//! reach the consumer.
//!
//! Deadline expiry with no winner walks the fallback chain:
//! primary buffer, then one synchronous primary call, then a timeout error.
//! Expiry after a winner was chosen keeps the forwarded partial answer.
//! A lane whose stream fails to open, or stalls between tokens, for longer
//! than the per-call timeout counts as failed.
//!
//! Tool-enabled coordinators do not race: a tool loop runs non-streaming
//! calls against one backend, so every question goes through
//! [`StreamCoordinator::stream_on`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchSettings;
use crate::conversation::ChatMessage;
use crate::deadline::RequestDeadline;
use crate::dispatch::pool::{BackendSlot, ProviderPool};
use crate::dispatch::{Backend, GenerateRequest};
use crate::error::DispatchError;
use crate::sanitizer::PromptSanitizer;
use crate::tools::ToolExecutor;
use crate::stream::{AnswerStream, StreamCoordinator, StreamSession};

/// How a race ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceResolution {
    /// Winner streamed to completion.
    Completed,
    /// Deadline hit after a winner started streaming; partial answer kept.
    WinnerPartial,
    /// Winner's backend failed mid-stream.
    WinnerFailed,
    /// No winner; primary's private buffer used as the answer.
    PrimaryBuffer,
    /// No winner and empty primary buffer; synchronous primary call answered.
    SyncPrimary,
    /// Every tier failed; stream closed with an error.
    Exhausted,
    /// Consumer dropped the stream.
    Abandoned,
}

/// Per-race record. Lives only as long as one racing stream.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub winner: Option<BackendSlot>,
    pub winner_latency: Option<Duration>,
    pub primary_buffer: String,
    pub secondary_buffer: String,
    pub resolution: RaceResolution,
}

impl RaceOutcome {
    fn new() -> Self {
        Self {
            winner: None,
            winner_latency: None,
            primary_buffer: String::new(),
            secondary_buffer: String::new(),
            resolution: RaceResolution::Abandoned,
        }
    }

    fn buffer_mut(&mut self, slot: BackendSlot) -> &mut String {
        match slot {
            BackendSlot::Primary => &mut self.primary_buffer,
            BackendSlot::Secondary => &mut self.secondary_buffer,
        }
    }
}

enum RaceEvent {
    Token(BackendSlot, String),
    Finished(BackendSlot),
    Failed(BackendSlot, DispatchError),
}

/// Racing and batch streaming on top of [`StreamCoordinator`].
#[derive(Clone)]
pub struct RacingStreamCoordinator {
    base: StreamCoordinator,
}

impl RacingStreamCoordinator {
    pub fn new(
        pool: ProviderPool,
        sanitizer: Arc<dyn PromptSanitizer>,
        settings: &DispatchSettings,
    ) -> Self {
        Self {
            base: StreamCoordinator::new(pool, sanitizer, settings),
        }
    }

    /// See [`StreamCoordinator::with_tools`]. Racing is off while tools are on.
    pub fn with_tools(mut self, executor: Arc<dyn ToolExecutor>, settings: &DispatchSettings) -> Self {
        self.base = self.base.with_tools(executor, settings);
        self
    }

    pub fn single(&self) -> &StreamCoordinator {
        &self.base
    }

    pub fn racing_enabled(&self) -> bool {
        self.base.pool().racing_enabled() && !self.base.tools_enabled()
    }

    /// Race both backends for one answer.
    pub fn stream_racing(
        &self,
        system_prompt: &str,
        user_message: &str,
        deadline: &RequestDeadline,
    ) -> AnswerStream {
        if self.base.tools_enabled() {
            return self.base.stream_one(system_prompt, user_message, deadline);
        }
        let (stream, _outcome) =
            self.stream_racing_observed(0, system_prompt, user_message, deadline);
        stream
    }

    /// Like [`stream_racing`](Self::stream_racing), also returning a handle
    /// that resolves to the race record once the stream has closed. Always
    /// races, whether or not tools are enabled.
    pub fn stream_racing_observed(
        &self,
        question_index: usize,
        system_prompt: &str,
        user_message: &str,
        deadline: &RequestDeadline,
    ) -> (AnswerStream, JoinHandle<RaceOutcome>) {
        let messages = Arc::new(self.base.prepare(system_prompt, user_message));
        let (session, stream) =
            StreamSession::open(question_index, user_message, self.base.flush_threshold());
        let pool = self.base.pool();
        let race = Race {
            primary: pool.primary().clone(),
            // Without a secondary both lanes hit primary; callers gate on
            // racing_enabled().
            secondary: pool.backend(BackendSlot::Secondary).clone(),
            messages,
            deadline: deadline.clone(),
            call_timeout: self.base.call_timeout(),
        };
        let handle = tokio::spawn(race.run(session));
        (stream, handle)
    }

    /// Stream every question of a batch. Output index `i` answers input `i`.
    ///
    /// Racing enabled: each question is raced on both backends. Otherwise the
    /// batch is split across the pool, each question on one backend, all
    /// started concurrently.
    pub fn stream_batch_distributed(
        &self,
        pairs: &[(String, String)],
        deadline: &RequestDeadline,
    ) -> Vec<AnswerStream> {
        if self.racing_enabled() {
            tracing::info!(
                request_id = deadline.id(),
                total = pairs.len(),
                "streaming batch with racing"
            );
            return pairs
                .iter()
                .enumerate()
                .map(|(i, (system, user))| self.stream_racing_observed(i, system, user, deadline).0)
                .collect();
        }

        let slots = self.base.pool().assign_batch(pairs.len());
        tracing::info!(
            request_id = deadline.id(),
            total = pairs.len(),
            secondary = slots.iter().filter(|s| **s == BackendSlot::Secondary).count(),
            "streaming batch distributed across backends"
        );
        pairs
            .iter()
            .zip(slots)
            .enumerate()
            .map(|(i, ((system, user), slot))| self.base.stream_on(slot, i, system, user, deadline))
            .collect()
    }
}

struct Race {
    primary: Arc<dyn Backend>,
    secondary: Arc<dyn Backend>,
    messages: Arc<Vec<ChatMessage>>,
    deadline: RequestDeadline,
    /// Bounds each lane's open and token gaps, and the whole synchronous
    /// fallback call, which runs after the request deadline has expired.
    call_timeout: Duration,
}

impl Race {
    async fn run(self, mut session: StreamSession) -> RaceOutcome {
        let started = Instant::now();
        let consumer = session.consumer_gone();
        let lanes = self.deadline.cancel_signal();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let pumps = [
            tokio::spawn(pump(
                BackendSlot::Primary,
                self.primary.clone(),
                self.messages.clone(),
                lanes.child_token(),
                self.call_timeout,
                tx.clone(),
            )),
            tokio::spawn(pump(
                BackendSlot::Secondary,
                self.secondary.clone(),
                self.messages.clone(),
                lanes.child_token(),
                self.call_timeout,
                tx,
            )),
        ];

        let mut outcome = RaceOutcome::new();
        let mut settled = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = consumer.cancelled() => {
                    outcome.resolution = RaceResolution::Abandoned;
                    break;
                }
                _ = self.deadline.expired() => {
                    if outcome.winner.is_some() {
                        tracing::info!(
                            request_id = self.deadline.id(),
                            "deadline hit mid-stream, keeping winner's partial answer"
                        );
                        session.complete().await;
                        outcome.resolution = RaceResolution::WinnerPartial;
                    } else {
                        // Tokens that landed in the same tick still count
                        // toward the private buffers.
                        while let Ok(event) = rx.try_recv() {
                            if let RaceEvent::Token(slot, token) = event {
                                outcome.buffer_mut(slot).push_str(&token);
                            }
                        }
                        self.fall_back(&mut outcome, &mut session, &consumer).await;
                    }
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        // Both lanes gone without settling.
                        self.fall_back(&mut outcome, &mut session, &consumer).await;
                        break;
                    };
                    match event {
                        RaceEvent::Token(slot, token) => {
                            outcome.buffer_mut(slot).push_str(&token);
                            match outcome.winner {
                                None if !token.is_empty() && !self.deadline.is_expired() => {
                                    let latency = started.elapsed();
                                    tracing::info!(
                                        request_id = self.deadline.id(),
                                        winner = slot.as_str(),
                                        latency_ms = latency.as_millis() as u64,
                                        "race winner selected"
                                    );
                                    outcome.winner = Some(slot);
                                    outcome.winner_latency = Some(latency);
                                    // Forward everything the winner produced so far.
                                    let so_far = outcome.buffer_mut(slot).clone();
                                    session.append(&so_far);
                                    if !session.flush_if_ready().await {
                                        outcome.resolution = RaceResolution::Abandoned;
                                        break;
                                    }
                                }
                                Some(winner) if winner == slot => {
                                    session.append(&token);
                                    if !session.flush_if_ready().await {
                                        outcome.resolution = RaceResolution::Abandoned;
                                        break;
                                    }
                                }
                                _ => {}
                            }
                        }
                        RaceEvent::Finished(slot) if outcome.winner == Some(slot) => {
                            session.complete().await;
                            outcome.resolution = RaceResolution::Completed;
                            break;
                        }
                        RaceEvent::Failed(slot, err) if outcome.winner == Some(slot) => {
                            session.fail(err).await;
                            outcome.resolution = RaceResolution::WinnerFailed;
                            break;
                        }
                        RaceEvent::Finished(slot) => {
                            tracing::debug!(lane = slot.as_str(), "lane finished without winning");
                            settled += 1;
                        }
                        RaceEvent::Failed(slot, err) => {
                            tracing::warn!(lane = slot.as_str(), "racing lane failed: {err}");
                            settled += 1;
                        }
                    }
                    if settled == 2 && outcome.winner.is_none() {
                        self.fall_back(&mut outcome, &mut session, &consumer).await;
                        break;
                    }
                }
            }
        }

        lanes.cancel();
        for pump in pumps {
            pump.abort();
        }
        outcome
    }

    /// Tiers 2-4: primary buffer, synchronous primary call, error.
    async fn fall_back(
        &self,
        outcome: &mut RaceOutcome,
        session: &mut StreamSession,
        consumer: &CancellationToken,
    ) {
        if !outcome.primary_buffer.is_empty() {
            tracing::info!(
                request_id = self.deadline.id(),
                chars = outcome.primary_buffer.len(),
                "no race winner, using primary buffer"
            );
            session.append(&outcome.primary_buffer);
            session.complete().await;
            outcome.resolution = RaceResolution::PrimaryBuffer;
            return;
        }

        tracing::info!(
            request_id = self.deadline.id(),
            "no race winner and empty primary buffer, calling primary synchronously"
        );
        // The request deadline may already be spent; this call gets its own budget.
        let signal = CancellationToken::new();
        let call = self.primary.generate(
            GenerateRequest::text_only(&self.messages),
            signal.clone(),
        );
        let result = tokio::select! {
            _ = consumer.cancelled() => {
                signal.cancel();
                outcome.resolution = RaceResolution::Abandoned;
                return;
            }
            r = tokio::time::timeout(self.call_timeout, call) => r,
        };
        signal.cancel();

        match result {
            Ok(Ok(generation)) if !generation.text.trim().is_empty() => {
                session.append(&generation.text);
                session.complete().await;
                outcome.resolution = RaceResolution::SyncPrimary;
            }
            other => {
                let err = match other {
                    Ok(Err(e)) if !self.deadline.is_expired() => e,
                    Ok(Err(e)) => {
                        tracing::warn!("synchronous fallback failed: {e}");
                        DispatchError::Timeout(self.deadline.elapsed_ms())
                    }
                    _ => DispatchError::Timeout(self.deadline.elapsed_ms()),
                };
                session.fail(err).await;
                outcome.resolution = RaceResolution::Exhausted;
            }
        }
    }
}

/// Drain one backend's stream into the race channel. Opening the stream and
/// each wait for the next token are bounded by `call_timeout`.
async fn pump(
    slot: BackendSlot,
    backend: Arc<dyn Backend>,
    messages: Arc<Vec<ChatMessage>>,
    signal: CancellationToken,
    call_timeout: Duration,
    tx: mpsc::UnboundedSender<RaceEvent>,
) {
    let stalled = || {
        tracing::warn!(
            lane = slot.as_str(),
            provider = backend.provider(),
            timeout_ms = call_timeout.as_millis() as u64,
            "racing lane stalled"
        );
        RaceEvent::Failed(slot, DispatchError::Timeout(call_timeout.as_millis() as u64))
    };
    let opened = tokio::time::timeout(call_timeout, backend.generate_stream(&messages, signal)).await;
    let mut tokens = match opened {
        Ok(Ok(tokens)) => tokens,
        Ok(Err(e)) => {
            let _ = tx.send(RaceEvent::Failed(slot, e));
            return;
        }
        Err(_) => {
            let _ = tx.send(stalled());
            return;
        }
    };
    loop {
        let event = match tokio::time::timeout(call_timeout, tokens.next()).await {
            Ok(Some(Ok(token))) => RaceEvent::Token(slot, token),
            Ok(Some(Err(e))) => {
                let _ = tx.send(RaceEvent::Failed(slot, e));
                return;
            }
            Ok(None) => break,
            Err(_) => {
                let _ = tx.send(stalled());
                return;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
    let _ = tx.send(RaceEvent::Finished(slot));
}
