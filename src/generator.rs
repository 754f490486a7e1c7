use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::config::DispatchSettings;
use crate::deadline::RequestDeadline;
use crate::dispatch::pool::{BackendSlot, ProviderPool};
use crate::dispatch::{GenerateRequest, generate_within, prompt_messages};
use crate::error::DispatchError;
use crate::sanitizer::{PromptSanitizer, SanitizePolicy};
use crate::tool_loop::ToolLoopEngine;
use crate::tools::ToolExecutor;

/// Placed at the index of a batch item that could not be answered.
pub const BATCH_ITEM_FAILURE: &str = "Error: failed to generate an answer for this question.";

/// One-shot answers, single or batched, without incremental delivery.
///
/// Batches are split across the pool (`ceil(n/2)` to primary, the rest to
/// secondary); both halves run fully in parallel and results come back in
/// input order. A failed item, or a whole failed half, degrades to
/// [`BATCH_ITEM_FAILURE`] instead of failing the batch.
#[derive(Clone)]
pub struct ResponseGenerator {
    pool: ProviderPool,
    sanitizer: Arc<dyn PromptSanitizer>,
    policy: SanitizePolicy,
    tool_loop: Option<Arc<ToolLoopEngine>>,
    call_timeout: Duration,
}

impl ResponseGenerator {
    pub fn new(
        pool: ProviderPool,
        sanitizer: Arc<dyn PromptSanitizer>,
        settings: &DispatchSettings,
    ) -> Self {
        Self {
            pool,
            sanitizer,
            policy: SanitizePolicy::new(settings.risk_threshold),
            tool_loop: None,
            call_timeout: settings.call_timeout(),
        }
    }

    /// Route generation through the tool loop when tools are enabled.
    pub fn with_tools(mut self, executor: Arc<dyn ToolExecutor>, settings: &DispatchSettings) -> Self {
        if settings.tools_enabled {
            self.tool_loop = Some(Arc::new(ToolLoopEngine::new(executor, settings)));
        }
        self
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    pub fn tools_enabled(&self) -> bool {
        self.tool_loop.is_some()
    }

    /// Answer one question on the primary backend.
    pub async fn generate_one(
        &self,
        system_prompt: &str,
        user_message: &str,
        deadline: &RequestDeadline,
    ) -> Result<String, DispatchError> {
        self.generate_on(BackendSlot::Primary, system_prompt, user_message, deadline)
            .await
    }

    /// Answer one question on a specific backend of the pool.
    pub async fn generate_on(
        &self,
        slot: BackendSlot,
        system_prompt: &str,
        user_message: &str,
        deadline: &RequestDeadline,
    ) -> Result<String, DispatchError> {
        let (system_prompt, user_message) =
            self.policy
                .apply_pair(self.sanitizer.as_ref(), system_prompt, user_message);
        let backend = self.pool.backend(slot).as_ref();

        if let Some(engine) = &self.tool_loop {
            let outcome = engine
                .run(backend, &system_prompt, &user_message, deadline)
                .await?;
            tracing::debug!(
                provider = backend.provider(),
                backend_calls = outcome.backend_calls,
                tool_invocations = outcome.tool_invocations,
                exhausted = outcome.exhausted,
                "tool loop finished"
            );
            return Ok(outcome.text);
        }

        let messages = prompt_messages(&system_prompt, &user_message);
        let generation = generate_within(
            backend,
            GenerateRequest::text_only(&messages),
            deadline,
            self.call_timeout,
        )
        .await?;
        if generation.text.trim().is_empty() {
            return Err(DispatchError::backend(
                backend.provider(),
                "returned no content",
            ));
        }
        Ok(generation.text)
    }

    /// Answer every (system prompt, user message) pair. Output index `i`
    /// always answers input index `i`.
    pub async fn generate_batch(
        &self,
        pairs: &[(String, String)],
        deadline: &RequestDeadline,
    ) -> Vec<String> {
        let n = pairs.len();
        let (first, second) = self.pool.split_for_batch(n);
        tracing::info!(
            request_id = deadline.id(),
            total = n,
            primary = first,
            secondary = second,
            "dispatching batch"
        );

        let halves = [
            (BackendSlot::Primary, 0..first),
            (BackendSlot::Secondary, first..n),
        ];
        let mut tasks = Vec::new();
        for (slot, range) in halves {
            if range.is_empty() {
                continue;
            }
            let items: Vec<(usize, String, String)> = range
                .clone()
                .map(|i| (i, pairs[i].0.clone(), pairs[i].1.clone()))
                .collect();
            let this = self.clone();
            let deadline = deadline.clone();
            let handle = tokio::spawn(async move {
                let this = &this;
                let deadline = &deadline;
                join_all(items.into_iter().map(|(index, system, user)| async move {
                    let result = this.generate_on(slot, &system, &user, deadline).await;
                    (index, result)
                }))
                .await
            });
            tasks.push((slot, range, handle));
        }

        let mut answers: Vec<Option<String>> = vec![None; n];
        for (slot, range, handle) in tasks {
            match handle.await {
                Ok(results) => {
                    for (index, result) in results {
                        match result {
                            Ok(text) => answers[index] = Some(text),
                            Err(e) => {
                                tracing::warn!(index, slot = slot.as_str(), "batch item failed: {e}");
                            }
                        }
                    }
                }
                Err(join_err) => {
                    tracing::error!(
                        slot = slot.as_str(),
                        items = range.len(),
                        "batch half failed: {join_err}"
                    );
                }
            }
        }

        answers
            .into_iter()
            .map(|a| a.unwrap_or_else(|| BATCH_ITEM_FAILURE.to_string()))
            .collect()
    }
}
