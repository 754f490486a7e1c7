//! Bounded multi-turn loop in which the model may call tools before answering.
//!
//! Each iteration asks the backend for the next assistant turn. Tool requests
//! are executed concurrently and every requested id gets exactly one result
//! message before the backend is called again. When the iteration budget is
//! spent, one final call with tools omitted forces a text answer, so a run
//! makes at most `max_iterations + 1` backend calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id as TaskId, JoinSet};

use crate::config::DispatchSettings;
use crate::conversation::{ChatMessage, ConversationState, ToolCall};
use crate::deadline::RequestDeadline;
use crate::dispatch::{Backend, GenerateRequest, Generation, ToolChoice, generate_within};
use crate::error::DispatchError;
use crate::tools::{ToolExecutor, ToolInvocation, error_result, truncate_result};

/// Returned when the model produces no text even after being told to answer.
pub const EMPTY_ANSWER_FALLBACK: &str =
    "I was unable to produce an answer from the available information.";

const ANSWER_DIRECTLY: &str = "Answer the question directly using the information gathered so far. \
     Do not call any more tools.";

/// Tool-choice policy for one loop run.
#[derive(Debug, Clone, Default)]
pub struct ToolChoicePolicy {
    pub tools_enabled: bool,
    /// Force a tool call on the first iteration.
    pub forced: bool,
    pub pinned: Option<String>,
}

impl ToolChoicePolicy {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            tools_enabled: settings.tools_enabled,
            forced: settings.force_tool_use,
            pinned: settings.pinned_tool.clone(),
        }
    }

    /// Choice for 1-based `iteration`. Forcing (required or pinned) applies
    /// to the first iteration only; later iterations relax to `Auto` so the
    /// model can finish with text.
    pub fn choice_for(&self, iteration: usize) -> ToolChoice {
        if !self.tools_enabled {
            return ToolChoice::None;
        }
        if iteration > 1 {
            return ToolChoice::Auto;
        }
        match (&self.pinned, self.forced) {
            (Some(name), _) => ToolChoice::Pinned(name.clone()),
            (None, true) => ToolChoice::Required,
            (None, false) => ToolChoice::Auto,
        }
    }
}

#[derive(Debug)]
pub struct LoopOutcome {
    pub text: String,
    pub backend_calls: usize,
    pub tool_invocations: usize,
    /// True when the iteration budget ran out before a text answer.
    pub exhausted: bool,
    pub conversation: ConversationState,
}

pub struct ToolLoopEngine {
    executor: Arc<dyn ToolExecutor>,
    policy: ToolChoicePolicy,
    max_iterations: usize,
    max_result_chars: usize,
    call_timeout: Duration,
}

impl ToolLoopEngine {
    pub fn new(executor: Arc<dyn ToolExecutor>, settings: &DispatchSettings) -> Self {
        Self {
            executor,
            policy: ToolChoicePolicy::from_settings(settings),
            max_iterations: settings.max_tool_iterations,
            max_result_chars: settings.max_tool_result_chars,
            call_timeout: settings.call_timeout(),
        }
    }

    pub fn with_policy(mut self, policy: ToolChoicePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Drive the loop to a text answer. Backend failures and deadline expiry
    /// propagate; tool failures never do.
    pub async fn run(
        &self,
        backend: &dyn Backend,
        system_prompt: &str,
        user_message: &str,
        deadline: &RequestDeadline,
    ) -> Result<LoopOutcome, DispatchError> {
        let catalog = self.executor.catalog();
        let mut conversation = ConversationState::new(system_prompt, user_message);
        let mut backend_calls = 0;
        let mut tool_invocations = 0;

        for iteration in 1..=self.max_iterations {
            let choice = self.policy.choice_for(iteration);
            let tools = (choice != ToolChoice::None && !catalog.is_empty())
                .then_some(catalog.as_slice());
            let req = GenerateRequest {
                messages: conversation.messages(),
                tools,
                tool_choice: tools.map(|_| choice),
            };
            let generation = generate_within(backend, req, deadline, self.call_timeout).await?;
            backend_calls += 1;

            if !generation.requests_tools() {
                let (text, extra_calls) = self
                    .finish_with_text(backend, &mut conversation, generation, deadline)
                    .await?;
                return Ok(LoopOutcome {
                    text,
                    backend_calls: backend_calls + extra_calls,
                    tool_invocations,
                    exhausted: false,
                    conversation,
                });
            }

            let calls = dedupe_calls(generation.tool_calls);
            tracing::debug!(
                provider = backend.provider(),
                iteration,
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "model requested tools"
            );
            tool_invocations += calls.len();
            conversation.push(ChatMessage::assistant_with_tools(
                generation.text,
                calls.clone(),
            ));

            let results = self.execute_all(&calls, deadline).await?;
            for (id, content) in results {
                conversation.push(ChatMessage::tool_result(id, content));
            }
            debug_assert!(conversation.unanswered_tool_calls().is_empty());
        }

        tracing::warn!(
            provider = backend.provider(),
            max_iterations = self.max_iterations,
            "tool loop exhausted, requesting text-only answer"
        );
        let generation = generate_within(
            backend,
            GenerateRequest::text_only(conversation.messages()),
            deadline,
            self.call_timeout,
        )
        .await?;
        backend_calls += 1;
        let text = non_empty_or_fallback(generation.text);
        Ok(LoopOutcome {
            text,
            backend_calls,
            tool_invocations,
            exhausted: true,
            conversation,
        })
    }

    /// Terminal path for a turn without tool requests. Empty text gets one
    /// corrective follow-up. Returns the answer and the extra calls made.
    async fn finish_with_text(
        &self,
        backend: &dyn Backend,
        conversation: &mut ConversationState,
        generation: Generation,
        deadline: &RequestDeadline,
    ) -> Result<(String, usize), DispatchError> {
        if !generation.text.trim().is_empty() {
            conversation.push(ChatMessage::assistant(generation.text.clone()));
            return Ok((generation.text, 0));
        }

        tracing::debug!(
            provider = backend.provider(),
            "empty answer, asking model to answer directly"
        );
        conversation.push(ChatMessage::user(ANSWER_DIRECTLY));
        let retry = generate_within(
            backend,
            GenerateRequest::text_only(conversation.messages()),
            deadline,
            self.call_timeout,
        )
        .await?;
        let text = non_empty_or_fallback(retry.text);
        conversation.push(ChatMessage::assistant(text.clone()));
        Ok((text, 1))
    }

    /// Run every call concurrently. Each call yields exactly one result,
    /// in request order; failures become error results. Tools still running
    /// when this future is dropped or the deadline fires are aborted.
    async fn execute_all(
        &self,
        calls: &[ToolCall],
        deadline: &RequestDeadline,
    ) -> Result<Vec<(String, String)>, DispatchError> {
        let mut set = JoinSet::new();
        let mut task_index: HashMap<TaskId, usize> = HashMap::new();
        for (index, call) in calls.iter().enumerate() {
            let executor = self.executor.clone();
            let parsed = ToolInvocation::parse(call);
            let handle = set.spawn(async move {
                let content = match parsed {
                    Ok(invocation) => executor.execute(&invocation).await,
                    Err(e) => {
                        tracing::debug!("rejecting tool call: {e}");
                        error_result(&e.to_string())
                    }
                };
                (index, content)
            });
            task_index.insert(handle.id(), index);
        }

        let mut results: Vec<Option<String>> = vec![None; calls.len()];
        loop {
            let joined = tokio::select! {
                biased;
                // Returning drops the set, which aborts the remaining tools.
                _ = deadline.expired() => {
                    return Err(DispatchError::Timeout(deadline.elapsed_ms()));
                }
                joined = set.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok((index, content))) => results[index] = Some(content),
                Some(Err(join_err)) => {
                    let tool = task_index
                        .get(&join_err.id())
                        .map_or("unknown", |&i| calls[i].name.as_str());
                    tracing::error!(tool, "tool task failed: {join_err}");
                }
            }
        }

        Ok(calls
            .iter()
            .zip(results)
            .map(|(call, content)| {
                let content = content.unwrap_or_else(|| {
                    error_result(&format!("tool {} failed unexpectedly", call.name))
                });
                (call.id.clone(), truncate_result(content, self.max_result_chars))
            })
            .collect())
    }
}

/// One call per id; later duplicates are dropped.
fn dedupe_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect()
}

fn non_empty_or_fallback(text: String) -> String {
    if text.trim().is_empty() {
        EMPTY_ANSWER_FALLBACK.to_string()
    } else {
        text
    }
}
