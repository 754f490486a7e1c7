use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as emitted by the model.
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Role::Tool` messages: the invocation this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Ordered message history for one tool-loop invocation.
///
/// Owned by a single loop; never shared across requests.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
}

impl ConversationState {
    pub fn new(system_prompt: &str, user_message: &str) -> Self {
        Self {
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_message),
            ],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Tool-call ids from the most recent assistant message that have no
    /// matching tool-result yet.
    pub fn unanswered_tool_calls(&self) -> Vec<&str> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        else {
            return Vec::new();
        };
        let answered: HashSet<&str> = self.messages[pos + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        self.messages[pos]
            .tool_calls
            .iter()
            .map(|c| c.id.as_str())
            .filter(|id| !answered.contains(id))
            .collect()
    }

    /// True when every assistant tool call in the history has exactly one
    /// result before the next assistant message.
    pub fn is_consistent(&self) -> bool {
        let mut open: Option<Vec<&str>> = None;
        for msg in &self.messages {
            match msg.role {
                Role::Assistant => {
                    if open.as_ref().is_some_and(|ids| !ids.is_empty()) {
                        return false;
                    }
                    open = Some(msg.tool_calls.iter().map(|c| c.id.as_str()).collect());
                }
                Role::Tool => {
                    let Some(ids) = open.as_mut() else {
                        return false;
                    };
                    let Some(id) = msg.tool_call_id.as_deref() else {
                        return false;
                    };
                    match ids.iter().position(|pending| *pending == id) {
                        Some(i) => {
                            ids.swap_remove(i);
                        }
                        None => return false,
                    }
                }
                Role::System | Role::User => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "search_documents".to_string(),
            arguments: serde_json::json!({"query": "q"}),
        }
    }

    #[test]
    fn tracks_unanswered_calls() {
        let mut conv = ConversationState::new("sys", "hi");
        conv.push(ChatMessage::assistant_with_tools("", vec![call("a"), call("b")]));
        assert_eq!(conv.unanswered_tool_calls(), vec!["a", "b"]);
        conv.push(ChatMessage::tool_result("b", "{}"));
        assert_eq!(conv.unanswered_tool_calls(), vec!["a"]);
        conv.push(ChatMessage::tool_result("a", "{}"));
        assert!(conv.unanswered_tool_calls().is_empty());
        assert!(conv.is_consistent());
    }

    #[test]
    fn duplicate_result_is_inconsistent() {
        let mut conv = ConversationState::new("sys", "hi");
        conv.push(ChatMessage::assistant_with_tools("", vec![call("a")]));
        conv.push(ChatMessage::tool_result("a", "{}"));
        conv.push(ChatMessage::tool_result("a", "{}"));
        assert!(!conv.is_consistent());
    }

    #[test]
    fn assistant_before_results_is_inconsistent() {
        let mut conv = ConversationState::new("sys", "hi");
        conv.push(ChatMessage::assistant_with_tools("", vec![call("a")]));
        conv.push(ChatMessage::assistant("answer"));
        assert!(!conv.is_consistent());
    }
}
