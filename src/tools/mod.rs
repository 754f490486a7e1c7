pub mod args;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::conversation::ToolCall;
use crate::error::DispatchError;

pub use args::{FetchUrlArgs, RunCommandArgs, SearchDocumentsArgs};

pub const SEARCH_DOCUMENTS: &str = "search_documents";
pub const FETCH_URL: &str = "fetch_url";
pub const RUN_COMMAND: &str = "run_command";

/// One entry of the declared tool catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub json_schema: Value,
}

impl ToolSpec {
    pub fn for_args<T: JsonSchema>(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            json_schema: serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null),
        }
    }
}

/// The built-in catalog: document search, page fetch, command execution.
pub fn default_catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec::for_args::<SearchDocumentsArgs>(
            SEARCH_DOCUMENTS,
            "Search the indexed documents for passages relevant to a query.",
        ),
        ToolSpec::for_args::<FetchUrlArgs>(
            FETCH_URL,
            "Fetch a web page and return its cleaned text content.",
        ),
        ToolSpec::for_args::<RunCommandArgs>(
            RUN_COMMAND,
            "Run a shell command in the sandboxed workspace and return its output.",
        ),
    ]
}

/// A tool call with its arguments decoded into the tool's own type.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    SearchDocuments(SearchDocumentsArgs),
    FetchUrl(FetchUrlArgs),
    RunCommand(RunCommandArgs),
    /// Not in the built-in catalog; executors may still handle it.
    Unknown { name: String, arguments: Value },
}

impl ToolInvocation {
    /// Decode a model-issued call. Fails only when a known tool's arguments
    /// do not match its schema.
    pub fn parse(call: &ToolCall) -> Result<Self, DispatchError> {
        match call.name.as_str() {
            SEARCH_DOCUMENTS => decode(call).map(Self::SearchDocuments),
            FETCH_URL => decode(call).map(Self::FetchUrl),
            RUN_COMMAND => decode(call).map(Self::RunCommand),
            _ => Ok(Self::Unknown {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::SearchDocuments(_) => SEARCH_DOCUMENTS,
            Self::FetchUrl(_) => FETCH_URL,
            Self::RunCommand(_) => RUN_COMMAND,
            Self::Unknown { name, .. } => name,
        }
    }
}

fn decode<T: DeserializeOwned>(call: &ToolCall) -> Result<T, DispatchError> {
    let invalid = |message: String| DispatchError::ToolExecution {
        tool: call.name.clone(),
        message,
    };
    // Backends hand back the raw string when the arguments were not JSON.
    let value = match &call.arguments {
        Value::String(raw) => {
            serde_json::from_str(raw).map_err(|e| invalid(format!("arguments are not JSON: {e}")))?
        }
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| invalid(format!("invalid arguments: {e}")))
}

/// Executes tool invocations. Must never fail: every failure is encoded as
/// `{"ok": false, "error": ...}` text so it can be fed back to the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Declared tool catalog, fetched once per loop run.
    fn catalog(&self) -> Vec<ToolSpec> {
        default_catalog()
    }

    async fn execute(&self, invocation: &ToolInvocation) -> String;
}

pub fn success_result(result: Value) -> String {
    json!({"ok": true, "result": result}).to_string()
}

pub fn error_result(message: &str) -> String {
    json!({"ok": false, "error": message}).to_string()
}

/// Cap a tool result at `max_chars` characters.
pub fn truncate_result(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text,
        Some((cut, _)) => {
            let mut out = text[..cut].to_string();
            out.push_str("...[truncated]");
            out
        }
    }
}
