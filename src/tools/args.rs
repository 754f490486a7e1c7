use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct SearchDocumentsArgs {
    /// Natural-language query to run against the indexed documents.
    pub query: String,
    /// Maximum number of passages to return (default: 5).
    pub top_k: Option<u32>,
}

impl SearchDocumentsArgs {
    pub const DEFAULT_TOP_K: u32 = 5;

    pub fn top_k(&self) -> u32 {
        self.top_k.unwrap_or(Self::DEFAULT_TOP_K)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct FetchUrlArgs {
    /// Absolute http(s) URL of the page to fetch and extract text from.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct RunCommandArgs {
    /// Shell command to execute in the sandboxed workspace.
    pub command: String,
    /// Per-command timeout in seconds (default: 30).
    pub timeout_secs: Option<u64>,
}

impl RunCommandArgs {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(Self::DEFAULT_TIMEOUT_SECS)
    }
}
