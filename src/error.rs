use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("backend error from {provider}: {message}")]
    Backend {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("deadline exceeded after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },
}

impl DispatchError {
    pub fn backend(provider: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            provider: provider.to_string(),
            message: message.into(),
            status: None,
        }
    }

    /// Extract provider name from structured error variants.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Backend { provider, .. } => Some(provider),
            Self::RateLimited { provider } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            // status: None = not from HTTP, treat as permanent
            Self::Backend { status, .. } => status.is_some_and(|s| s >= 500),
            Self::Request(_) => true,
            _ => false,
        }
    }

    /// Message safe to hand back to end users: no URLs, no upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("invalid input: {msg}"),
            Self::Backend { provider, .. } => format!("backend {provider} failed to answer"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::AuthFailed { provider, .. } => format!("authentication failed for {provider}"),
            Self::SchemaParse(_) => "failed to parse backend response".to_string(),
            Self::Request(_) => "request to backend failed".to_string(),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled => "request cancelled".to_string(),
            Self::ToolExecution { tool, .. } => format!("tool {tool} failed"),
        }
    }
}
