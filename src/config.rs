use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::DispatchError;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tandem.toml";

/// Backend flavour. Determines the URL shape, auth header and which request
/// parameters are legal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions, bearer token, `model` in body.
    #[default]
    DirectApi,
    /// Hosted deployment addressed by name in the URL; `model` is not sent.
    ManagedDeployment { api_version: String },
}

/// One generation backend. Immutable after construction.
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: String,
    /// Model identifier (direct API) or deployment name (managed deployment).
    pub model: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

impl ProviderConfig {
    /// Full chat-completions URL for this provider.
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match &self.kind {
            ProviderKind::DirectApi => format!("{base}/chat/completions"),
            ProviderKind::ManagedDeployment { api_version } => format!(
                "{base}/openai/deployments/{}/chat/completions?api-version={api_version}",
                self.model
            ),
        }
    }

    /// Read `{prefix}_BASE_URL`, `{prefix}_API_KEY`, `{prefix}_MODEL` and
    /// optionally `{prefix}_API_VERSION` (selects managed deployment).
    fn from_env_prefix(prefix: &str, name: &str) -> Option<Self> {
        let api_key = env::var(format!("{prefix}_API_KEY")).ok()?;
        let base_url = env::var(format!("{prefix}_BASE_URL"))
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = env::var(format!("{prefix}_MODEL")).unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let kind = match env::var(format!("{prefix}_API_VERSION")) {
            Ok(api_version) => ProviderKind::ManagedDeployment { api_version },
            Err(_) => ProviderKind::DirectApi,
        };
        Some(Self {
            name: env::var(format!("{prefix}_NAME")).unwrap_or_else(|_| name.to_string()),
            kind,
            base_url,
            api_key,
            model,
        })
    }
}

/// Dispatch policy knobs. Read-only once loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub tools_enabled: bool,
    pub enable_racing: bool,
    /// Buffered bytes before a streamed chunk is pushed to the consumer.
    pub stream_flush_size: usize,
    /// Budget for each backend call: a non-streaming call, a stream open, or
    /// the gap between two streamed tokens. Also the whole budget of the
    /// synchronous racing fallback, which runs after the deadline is spent.
    pub call_timeout_secs: u64,
    /// Whole-request deadline. `None` = no deadline.
    pub request_timeout_secs: Option<u64>,
    pub max_tool_iterations: usize,
    /// Force a tool call on the first loop iteration.
    pub force_tool_use: bool,
    /// Pin the tool choice to one tool by name.
    pub pinned_tool: Option<String>,
    /// Sanitizer score above which prompts are rewritten.
    pub risk_threshold: f64,
    pub max_tool_result_chars: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            tools_enabled: false,
            enable_racing: false,
            stream_flush_size: 64,
            call_timeout_secs: 60,
            request_timeout_secs: None,
            max_tool_iterations: 6,
            force_tool_use: false,
            pinned_tool: None,
            risk_threshold: 0.7,
            max_tool_result_chars: 8000,
        }
    }
}

impl DispatchSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Apply `TANDEM_*` environment overrides. Unparseable values are
    /// ignored with a warning.
    fn apply_env(&mut self) {
        env_override("TANDEM_TOOLS_ENABLED", &mut self.tools_enabled);
        env_override("TANDEM_ENABLE_RACING", &mut self.enable_racing);
        env_override("TANDEM_STREAM_FLUSH_SIZE", &mut self.stream_flush_size);
        env_override("TANDEM_CALL_TIMEOUT_SECS", &mut self.call_timeout_secs);
        env_override("TANDEM_MAX_TOOL_ITERATIONS", &mut self.max_tool_iterations);
        env_override("TANDEM_FORCE_TOOL_USE", &mut self.force_tool_use);
        env_override("TANDEM_RISK_THRESHOLD", &mut self.risk_threshold);
        if let Ok(raw) = env::var("TANDEM_REQUEST_TIMEOUT_SECS") {
            match raw.parse() {
                Ok(secs) => self.request_timeout_secs = Some(secs),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid TANDEM_REQUEST_TIMEOUT_SECS"),
            }
        }
        if let Ok(tool) = env::var("TANDEM_PINNED_TOOL") {
            self.pinned_tool = Some(tool).filter(|t| !t.trim().is_empty());
        }
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid config override"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    primary: Option<ProviderConfig>,
    secondary: Option<ProviderConfig>,
    #[serde(default)]
    dispatch: DispatchSettings,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub primary: ProviderConfig,
    pub secondary: Option<ProviderConfig>,
    pub dispatch: DispatchSettings,
}

impl Config {
    /// Defaults, then the TOML file (`TANDEM_CONFIG` or `tandem.toml` if
    /// present), then environment overrides.
    pub fn load() -> Result<Self, DispatchError> {
        let path = env::var("TANDEM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let file = if path.exists() {
            Some(Self::read_file(&path)?)
        } else {
            None
        };
        Self::merge(file)
    }

    /// Parse a TOML document without environment overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self, DispatchError> {
        let file: ConfigFile = toml::from_str(raw)
            .map_err(|e| DispatchError::Validation(format!("invalid config: {e}")))?;
        let primary = file
            .primary
            .ok_or_else(|| DispatchError::Validation("config has no [primary] provider".into()))?;
        Ok(Self {
            primary,
            secondary: file.secondary,
            dispatch: file.dispatch,
        })
    }

    fn read_file(path: &Path) -> Result<ConfigFile, DispatchError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Validation(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| DispatchError::Validation(format!("invalid {}: {e}", path.display())))
    }

    fn merge(file: Option<ConfigFile>) -> Result<Self, DispatchError> {
        let (file_primary, file_secondary, mut dispatch) = match file {
            Some(f) => (f.primary, f.secondary, f.dispatch),
            None => (None, None, DispatchSettings::default()),
        };
        dispatch.apply_env();

        let primary = ProviderConfig::from_env_prefix("TANDEM_PRIMARY", "primary")
            .or(file_primary)
            .ok_or_else(|| {
                DispatchError::Validation(
                    "no primary provider: set TANDEM_PRIMARY_API_KEY or [primary] in config".into(),
                )
            })?;
        let secondary =
            ProviderConfig::from_env_prefix("TANDEM_SECONDARY", "secondary").or(file_secondary);
        if secondary.is_none() {
            tracing::info!("no secondary provider configured: load balancing disabled");
        }

        Ok(Self {
            primary,
            secondary,
            dispatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [primary]
        name = "openai"
        base_url = "https://api.openai.com/v1/"
        api_key = "sk-test"
        model = "gpt-4o-mini"

        [secondary]
        name = "azure"
        base_url = "https://example.openai.azure.com"
        api_key = "az-test"
        model = "answers"
        kind = { type = "managed_deployment", api_version = "2024-06-01" }

        [dispatch]
        enable_racing = true
        stream_flush_size = 16
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.primary.kind, ProviderKind::DirectApi);
        assert!(config.dispatch.enable_racing);
        assert_eq!(config.dispatch.stream_flush_size, 16);
        assert_eq!(config.dispatch.max_tool_iterations, 6);
        assert_eq!(config.dispatch.request_timeout(), None);
    }

    #[test]
    fn endpoint_shapes_differ_by_kind() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.primary.endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
        let secondary = config.secondary.unwrap();
        assert_eq!(
            secondary.endpoint(),
            "https://example.openai.azure.com/openai/deployments/answers/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn missing_primary_is_rejected() {
        let err = Config::from_toml_str("[dispatch]\nenable_racing = true\n").unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn debug_redacts_key() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let dbg = format!("{:?}", config.primary);
        assert!(!dbg.contains("sk-test"));
        assert!(dbg.contains("[REDACTED]"));
    }
}
