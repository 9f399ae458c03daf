use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::url::DEFAULT_OPENCODE_BASE_URL;

/// Provider used when none is configured.
pub const DEFAULT_PROVIDER_ID: &str = "anthropic";
/// Model used when none is configured.
pub const DEFAULT_MODEL_ID: &str = "claude-3-5-sonnet-20241022";

/// Transport configuration for opencode server requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCodeApiConfig {
    /// Base URL of the opencode server.
    pub base_url: String,
    /// Provider identifier sent with each prompt (`model.providerID`).
    pub provider_id: String,
    /// Model identifier sent with each prompt (`model.modelID`).
    pub model_id: String,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Deadline for one non-streaming request, and for each read on the event stream.
    pub timeout: Duration,
}

impl Default for OpenCodeApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENCODE_BASE_URL.to_string(),
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            user_agent: None,
            extra_headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(120),
        }
    }
}

impl OpenCodeApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Reads `OPENCODE_BASE_URL`, `OPENCODE_PROVIDER_ID`, `OPENCODE_MODEL_ID`
    /// and `OPENCODE_TIMEOUT_SECS`, keeping defaults for unset or blank values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base_url) = env_string_opt("OPENCODE_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(provider_id) = env_string_opt("OPENCODE_PROVIDER_ID") {
            config.provider_id = provider_id;
        }
        if let Some(model_id) = env_string_opt("OPENCODE_MODEL_ID") {
            config.model_id = model_id;
        }
        if let Some(secs) = env_string_opt("OPENCODE_TIMEOUT_SECS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self.model_id = model_id.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}
