//! Provider enumeration and per-provider configuration.

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// The execution providers the orchestrator can drive.
///
/// Providers are interchangeable behind the [`super::AgentExecutor`]
/// contract; the variant decides endpoint defaults and credential headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Ollama,
}

impl ProviderKind {
    /// Stable lowercase tag used in config files, logs, and state keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    /// Human-readable name for comments and health reports.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Anthropic => "Anthropic",
            Self::OpenAi => "OpenAI",
            Self::Ollama => "Ollama",
        }
    }

    /// Default API base endpoint for the provider.
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://127.0.0.1:11434/v1",
        }
    }

    /// All known kinds, in declaration order.
    pub fn all() -> &'static [ProviderKind] {
        &[Self::Anthropic, Self::OpenAi, Self::Ollama]
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAi),
            "ollama" | "local" => Ok(Self::Ollama),
            _ => Err(ParseError::InvalidFormat {
                expected: "anthropic, openai, or ollama".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// Configuration for one enabled provider.
///
/// Constructed from the config file at startup and again on reload; lives
/// for the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which provider this is
    #[serde(rename = "type")]
    pub kind: ProviderKind,

    /// Selection order; lower numbers are tried first
    pub priority: u8,

    /// API credential (key or OAuth access token)
    pub credential: String,

    /// Endpoint override; falls back to the kind's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Whether the router may select this provider
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Default model for execution requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    /// The endpoint to call, honoring the override.
    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.kind.default_endpoint())
    }
}

#[cfg(test)]
#[path = "kind_tests.rs"]
mod tests;
