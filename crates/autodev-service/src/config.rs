//! Service configuration.
//!
//! One JSON document (path from `--config` or `AUTODEV_CONFIG`) plus
//! environment overrides. Legacy variable names from the previous scheme
//! are honored when the canonical `AUTODEV_*` variable is absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use autodev_core::routing::LabelRules;
use autodev_core::{ProviderConfig, ProviderKind, RepositoryConfig, WorktreeMode};

/// Configuration loading failures; fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("config file {path} is not valid JSON: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Grace period for in-flight work on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

/// Filesystem layout for persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_base: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,
}

fn default_state_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".autodev")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            worktree_base: None,
            log_path: None,
            token_path: None,
        }
    }
}

impl PathsConfig {
    pub fn worktree_base(&self) -> PathBuf {
        self.worktree_base
            .clone()
            .unwrap_or_else(|| self.state_root.join("worktrees"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| self.state_root.join("logs"))
    }

    pub fn token_path(&self) -> PathBuf {
        self.token_path
            .clone()
            .unwrap_or_else(|| self.state_root.join("credentials").join("oauth.json"))
    }
}

/// The whole service configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub server: ServerConfig,

    /// HMAC secret for webhook signatures; unsigned ingress is refused when
    /// unset except on the loopback test route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,

    /// Display name delegate-change events must address
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<ProviderKind>,

    #[serde(default)]
    pub default_worktree_mode: WorktreeMode,

    #[serde(default)]
    pub label_rules: LabelRules,

    /// Execution request deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Health sweep cadence in milliseconds
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// OAuth refresh endpoint, enabling the token daemon when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_refresh_endpoint: Option<String>,
}

fn default_version() -> u32 {
    1
}

fn default_agent_name() -> String {
    "autodev".to_string()
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerConfig::default(),
            webhook_secret: None,
            agent_name: default_agent_name(),
            repositories: Vec::new(),
            providers: Vec::new(),
            paths: PathsConfig::default(),
            default_provider: None,
            default_worktree_mode: WorktreeMode::default(),
            label_rules: LabelRules::default(),
            execution_timeout_ms: default_timeout_ms(),
            health_interval_ms: default_health_interval_ms(),
            token_refresh_endpoint: None,
        }
    }
}

impl AppConfig {
    /// Load the config file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut config: AppConfig =
            serde_json::from_str(&json).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup function, so tests run
    /// without touching process-global state.
    ///
    /// Each setting honors the canonical `AUTODEV_*` name first, then its
    /// legacy alias.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|n| lookup(n));

        if let Some(port) = first(&["AUTODEV_PORT", "PORT"]).and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = first(&["AUTODEV_HOST", "HOST"]) {
            self.server.host = host;
        }
        if let Some(secret) = first(&["AUTODEV_WEBHOOK_SECRET", "WEBHOOK_SECRET"]) {
            self.webhook_secret = Some(secret);
        }
        if let Some(timeout) =
            first(&["AUTODEV_TIMEOUT_MS", "DEFAULT_TIMEOUT_MS"]).and_then(|v| v.parse().ok())
        {
            self.execution_timeout_ms = timeout;
        }
        if let Some(interval) =
            first(&["AUTODEV_HEALTH_INTERVAL_MS", "HEALTH_INTERVAL_MS"]).and_then(|v| v.parse().ok())
        {
            self.health_interval_ms = interval;
        }
        if let Some(root) = first(&["AUTODEV_STATE_ROOT", "SESSION_BASE_PATH"]) {
            self.paths.state_root = PathBuf::from(root);
        }
        if let Some(base) = first(&["AUTODEV_WORKTREE_BASE", "WORKTREE_BASE_PATH"]) {
            self.paths.worktree_base = Some(PathBuf::from(base));
        }
        if let Some(logs) = first(&["AUTODEV_LOG_PATH", "LOG_PATH"]) {
            self.paths.log_path = Some(PathBuf::from(logs));
        }

        // Provider credentials come from the conventional per-vendor
        // variables when the config file leaves them empty.
        for provider in &mut self.providers {
            if !provider.credential.is_empty() {
                continue;
            }
            let names: &[&str] = match provider.kind {
                ProviderKind::Anthropic => &["ANTHROPIC_API_KEY", "ANTHROPIC_KEY"],
                ProviderKind::OpenAi => &["OPENAI_API_KEY", "OPENAI_KEY"],
                ProviderKind::Ollama => &["OLLAMA_API_KEY"],
            };
            if let Some(credential) = first(names) {
                provider.credential = credential;
            }
        }
    }

    /// Startup validation; failures abort the process with exit code 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repositories.is_empty() {
            return Err(ConfigError::Invalid {
                message: "at least one repository must be configured".to_string(),
            });
        }

        if !self.providers.iter().any(|p| p.enabled) {
            return Err(ConfigError::Invalid {
                message: "at least one enabled provider must be configured".to_string(),
            });
        }

        for provider in self.providers.iter().filter(|p| p.enabled) {
            if provider.credential.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "provider {} is enabled but has no credential",
                        provider.kind
                    ),
                });
            }
        }

        let mut seen = std::collections::HashSet::new();
        for repository in &self.repositories {
            if !seen.insert(repository.id.to_lowercase()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate repository id '{}'", repository.id),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
