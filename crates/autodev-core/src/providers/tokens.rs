//! OAuth token cache with a background refresh daemon.
//!
//! The token file is the single source of truth and is always written
//! before the in-memory cache is updated, so the persisted expiry is never
//! behind the cached one. File and directory are created with owner-only
//! permissions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::clock::Clock;
use crate::store::PersistenceError;
use crate::Timestamp;

/// Refresh when the token expires within this window.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Daemon tick cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Persisted OAuth token pair.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,

    #[zeroize(skip)]
    pub expires_at: Timestamp,

    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<Timestamp>,
}

impl OAuthToken {
    /// Whether the token needs refreshing at `now`.
    pub fn expires_within(&self, now: Timestamp, margin: Duration) -> bool {
        now.add_duration(margin) >= self.expires_at
    }
}

/// Result of a successful refresh request.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Errors from the refresh endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TokenRefreshError {
    #[error("Refresh request failed: {message}")]
    Http { message: String },

    #[error("Refresh rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Refresh response unparseable: {message}")]
    Parse { message: String },
}

/// The refresh transport, injectable for tests.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, TokenRefreshError>;
}

// ============================================================================
// HTTP refresher
// ============================================================================

/// Standard OAuth refresh-token grant over HTTP.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
}

impl HttpTokenRefresher {
    pub fn new(endpoint: impl Into<String>, client_id: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            client_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, TokenRefreshError> {
        let mut body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        if let Some(client_id) = &self.client_id {
            body["client_id"] = serde_json::Value::String(client_id.clone());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| TokenRefreshError::Http {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TokenRefreshError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: RefreshResponse =
            response.json().await.map_err(|e| TokenRefreshError::Parse {
                message: e.to_string(),
            })?;

        Ok(RefreshedToken {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_in: parsed.expires_in,
        })
    }
}

// ============================================================================
// Manager
// ============================================================================

/// OAuth access/refresh token cache with a background refresh daemon.
pub struct TokenManager {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    refresher: Arc<dyn TokenRefresher>,
    cache: RwLock<Option<OAuthToken>>,
    daemon: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    /// Load the manager, reading any previously persisted token.
    pub async fn load(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Arc<Self>, PersistenceError> {
        let path = path.into();

        let cached = match fs::read_to_string(&path).await {
            Ok(json) => Some(serde_json::from_str::<OAuthToken>(&json).map_err(|e| {
                PersistenceError::Serialization {
                    message: format!("{}: {}", path.display(), e),
                }
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(PersistenceError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        Ok(Arc::new(Self {
            path,
            clock,
            refresher,
            cache: RwLock::new(cached),
            daemon: std::sync::Mutex::new(None),
        }))
    }

    /// The current access token, if one is cached.
    pub async fn access_token(&self) -> Option<String> {
        self.cache
            .read()
            .await
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    /// Snapshot of the cached token.
    pub async fn current(&self) -> Option<OAuthToken> {
        self.cache.read().await.clone()
    }

    /// Persist a token and update the cache.
    ///
    /// The file write completes first; the cache only ever trails the file.
    pub async fn store(&self, token: OAuthToken) -> Result<(), PersistenceError> {
        self.write_token_file(&token).await?;
        *self.cache.write().await = Some(token);
        Ok(())
    }

    /// Refresh the token if it expires within the margin.
    ///
    /// Returns whether a refresh was performed. Failures are logged and the
    /// existing token retained; it may still be serviceable until its
    /// actual expiry.
    pub async fn refresh_if_due(&self) -> bool {
        let now = self.clock.now();
        let current = match self.current().await {
            Some(token) => token,
            None => return false,
        };

        if !current.expires_within(now, REFRESH_MARGIN) {
            return false;
        }

        match self.refresher.refresh(&current.refresh_token).await {
            Ok(refreshed) => {
                let token = OAuthToken {
                    access_token: refreshed.access_token,
                    refresh_token: refreshed
                        .refresh_token
                        .unwrap_or_else(|| current.refresh_token.clone()),
                    expires_at: now.add_seconds(refreshed.expires_in),
                    last_refreshed: Some(now),
                };
                match self.store(token).await {
                    Ok(()) => {
                        info!("OAuth token refreshed");
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "refreshed token could not be persisted, keeping previous token");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "OAuth token refresh failed, keeping existing token");
                false
            }
        }
    }

    /// Start the 60-second refresh ticker.
    pub fn spawn_refresh_daemon(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = manager.clock.sleep(TICK_INTERVAL) => {
                        manager.refresh_if_due().await;
                    }
                }
            }
        });

        let mut daemon = self.daemon.lock().expect("daemon slot poisoned");
        if let Some(previous) = daemon.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the ticker and drop the cached token.
    pub async fn cleanup(&self) {
        if let Some(handle) = self.daemon.lock().expect("daemon slot poisoned").take() {
            handle.abort();
        }
        *self.cache.write().await = None;
    }

    async fn write_token_file(&self, token: &OAuthToken) -> Result<(), PersistenceError> {
        let io_err = |path: &std::path::Path, e: std::io::Error| PersistenceError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                    .await
                    .map_err(|e| io_err(parent, e))?;
            }
        }

        let json =
            serde_json::to_string_pretty(token).map_err(|e| PersistenceError::Serialization {
                message: e.to_string(),
            })?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.flush().await.map_err(|e| io_err(&temp_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| io_err(&temp_path, e))?;
        }

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| io_err(&self.path, e))
    }
}

#[cfg(test)]
#[path = "tokens_tests.rs"]
mod tests;
