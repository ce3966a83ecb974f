//! Tests for the OAuth token manager.

use super::*;
use crate::clock::ManualClock;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Stub refresher returning a fixed response or an error.
struct StubRefresher {
    calls: AtomicU32,
    fail: bool,
}

impl StubRefresher {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: true,
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for StubRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, TokenRefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(TokenRefreshError::Rejected {
                status: 500,
                message: "server error".to_string(),
            })
        } else {
            Ok(RefreshedToken {
                access_token: "new-access".to_string(),
                refresh_token: Some("new-refresh".to_string()),
                expires_in: 3600,
            })
        }
    }
}

fn token_expiring_in(clock: &ManualClock, seconds: u64) -> OAuthToken {
    OAuthToken {
        access_token: "old-access".to_string(),
        refresh_token: "old-refresh".to_string(),
        expires_at: clock.now().add_seconds(seconds),
        last_refreshed: None,
    }
}

async fn manager_with(
    dir: &TempDir,
    clock: ManualClock,
    refresher: Arc<StubRefresher>,
) -> Arc<TokenManager> {
    TokenManager::load(
        dir.path().join("tokens").join("oauth.json"),
        Arc::new(clock),
        refresher,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn store_then_reload_round_trips() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let path = dir.path().join("tokens").join("oauth.json");

    {
        let manager = manager_with(&dir, clock.clone(), StubRefresher::succeeding()).await;
        manager.store(token_expiring_in(&clock, 3600)).await.unwrap();
    }

    let reloaded = TokenManager::load(
        path,
        Arc::new(clock),
        StubRefresher::succeeding() as Arc<dyn TokenRefresher>,
    )
    .await
    .unwrap();
    assert_eq!(reloaded.access_token().await.as_deref(), Some("old-access"));
}

#[tokio::test]
async fn refresh_skipped_when_not_due() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let refresher = StubRefresher::succeeding();
    let manager = manager_with(&dir, clock.clone(), Arc::clone(&refresher)).await;

    manager.store(token_expiring_in(&clock, 3600)).await.unwrap();

    assert!(!manager.refresh_if_due().await);
    assert_eq!(refresher.call_count(), 0);
}

#[tokio::test]
async fn refresh_fires_inside_margin() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let refresher = StubRefresher::succeeding();
    let manager = manager_with(&dir, clock.clone(), Arc::clone(&refresher)).await;

    manager.store(token_expiring_in(&clock, 200)).await.unwrap();

    assert!(manager.refresh_if_due().await);
    assert_eq!(refresher.call_count(), 1);

    let token = manager.current().await.unwrap();
    assert_eq!(token.access_token, "new-access");
    assert_eq!(token.refresh_token, "new-refresh");
    assert!(token.last_refreshed.is_some());
}

#[tokio::test]
async fn failed_refresh_retains_existing_token() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let manager = manager_with(&dir, clock.clone(), StubRefresher::failing()).await;

    manager.store(token_expiring_in(&clock, 100)).await.unwrap();

    assert!(!manager.refresh_if_due().await);
    assert_eq!(manager.access_token().await.as_deref(), Some("old-access"));
}

#[tokio::test]
async fn file_expiry_never_trails_cache() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let path = dir.path().join("tokens").join("oauth.json");
    let manager = manager_with(&dir, clock.clone(), StubRefresher::succeeding()).await;

    manager.store(token_expiring_in(&clock, 100)).await.unwrap();
    manager.refresh_if_due().await;

    let cached = manager.current().await.unwrap();
    let on_disk: OAuthToken =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(on_disk.expires_at >= cached.expires_at);
}

#[cfg(unix)]
#[tokio::test]
async fn token_file_has_owner_only_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let path = dir.path().join("tokens").join("oauth.json");
    let manager = manager_with(&dir, clock.clone(), StubRefresher::succeeding()).await;

    manager.store(token_expiring_in(&clock, 3600)).await.unwrap();

    let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(file_mode, 0o600);

    let dir_mode = std::fs::metadata(path.parent().unwrap())
        .unwrap()
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(dir_mode, 0o700);
}

#[tokio::test]
async fn cleanup_clears_cache() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new();
    let manager = manager_with(&dir, clock.clone(), StubRefresher::succeeding()).await;

    manager.store(token_expiring_in(&clock, 3600)).await.unwrap();
    manager.cleanup().await;

    assert!(manager.access_token().await.is_none());
}
