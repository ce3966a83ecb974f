//! Tests for the session state machine and its persistence.

use super::*;
use crate::clock::ManualClock;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    store: StateStore,
    clock: ManualClock,
    manager: SessionManager,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).await.unwrap();
    let clock = ManualClock::new();
    let manager = SessionManager::load(store.clone(), Arc::new(clock.clone()))
        .await
        .unwrap();
    Fixture {
        _dir: dir,
        store,
        clock,
        manager,
    }
}

fn new_session(identifier: &str) -> NewSession {
    NewSession {
        issue_id: IssueId::new(identifier).unwrap(),
        repository: "api".to_string(),
        worktree_path: None,
        cleanup_policy: CleanupPolicy::ArchiveSession,
    }
}

fn abc7_session() -> SessionId {
    SessionId::for_issue(&IssueId::new("ABC-7").unwrap())
}

#[tokio::test]
async fn create_persists_started_state() {
    let f = fixture().await;

    let record = f.manager.create_session(new_session("ABC-7")).await.unwrap();
    assert_eq!(record.state, SessionState::Started);

    let on_disk: SessionRecord = f
        .store
        .read_json("sessions/ABC-7.json")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_disk, record);
    assert_eq!(f.manager.live_count().await, 1);
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let f = fixture().await;

    f.manager.create_session(new_session("ABC-7")).await.unwrap();
    let err = f.manager.create_session(new_session("ABC-7")).await.unwrap_err();
    assert!(matches!(err, SessionError::Duplicate { .. }));
}

#[tokio::test]
async fn full_lifecycle_reaches_done() {
    let f = fixture().await;
    f.manager.create_session(new_session("ABC-7")).await.unwrap();
    let id = abc7_session();

    let record = f.manager.track_process(&id, Some(4242)).await.unwrap();
    assert_eq!(record.state, SessionState::InProgress);
    assert_eq!(record.process_id, Some(4242));

    let record = f
        .manager
        .complete(&id, "verified", Some("0123456".to_string()))
        .await
        .unwrap();
    assert_eq!(record.state, SessionState::Done);
    assert_eq!(record.final_commit.as_deref(), Some("0123456"));
    assert!(record.completed_at.is_some());
    assert_eq!(f.manager.live_count().await, 0);
}

#[tokio::test]
async fn fail_reaches_error_from_any_live_state() {
    let f = fixture().await;
    f.manager.create_session(new_session("ABC-7")).await.unwrap();
    let id = abc7_session();

    let record = f.manager.fail(&id, "provider exploded").await.unwrap();
    assert_eq!(record.state, SessionState::Error);
    assert_eq!(record.error.as_deref(), Some("provider exploded"));
}

#[tokio::test]
async fn terminal_states_are_idempotent() {
    let f = fixture().await;
    f.manager.create_session(new_session("ABC-7")).await.unwrap();
    let id = abc7_session();

    let done = f.manager.complete(&id, "verified", None).await.unwrap();

    // Subsequent complete/fail calls change nothing, including timestamps.
    f.clock.advance(Duration::from_secs(120));
    let after_fail = f.manager.fail(&id, "too late").await.unwrap();
    assert_eq!(after_fail.state, SessionState::Done);
    assert_eq!(after_fail.completed_at, done.completed_at);
    assert_eq!(after_fail.updated_at, done.updated_at);

    let after_complete = f.manager.complete(&id, "again", None).await.unwrap();
    assert_eq!(after_complete, after_fail);
}

#[tokio::test]
async fn terminal_session_frees_the_issue_for_a_new_one() {
    let f = fixture().await;
    f.manager.create_session(new_session("ABC-7")).await.unwrap();
    f.manager.fail(&abc7_session(), "first attempt died").await.unwrap();

    // ERROR is terminal, so the issue may be retried with a fresh session.
    assert!(!f
        .manager
        .has_live_session(&IssueId::new("ABC-7").unwrap())
        .await);
    f.manager.create_session(new_session("ABC-7")).await.unwrap();
}

#[tokio::test]
async fn live_sessions_recovered_on_restart() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).await.unwrap();
    let clock = ManualClock::new();

    {
        let manager = SessionManager::load(store.clone(), Arc::new(clock.clone()))
            .await
            .unwrap();
        manager.create_session(new_session("ABC-7")).await.unwrap();
        manager.create_session(new_session("ABC-8")).await.unwrap();
        manager
            .complete(&SessionId::for_issue(&IssueId::new("ABC-8").unwrap()), "ok", None)
            .await
            .unwrap();
    }

    let recovered = SessionManager::load(store, Arc::new(clock)).await.unwrap();
    assert_eq!(recovered.live_count().await, 1);
    assert!(recovered.has_live_session(&IssueId::new("ABC-7").unwrap()).await);
    assert!(!recovered.has_live_session(&IssueId::new("ABC-8").unwrap()).await);
}

#[tokio::test]
async fn archive_policy_moves_the_record() {
    let f = fixture().await;
    f.manager.create_session(new_session("ABC-7")).await.unwrap();
    let id = abc7_session();
    f.manager.complete(&id, "verified", None).await.unwrap();

    f.manager.apply_cleanup_policy(&id).await.unwrap();

    assert!(!f.store.exists("sessions/ABC-7.json").await);
    let archived = f.store.list("sessions/archive").await.unwrap();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].starts_with("ABC-7_"));
}

#[tokio::test]
async fn delete_policy_removes_the_record() {
    let f = fixture().await;
    let mut new = new_session("ABC-7");
    new.cleanup_policy = CleanupPolicy::DeleteWorktree;
    f.manager.create_session(new).await.unwrap();
    let id = abc7_session();
    f.manager.complete(&id, "verified", None).await.unwrap();

    f.manager.apply_cleanup_policy(&id).await.unwrap();

    assert!(!f.store.exists("sessions/ABC-7.json").await);
    assert!(f.store.list("sessions/archive").await.unwrap().is_empty());
}

#[tokio::test]
async fn retain_policy_leaves_the_record() {
    let f = fixture().await;
    let mut new = new_session("ABC-7");
    new.cleanup_policy = CleanupPolicy::RetainSession;
    f.manager.create_session(new).await.unwrap();
    let id = abc7_session();
    f.manager.complete(&id, "verified", None).await.unwrap();

    f.manager.apply_cleanup_policy(&id).await.unwrap();

    assert!(f.store.exists("sessions/ABC-7.json").await);
}

#[tokio::test]
async fn archive_prune_removes_expired_entries() {
    let f = fixture().await;
    f.manager.create_session(new_session("ABC-7")).await.unwrap();
    let id = abc7_session();
    f.manager.complete(&id, "verified", None).await.unwrap();
    f.manager.apply_cleanup_policy(&id).await.unwrap();

    // Not yet expired.
    assert_eq!(f.manager.prune_archives().await.unwrap(), 0);

    // Older than the 7-day retention.
    f.clock.advance(Duration::from_secs(8 * 24 * 60 * 60));
    assert_eq!(f.manager.prune_archives().await.unwrap(), 1);
    assert!(f.store.list("sessions/archive").await.unwrap().is_empty());
}

#[tokio::test]
async fn descriptor_round_trips_through_store() {
    let f = fixture().await;

    let issue = crate::IssueDescriptor {
        id: "internal-1".to_string(),
        identifier: IssueId::new("ABC-9").unwrap(),
        title: "round trip".to_string(),
        description: Some("body [repo=api]".to_string()),
        labels: vec!["auto".to_string()],
        project: Some("Platform".to_string()),
        team: None,
        state: Some("Todo".to_string()),
    };

    f.store.write_json("issues/ABC-9.json", &issue).await.unwrap();
    let loaded: crate::IssueDescriptor = f
        .store
        .read_json("issues/ABC-9.json")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, issue);
}
