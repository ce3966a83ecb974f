//! # Session Manager
//!
//! A session is the unit of work for one issue on one execution attempt.
//! Its state machine is monotonic:
//!
//! ```text
//! STARTED ── track_process ──► IN_PROGRESS ── complete ──► DONE
//!    │                              │
//!    └────────── fail ─────────────┴─────────────────────► ERROR
//! ```
//!
//! `DONE` and `ERROR` are terminal; later `complete`/`fail` calls are
//! no-ops that leave both the in-memory record and the persisted file
//! untouched. Every transition is flushed to disk before returning, behind
//! a per-session mutex so writes never interleave.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{PersistenceError, StateStore};
use crate::{IssueId, SessionId, Timestamp};

/// Archived sessions older than this are pruned by the sweep.
pub const ARCHIVE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ============================================================================
// Types
// ============================================================================

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Started,
    InProgress,
    Done,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// What happens to the session artifacts once the session is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupPolicy {
    /// Remove the worktree and the session file
    DeleteWorktree,
    /// Move the session file into the archive
    ArchiveSession,
    /// Leave everything in place
    RetainSession,
}

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub issue_id: IssueId,
    pub repository: String,
    pub worktree_path: Option<PathBuf>,
    pub cleanup_policy: CleanupPolicy,
}

/// The persisted session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub issue_id: IssueId,
    pub repository: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,

    pub state: SessionState,

    /// Pid of an external process bound to the session, when tracked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_commit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub cleanup_policy: CleanupPolicy,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

/// Session manager failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A live session already exists for {session_id}")]
    Duplicate { session_id: SessionId },

    #[error("No session found for {session_id}")]
    NotFound { session_id: SessionId },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

// ============================================================================
// Manager
// ============================================================================

/// Issues session state machines and persists their transitions.
pub struct SessionManager {
    store: StateStore,
    clock: Arc<dyn Clock>,
    live: Mutex<HashSet<SessionId>>,
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionManager {
    /// Open the manager, re-registering non-terminal sessions found on disk
    /// as live.
    pub async fn load(store: StateStore, clock: Arc<dyn Clock>) -> Result<Self, PersistenceError> {
        let mut live = HashSet::new();

        for stem in store.list("sessions").await? {
            let key = format!("sessions/{stem}.json");
            if let Some(record) = store.read_json::<SessionRecord>(&key).await? {
                if !record.state.is_terminal() {
                    live.insert(record.session_id);
                }
            }
        }

        if !live.is_empty() {
            info!(count = live.len(), "recovered live sessions from disk");
        }

        Ok(Self {
            store,
            clock,
            live: Mutex::new(live),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a non-terminal session for `issue` exists, consulting both
    /// the in-memory live set and the session file.
    pub async fn has_live_session(&self, issue: &IssueId) -> bool {
        let session_id = SessionId::for_issue(issue);

        if self.live.lock().await.contains(&session_id) {
            return true;
        }

        match self
            .store
            .read_json::<SessionRecord>(&session_key(&session_id))
            .await
        {
            Ok(Some(record)) => !record.state.is_terminal(),
            _ => false,
        }
    }

    /// Open a session in `STARTED`.
    ///
    /// Fails with [`SessionError::Duplicate`] when a live session with the
    /// same id exists.
    pub async fn create_session(&self, new: NewSession) -> Result<SessionRecord, SessionError> {
        let session_id = SessionId::for_issue(&new.issue_id);
        let lock = self.lock_for(&session_id).await;
        let _guard = lock.lock().await;

        if self.has_live_session(&new.issue_id).await {
            return Err(SessionError::Duplicate { session_id });
        }

        let now = self.clock.now();
        let record = SessionRecord {
            session_id: session_id.clone(),
            issue_id: new.issue_id,
            repository: new.repository,
            worktree_path: new.worktree_path,
            state: SessionState::Started,
            process_id: None,
            final_commit: None,
            completion_reason: None,
            error: None,
            cleanup_policy: new.cleanup_policy,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.store.write_json(&session_key(&session_id), &record).await?;
        self.live.lock().await.insert(session_id.clone());

        info!(session = %session_id, "session started");
        Ok(record)
    }

    /// Bind an external process to the session and advance to `IN_PROGRESS`.
    pub async fn track_process(
        &self,
        session_id: &SessionId,
        process_id: Option<u32>,
    ) -> Result<SessionRecord, SessionError> {
        self.transition(session_id, |record, _now| {
            if record.state.is_terminal() {
                return false;
            }
            record.state = SessionState::InProgress;
            record.process_id = process_id;
            true
        })
        .await
    }

    /// Record the worktree path once it is known.
    pub async fn set_worktree(
        &self,
        session_id: &SessionId,
        path: PathBuf,
    ) -> Result<SessionRecord, SessionError> {
        self.transition(session_id, |record, _now| {
            if record.state.is_terminal() {
                return false;
            }
            record.worktree_path = Some(path.clone());
            true
        })
        .await
    }

    /// Transition to `DONE`. No-op when already terminal.
    pub async fn complete(
        &self,
        session_id: &SessionId,
        reason: impl Into<String>,
        final_commit: Option<String>,
    ) -> Result<SessionRecord, SessionError> {
        let reason = reason.into();
        let record = self
            .transition(session_id, |record, now| {
                if record.state.is_terminal() {
                    return false;
                }
                record.state = SessionState::Done;
                record.completion_reason = Some(reason.clone());
                record.final_commit = final_commit.clone();
                record.completed_at = Some(now);
                true
            })
            .await?;

        self.live.lock().await.remove(session_id);
        Ok(record)
    }

    /// Transition to `ERROR`. No-op when already terminal.
    pub async fn fail(
        &self,
        session_id: &SessionId,
        error: impl Into<String>,
    ) -> Result<SessionRecord, SessionError> {
        let error = error.into();
        let record = self
            .transition(session_id, |record, now| {
                if record.state.is_terminal() {
                    return false;
                }
                record.state = SessionState::Error;
                record.error = Some(error.clone());
                record.completed_at = Some(now);
                true
            })
            .await?;

        self.live.lock().await.remove(session_id);
        Ok(record)
    }

    /// Read a session record.
    pub async fn get(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.store.read_json(&session_key(session_id)).await?)
    }

    /// Apply the session's cleanup policy to its persisted record.
    pub async fn apply_cleanup_policy(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let record = match self
            .store
            .read_json::<SessionRecord>(&session_key(session_id))
            .await?
        {
            Some(record) => record,
            None => return Ok(()),
        };

        match record.cleanup_policy {
            CleanupPolicy::DeleteWorktree => {
                self.store.delete(&session_key(session_id)).await?;
                debug!(session = %session_id, "session file deleted");
            }
            CleanupPolicy::ArchiveSession => {
                let archive_key = format!(
                    "sessions/archive/{}_{}.json",
                    session_id,
                    self.clock.now().epoch_seconds()
                );
                self.store.write_json(&archive_key, &record).await?;
                self.store.delete(&session_key(session_id)).await?;
                debug!(session = %session_id, "session archived");
            }
            CleanupPolicy::RetainSession => {}
        }

        Ok(())
    }

    /// Delete archived sessions older than the retention window.
    pub async fn prune_archives(&self) -> Result<usize, SessionError> {
        let cutoff = self.clock.now().epoch_seconds()
            - ARCHIVE_RETENTION.as_secs() as i64;
        let mut pruned = 0;

        for stem in self.store.list("sessions/archive").await? {
            let epoch = stem
                .rsplit('_')
                .next()
                .and_then(|s| s.parse::<i64>().ok());

            match epoch {
                Some(epoch) if epoch < cutoff => {
                    self.store
                        .delete(&format!("sessions/archive/{stem}.json"))
                        .await?;
                    pruned += 1;
                }
                Some(_) => {}
                None => {
                    warn!(file = %stem, "archive file name carries no epoch, skipping");
                }
            }
        }

        if pruned > 0 {
            info!(pruned, "archived sessions pruned");
        }
        Ok(pruned)
    }

    /// Number of live sessions.
    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    async fn lock_for(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Apply a mutation under the per-session lock and flush when it
    /// changed anything.
    async fn transition<F>(
        &self,
        session_id: &SessionId,
        mut mutate: F,
    ) -> Result<SessionRecord, SessionError>
    where
        F: FnMut(&mut SessionRecord, Timestamp) -> bool,
    {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .read_json::<SessionRecord>(&session_key(session_id))
            .await?
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.clone(),
            })?;

        let now = self.clock.now();
        if mutate(&mut record, now) {
            record.updated_at = now;
            self.store.write_json(&session_key(session_id), &record).await?;
        }

        Ok(record)
    }
}

fn session_key(session_id: &SessionId) -> String {
    format!("sessions/{session_id}.json")
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
