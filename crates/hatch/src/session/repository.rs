//! Session registry - persisted session state behind a narrow interface.
//!
//! Every mutation runs as a single statement or a single-row transaction so
//! that concurrent writers (the idle reaper and the recovery coordinator may
//! race on the same row) always observe a consistent prior state.

use log::debug;
use sqlx::SqlitePool;

use crate::error::{Error, Result};

use super::models::{Session, SessionStatus};

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    id, owner_id, agent_ref, status, container_id, base_url,
    last_activity_at, created_at, updated_at
"#;

/// Persisted CRUD store for session state.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    pool: SqlitePool,
}

impl SessionRegistry {
    /// Create a new registry over the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new session in `Pending` state.
    ///
    /// Fails with `Conflict` if the id already exists.
    pub async fn create(
        &self,
        id: &str,
        owner_id: &str,
        agent_ref: Option<&str>,
    ) -> Result<Session> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (id, owner_id, agent_ref, status)
            VALUES (?, ?, ?, 'pending')
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(agent_ref)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(Error::Conflict(format!("session {} already exists", id)));
            }
            Err(e) => return Err(e.into()),
        }

        debug!("Created session {} for owner {}", id, owner_id);
        self.get(id).await
    }

    /// Create a new session with a generated id.
    pub async fn create_new(&self, owner_id: &str, agent_ref: Option<&str>) -> Result<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create(&id, owner_id, agent_ref).await
    }

    /// Get a session by ID. Fails with `NotFound` if missing.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {} not found", id)))
    }

    /// List sessions owned by a user, optionally filtered by status.
    pub async fn list(
        &self,
        owner_id: &str,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>> {
        let sessions = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {} FROM sessions WHERE owner_id = ? AND status = ? ORDER BY created_at DESC",
                    SESSION_COLUMNS
                );
                sqlx::query_as::<_, Session>(&query)
                    .bind(owner_id)
                    .bind(status.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM sessions WHERE owner_id = ? ORDER BY created_at DESC",
                    SESSION_COLUMNS
                );
                sqlx::query_as::<_, Session>(&query)
                    .bind(owner_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(sessions)
    }

    /// Atomically update a session's container reference and status.
    ///
    /// The invariant `container_id IS NOT NULL <=> status = running` is
    /// enforced here: a non-running status forces both references to NULL
    /// in the same UPDATE, and a `Running` status without a container id is
    /// rejected before any write. A transition to `Running` also resets
    /// `last_activity_at` in the same UPDATE, so a concurrently scanning
    /// reaper can never observe a freshly recovered session with its
    /// pre-timeout activity timestamp.
    pub async fn update_container(
        &self,
        id: &str,
        container_id: Option<&str>,
        base_url: Option<&str>,
        status: SessionStatus,
    ) -> Result<Session> {
        if status == SessionStatus::Running && container_id.is_none() {
            return Err(Error::Validation(
                "a running session requires a container reference".to_string(),
            ));
        }

        // Transitions away from running null out the references atomically.
        let (container_id, base_url) = if status == SessionStatus::Running {
            (container_id, base_url)
        } else {
            (None, None)
        };

        let mut tx = self.pool.begin().await?;

        let sql = if status == SessionStatus::Running {
            r#"
            UPDATE sessions
            SET container_id = ?, base_url = ?, status = ?,
                last_activity_at = datetime('now'), updated_at = datetime('now')
            WHERE id = ?
            "#
        } else {
            r#"
            UPDATE sessions
            SET container_id = ?, base_url = ?, status = ?, updated_at = datetime('now')
            WHERE id = ?
            "#
        };

        let updated = sqlx::query(sql)
            .bind(container_id)
            .bind(base_url)
            .bind(status.to_string())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::NotFound(format!("session {} not found", id)));
        }

        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(session)
    }

    /// Atomically mark a session as timed out, clearing its container
    /// references. Safe to call on an already timed-out session.
    pub async fn mark_timeout(&self, id: &str) -> Result<Session> {
        self.update_container(id, None, None, SessionStatus::Timeout)
            .await
    }

    /// Mark a session as terminated by the user, clearing its container
    /// references. The row is retained for history; `delete` removes it.
    pub async fn mark_terminated(&self, id: &str) -> Result<Session> {
        self.update_container(id, None, None, SessionStatus::Terminated)
            .await
    }

    /// Update the last activity timestamp to now.
    pub async fn touch_activity(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Set the last activity timestamp explicitly (callers syncing activity
    /// observed elsewhere, e.g. from the upstream agent service).
    pub async fn set_last_activity(&self, id: &str, timestamp: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity_at = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete a session. Fails with `NotFound` if missing.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound(format!("session {} not found", id)));
        }

        Ok(())
    }

    /// List running sessions that have been idle for longer than the given
    /// number of minutes. A NULL `last_activity_at` counts as idle.
    pub async fn list_idle(&self, idle_minutes: i64) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE status = 'running' AND (last_activity_at IS NULL OR datetime(last_activity_at) < datetime('now', ? || ' minutes')) ORDER BY datetime(last_activity_at) ASC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(-idle_minutes) // negative for "X minutes ago"
            .fetch_all(&self.pool)
            .await?;

        Ok(sessions)
    }

    /// Conditionally claim a timed-out session for recovery by flipping it
    /// back to `pending`. Returns true only for the single caller that wins
    /// the claim; everyone else sees false and should re-read the row.
    pub async fn claim_recovery(&self, id: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'pending', updated_at = datetime('now')
            WHERE id = ? AND status = 'timeout'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn registry() -> SessionRegistry {
        let db = Database::in_memory().await.unwrap();
        SessionRegistry::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = registry().await;

        let session = registry.create("s1", "alice", Some("agent-1")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.owner_id, "alice");
        assert_eq!(session.agent_ref.as_deref(), Some("agent-1"));
        assert!(session.container_id.is_none());

        let fetched = registry.get("s1").await.unwrap();
        assert_eq!(fetched.id, "s1");
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();

        let err = registry.create("s1", "bob", None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let registry = registry().await;
        let err = registry.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_container_enforces_invariant() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();

        // Running requires a container reference.
        let err = registry
            .update_container("s1", None, None, SessionStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let session = registry
            .update_container("s1", Some("c1"), Some("http://127.0.0.1:4096"), SessionStatus::Running)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.container_id.as_deref(), Some("c1"));

        // Leaving Running clears the references even if passed through.
        let session = registry
            .update_container("s1", Some("c1"), None, SessionStatus::Terminated)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);
        assert!(session.container_id.is_none());
        assert!(session.base_url.is_none());
    }

    #[tokio::test]
    async fn test_mark_timeout_is_idempotent() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();
        registry
            .update_container("s1", Some("c1"), Some("http://127.0.0.1:4096"), SessionStatus::Running)
            .await
            .unwrap();

        let session = registry.mark_timeout("s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Timeout);
        assert!(session.container_id.is_none());

        // Second call is a safe no-op.
        let session = registry.mark_timeout("s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_list_filters_by_owner_and_status() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();
        registry.create("s2", "alice", None).await.unwrap();
        registry.create("s3", "bob", None).await.unwrap();
        registry
            .update_container("s2", Some("c2"), None, SessionStatus::Running)
            .await
            .unwrap();

        assert_eq!(registry.list("alice", None).await.unwrap().len(), 2);
        assert_eq!(registry.list("bob", None).await.unwrap().len(), 1);

        let running = registry
            .list("alice", Some(SessionStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "s2");
    }

    #[tokio::test]
    async fn test_list_idle_picks_stale_running_sessions() {
        let registry = registry().await;
        registry.create("stale", "alice", None).await.unwrap();
        registry.create("fresh", "alice", None).await.unwrap();
        registry.create("stopped", "alice", None).await.unwrap();

        for id in ["stale", "fresh"] {
            registry
                .update_container(id, Some("c"), Some("http://127.0.0.1:1"), SessionStatus::Running)
                .await
                .unwrap();
        }

        registry
            .set_last_activity("stale", Some("2020-01-01 00:00:00"))
            .await
            .unwrap();
        registry.touch_activity("fresh").await.unwrap();

        let idle = registry.list_idle(15).await.unwrap();
        let ids: Vec<_> = idle.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["stale"]);
    }

    #[tokio::test]
    async fn test_transition_to_running_resets_activity() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();
        registry
            .set_last_activity("s1", Some("2020-01-01 00:00:00"))
            .await
            .unwrap();

        let session = registry
            .update_container("s1", Some("c1"), None, SessionStatus::Running)
            .await
            .unwrap();

        // The stale timestamp is replaced in the same UPDATE, so the row is
        // never observable as running-but-idle.
        let activity = session.last_activity_at.unwrap();
        assert_ne!(activity, "2020-01-01 00:00:00");
        assert!(registry.list_idle(15).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_session_with_cleared_activity_counts_as_idle() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();
        registry
            .update_container("s1", Some("c1"), None, SessionStatus::Running)
            .await
            .unwrap();
        registry.set_last_activity("s1", None).await.unwrap();

        let idle = registry.list_idle(15).await.unwrap();
        assert_eq!(idle.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_recovery_single_winner() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();
        registry
            .update_container("s1", Some("c1"), None, SessionStatus::Running)
            .await
            .unwrap();
        registry.mark_timeout("s1").await.unwrap();

        assert!(registry.claim_recovery("s1").await.unwrap());
        // Already claimed: no further winner.
        assert!(!registry.claim_recovery("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let registry = registry().await;
        registry.create("s1", "alice", None).await.unwrap();
        registry.delete("s1").await.unwrap();

        assert!(registry.get("s1").await.unwrap_err().is_not_found());
        assert!(registry.delete("s1").await.unwrap_err().is_not_found());
    }
}
