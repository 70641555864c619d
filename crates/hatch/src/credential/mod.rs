//! Agent credential storage.
//!
//! Credentials are provisioning inputs only: they are written into a
//! session's volume as an `auth.json` the container entry script picks
//! up on boot. They are never logged and never returned to callers
//! outside this module.

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;

use crate::error::{Error, Result};

/// A stored agent credential.
///
/// `Debug` redacts the token so credentials cannot leak through logs.
#[derive(Clone)]
pub struct AgentCredential {
    pub id: String,
    pub name: Option<String>,
    pub access_token: String,
}

impl std::fmt::Debug for AgentCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCredential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl AgentCredential {
    /// Render the credential file content the container entry script expects.
    pub fn auth_json(&self) -> String {
        json!({
            "github-copilot": {
                "type": "oauth",
                "refresh": self.access_token,
            }
        })
        .to_string()
    }
}

/// Storage seam for agent credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, agent_id: &str) -> Result<AgentCredential>;
    async fn upsert(&self, agent_id: &str, name: Option<&str>, access_token: &str) -> Result<()>;
    async fn delete(&self, agent_id: &str) -> Result<()>;
}

/// SQLite-backed credential store over the `agents` table.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, agent_id: &str) -> Result<AgentCredential> {
        let row: Option<(String, Option<String>, String)> =
            sqlx::query_as("SELECT id, name, access_token FROM agents WHERE id = ?")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?;

        let (id, name, access_token) =
            row.ok_or_else(|| Error::NotFound(format!("agent {} not found", agent_id)))?;

        Ok(AgentCredential {
            id,
            name,
            access_token,
        })
    }

    async fn upsert(&self, agent_id: &str, name: Option<&str>, access_token: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, name, access_token)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                access_token = excluded.access_token
            "#,
        )
        .bind(agent_id)
        .bind(name)
        .bind(access_token)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("agent {} not found", agent_id)));
        }

        Ok(())
    }
}
