//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session status.
///
/// `Terminated` (user-initiated stop) and `Timeout` (idle reap) are kept
/// distinct so history can tell them apart. Neither is re-entered
/// automatically: only `Timeout` sessions are recovered on next use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session record exists, no container provisioned yet.
    Pending,
    /// Container is live and `base_url` is reachable.
    Running,
    /// Container is suspended by the caller.
    Paused,
    /// Provisioning failed irrecoverably.
    Error,
    /// Container reclaimed after idle timeout; recoverable on next use.
    Timeout,
    /// User-initiated stop; terminal.
    Terminated,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Timeout => write!(f, "timeout"),
            SessionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "error" => Ok(SessionStatus::Error),
            "timeout" => Ok(SessionStatus::Timeout),
            "terminated" => Ok(SessionStatus::Terminated),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A chat session and its (optional) backing container.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// User who owns this session.
    pub owner_id: String,
    /// Agent credential profile used when (re)provisioning.
    pub agent_ref: Option<String>,
    /// Current session status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Runtime container ID. Set iff `status` is `Running`.
    pub container_id: Option<String>,
    /// Reachable address of the container's service. Set iff
    /// `container_id` is set.
    pub base_url: Option<String>,
    /// Last activity timestamp (for idle timeout).
    pub last_activity_at: Option<String>,
    /// When the session was created.
    pub created_at: String,
    /// When the session row was last updated.
    pub updated_at: String,
}

impl Session {
    /// Check if the session is in a state a new session must replace.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Terminated | SessionStatus::Error
        )
    }

    /// Check if the session currently has a live container.
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Error,
            SessionStatus::Timeout,
            SessionStatus::Terminated,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_rejects_unknown() {
        assert!("stopped".parse::<SessionStatus>().is_err());
        assert!("".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        let mut session = Session {
            id: "s1".to_string(),
            owner_id: "u1".to_string(),
            agent_ref: None,
            status: SessionStatus::Terminated,
            container_id: None,
            base_url: None,
            last_activity_at: None,
            created_at: "2026-01-01 00:00:00".to_string(),
            updated_at: "2026-01-01 00:00:00".to_string(),
        };
        assert!(session.is_terminal());

        session.status = SessionStatus::Timeout;
        assert!(!session.is_terminal());
    }
}
