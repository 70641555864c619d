//! Session recovery coordination.
//!
//! Recovers timed-out sessions back to running on demand. Concurrent
//! callers for the same session are collapsed onto one provisioning
//! flight: an in-process per-session mutex serializes them, and a
//! conditional status claim in the database guards against racers that
//! slip past the mutex (including ones from another process).

use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::provision::{ContainerRole, Provisioner};
use crate::session::{Session, SessionRegistry, SessionStatus};

/// Coordinates recovery of timed-out sessions.
#[derive(Clone)]
pub struct RecoveryCoordinator {
    registry: SessionRegistry,
    provisioner: Provisioner,
    config: OrchestratorConfig,
    flights: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RecoveryCoordinator {
    pub fn new(
        registry: SessionRegistry,
        provisioner: Provisioner,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            provisioner,
            config,
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Ensure a session is running, recovering it if it timed out.
    ///
    /// Sessions in any state other than `Timeout` are returned as they
    /// are; only the owner may trigger recovery.
    pub async fn ensure_running(&self, session_id: &str, owner_id: &str) -> Result<Session> {
        let session = self.registry.get(session_id).await?;

        if session.owner_id != owner_id {
            return Err(Error::Forbidden(format!(
                "session {} does not belong to caller",
                session_id
            )));
        }

        if session.status != SessionStatus::Timeout {
            return Ok(session);
        }

        let lock = self
            .flights
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.recover_locked(session_id).await
        };

        // Drop the flight entry once no other caller still holds it.
        self.flights
            .remove_if(session_id, |_, v| Arc::strong_count(v) <= 2);

        result
    }

    /// Recovery body, run with the per-session flight lock held.
    async fn recover_locked(&self, session_id: &str) -> Result<Session> {
        // A caller queued behind the winning flight sees the fresh state
        // here and returns without provisioning again.
        let session = self.registry.get(session_id).await?;
        if session.status != SessionStatus::Timeout {
            return Ok(session);
        }

        if !self.registry.claim_recovery(session_id).await? {
            return self.registry.get(session_id).await;
        }

        info!("recovering session {}", session_id);

        let role = if session.agent_ref.is_some() {
            ContainerRole::Agent
        } else {
            ContainerRole::Plain
        };

        let mut last_error = None;
        for attempt in 1..=self.config.provision_retries {
            match self
                .provisioner
                .start(session_id, role, session.agent_ref.as_deref())
                .await
            {
                Ok(provisioned) => {
                    // update_container resets last_activity_at in the same
                    // UPDATE, so the recovered row is never visible to the
                    // reaper with a stale timestamp.
                    let session = self
                        .registry
                        .update_container(
                            session_id,
                            Some(&provisioned.container_id),
                            provisioned.base_url.as_deref(),
                            SessionStatus::Running,
                        )
                        .await?;
                    info!(
                        "session {} recovered on container {}",
                        session_id, provisioned.container_id
                    );
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        "recovery attempt {}/{} for session {} failed: {}",
                        attempt, self.config.provision_retries, session_id, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            Error::Provisioning(format!("recovery of session {} failed", session_id))
        });

        if let Err(e) = self
            .registry
            .update_container(session_id, None, None, SessionStatus::Error)
            .await
        {
            warn!("failed to mark session {} errored: {}", session_id, e);
        }

        Err(error)
    }
}
