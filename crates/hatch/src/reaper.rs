//! Idle session reaper.
//!
//! A background task that periodically scans for running sessions with
//! no recent activity, stops their containers, and marks them timed
//! out. Shutdown is cooperative: a cancellation token stops the loop
//! and the caller can bound how long an in-flight tick may run on.

use std::time::Duration;

use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::provision::Provisioner;
use crate::session::SessionRegistry;

/// Handle to a running reaper task.
pub struct ReaperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the reaper to stop and wait for it, up to `grace`.
    ///
    /// A tick still in flight when the deadline expires is abandoned;
    /// its session updates are idempotent so the next start recovers.
    pub async fn shutdown(self, grace: Duration) {
        self.token.cancel();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!("reaper did not stop within {:?}", grace);
        }
    }
}

/// Scans for and reaps idle sessions.
#[derive(Clone)]
pub struct IdleReaper {
    registry: SessionRegistry,
    provisioner: Provisioner,
    config: OrchestratorConfig,
}

impl IdleReaper {
    pub fn new(
        registry: SessionRegistry,
        provisioner: Provisioner,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            provisioner,
            config,
        }
    }

    /// Spawn the scan loop on the current runtime.
    pub fn spawn(self) -> ReaperHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();

        let task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.scan_interval_seconds));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                "idle reaper started: timeout {}m, scan every {}s",
                self.config.idle_timeout_minutes, self.config.scan_interval_seconds
            );

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        info!("idle reaper stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.reap_once().await {
                            error!("idle scan failed: {}", e);
                        }
                    }
                }
            }
        });

        ReaperHandle { token, task }
    }

    /// Run one idle scan.
    ///
    /// Failures on one session never block the rest of the batch. A
    /// container stop failure is logged and the session is still marked
    /// timed out so it cannot be reaped forever.
    pub async fn reap_once(&self) -> crate::error::Result<usize> {
        let idle = self
            .registry
            .list_idle(self.config.idle_timeout_minutes)
            .await?;

        if idle.is_empty() {
            return Ok(0);
        }

        info!("reaping {} idle session(s)", idle.len());
        let mut reaped = 0;

        for session in idle {
            if let Some(ref container_id) = session.container_id {
                if let Err(e) = self.provisioner.stop(container_id).await {
                    warn!(
                        "failed to stop container {} for idle session {}: {}",
                        container_id, session.id, e
                    );
                }
            }

            match self.registry.mark_timeout(&session.id).await {
                Ok(_) => {
                    info!("session {} timed out after inactivity", session.id);
                    reaped += 1;
                }
                Err(e) => warn!("failed to mark session {} timed out: {}", session.id, e),
            }
        }

        Ok(reaped)
    }
}
