//! Session container provisioning.
//!
//! Turns a session row into a running container: prepares the session
//! volume, stages credentials, starts the container with a
//! runtime-assigned host port, and waits for the service inside to
//! come up before reporting success.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::container::{
    validate_image_name, ContainerConfig, ContainerRuntimeApi, PortMapping,
};
use crate::credential::CredentialStore;
use crate::error::{Error, Result};

/// Path the session volume is mounted at inside the container.
const SESSION_MOUNT: &str = "/mnt/session";

/// Where the entry script stages credentials before the service starts.
const AUTH_TARGET: &str = "/root/.local/share/opencode/auth.json";

/// What kind of workload a session container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    /// A bare workspace container with no service inside.
    Plain,
    /// An agent container serving an HTTP API on the service port.
    Agent,
}

impl ContainerRole {
    /// Whether the container exposes a service to probe and route to.
    pub fn serves(&self) -> bool {
        matches!(self, ContainerRole::Agent)
    }

    fn command(&self, service_port: u16) -> Vec<String> {
        match self {
            ContainerRole::Plain => {
                vec!["sleep".to_string(), "infinity".to_string()]
            }
            ContainerRole::Agent => {
                // Stage credentials from the volume, then exec the agent
                // so it stays pid 1 and receives stop signals.
                let script = format!(
                    "mkdir -p $(dirname {auth}) && \
                     if [ -f {mount}/auth.json ]; then cp {mount}/auth.json {auth}; fi && \
                     exec opencode serve --hostname 0.0.0.0 --port {port}",
                    auth = AUTH_TARGET,
                    mount = SESSION_MOUNT,
                    port = service_port,
                );
                vec!["sh".to_string(), "-c".to_string(), script]
            }
        }
    }
}

/// A successfully provisioned container.
#[derive(Debug, Clone)]
pub struct ProvisionedContainer {
    pub container_id: String,
    /// Deterministic name derived from the session id.
    pub name: String,
    pub network: String,
    /// Host directory mounted as the session volume.
    pub volume_path: PathBuf,
    pub host_port: Option<u16>,
    pub base_url: Option<String>,
}

/// Point-in-time view of a session's container.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: Option<String>,
    pub host_port: Option<u16>,
}

/// Probe seam for "is the service inside the container up yet".
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, base_url: &str) -> bool;
}

/// HTTP readiness probe; any response means the service is accepting
/// connections.
pub struct HttpReadiness {
    client: reqwest::Client,
}

impl HttpReadiness {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpReadiness {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadiness {
    async fn is_ready(&self, base_url: &str) -> bool {
        self.client.get(base_url).send().await.is_ok()
    }
}

/// Provisions and tears down session containers.
#[derive(Clone)]
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntimeApi>,
    credentials: Arc<dyn CredentialStore>,
    probe: Arc<dyn ReadinessProbe>,
    config: OrchestratorConfig,
}

impl Provisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        credentials: Arc<dyn CredentialStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            credentials,
            probe: Arc::new(HttpReadiness::new()),
            config,
        }
    }

    /// Replace the readiness probe. Used by tests to avoid real sockets.
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Deterministic container name for a session, so stale containers
    /// from a previous run can be found and reaped by name.
    pub fn container_name(session_id: &str) -> String {
        format!("hatch-{}", session_id)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.config.volume_root.join(session_id)
    }

    /// Provision a container for a session.
    ///
    /// On any failure after the container was created, the container is
    /// torn down best-effort before the error is returned.
    pub async fn start(
        &self,
        session_id: &str,
        role: ContainerRole,
        agent_ref: Option<&str>,
    ) -> Result<ProvisionedContainer> {
        validate_image_name(&self.config.image).map_err(Error::from)?;

        let name = Self::container_name(session_id);
        let session_dir = self.session_dir(session_id);

        tokio::fs::create_dir_all(session_dir.join("workspace")).await?;

        if role == ContainerRole::Agent {
            let agent_id = agent_ref.ok_or_else(|| {
                Error::Validation("agent sessions require an agent reference".to_string())
            })?;
            let credential = self.credentials.get(agent_id).await?;
            tokio::fs::write(session_dir.join("auth.json"), credential.auth_json()).await?;
            debug!("staged credentials for session {}", session_id);
        }

        // A container with this name may survive from a previous run.
        if let Ok(Some(_)) = self.runtime.container_state(&name).await {
            info!("removing stale container {}", name);
            if let Err(e) = self.runtime.remove_container(&name, true).await {
                warn!("failed to remove stale container {}: {}", name, e);
            }
        }

        self.runtime
            .ensure_network(&self.config.network)
            .await
            .map_err(Error::from)?;

        let host_dir = session_dir
            .canonicalize()
            .unwrap_or_else(|_| session_dir.clone())
            .to_string_lossy()
            .to_string();

        let mut container_config = ContainerConfig::new(self.config.image.clone())
            .name(name.clone())
            .network(self.config.network.clone())
            .volume(host_dir, SESSION_MOUNT.to_string())
            .command(role.command(self.config.service_port));

        if role.serves() {
            container_config =
                container_config.port(PortMapping::ephemeral(self.config.service_port));
        }

        let container_id = self
            .runtime
            .create_container(&container_config)
            .await
            .map_err(Error::from)?;
        info!("started container {} for session {}", container_id, session_id);

        if !role.serves() {
            return Ok(ProvisionedContainer {
                container_id,
                name,
                network: self.config.network.clone(),
                volume_path: session_dir,
                host_port: None,
                base_url: None,
            });
        }

        match self.finish_serving(&container_id).await {
            Ok((host_port, base_url)) => Ok(ProvisionedContainer {
                container_id,
                name,
                network: self.config.network.clone(),
                volume_path: session_dir,
                host_port: Some(host_port),
                base_url: Some(base_url),
            }),
            Err(e) => {
                warn!(
                    "container {} for session {} failed to come up: {}",
                    container_id, session_id, e
                );
                self.teardown(&container_id).await;
                Err(e)
            }
        }
    }

    /// Discover the published port and wait for the service to answer.
    async fn finish_serving(&self, container_id: &str) -> Result<(u16, String)> {
        let host_port = self
            .runtime
            .host_port(container_id, self.config.service_port)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| {
                Error::Provisioning(format!(
                    "container {} published no port for {}",
                    container_id, self.config.service_port
                ))
            })?;

        let base_url = format!("http://127.0.0.1:{}", host_port);

        let deadline = Duration::from_secs(self.config.ready_timeout_seconds);
        let ready = tokio::time::timeout(deadline, async {
            loop {
                if self.probe.is_ready(&base_url).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
        .await;

        if ready.is_err() {
            return Err(Error::Timeout(format!(
                "container {} not ready after {}s",
                container_id, self.config.ready_timeout_seconds
            )));
        }

        Ok((host_port, base_url))
    }

    /// Stop and remove a session container.
    ///
    /// Escalates from stop to kill, then removes. Removal failures are
    /// logged rather than surfaced since the container is already down.
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        if let Err(e) = self
            .runtime
            .stop_container(container_id, self.config.stop_grace_seconds)
            .await
        {
            warn!("stop of container {} failed, killing: {}", container_id, e);
            self.runtime
                .kill_container(container_id)
                .await
                .map_err(Error::from)?;
        }

        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            warn!("failed to remove container {}: {}", container_id, e);
        }

        Ok(())
    }

    /// Fetch recent logs from a session container.
    pub async fn logs(&self, container_id: &str, tail: Option<u32>) -> Result<String> {
        self.runtime
            .logs(container_id, tail)
            .await
            .map_err(Error::from)
    }

    /// Inspect a session container's current state and published port.
    pub async fn inspect(&self, container_id: &str) -> Result<ContainerStatus> {
        let state = self
            .runtime
            .container_state(container_id)
            .await
            .map_err(Error::from)?;

        let host_port = match state {
            Some(ref s) if s.is_running() => self
                .runtime
                .host_port(container_id, self.config.service_port)
                .await
                .map_err(Error::from)?,
            _ => None,
        };

        Ok(ContainerStatus {
            state: state.map(|s| s.to_string()),
            host_port,
        })
    }

    async fn teardown(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            warn!("cleanup of container {} failed: {}", container_id, e);
        }
    }
}
