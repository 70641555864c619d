//! Container runtime management module.
//!
//! Provides an async interface to manage containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured
//! explicitly. All calls shell out through `tokio::process` so blocking
//! runtime I/O never stalls request handling.

mod container;
mod error;

pub use container::{ContainerConfig, ContainerState, PortMapping};
pub use error::{ContainerError, ContainerResult};

pub use container::validate_image_name;
use container::{validate_container_id_or_name, validate_network_name};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    Docker,
    /// Podman runtime (default for Linux prod)
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Container runtime abstraction.
///
/// The trait exists so orchestration components can be tested against a
/// mock runtime without docker/podman installed.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a new container, returning its runtime id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Gracefully stop a container, waiting up to `grace_seconds`.
    async fn stop_container(&self, container_id: &str, grace_seconds: u32) -> ContainerResult<()>;

    /// Forcibly kill a container.
    async fn kill_container(&self, container_id: &str) -> ContainerResult<()>;

    /// Remove a container.
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// Get the container state, or `None` if it does not exist.
    async fn container_state(&self, id_or_name: &str) -> ContainerResult<Option<ContainerState>>;

    /// Get the host port published for a container port, or `None` if the
    /// container or the mapping does not exist.
    async fn host_port(&self, id_or_name: &str, container_port: u16)
    -> ContainerResult<Option<u16>>;

    /// Get the last `tail` lines of container output.
    async fn logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String>;

    /// Create the named network if it does not exist yet.
    async fn ensure_network(&self, name: &str) -> ContainerResult<()>;
}

/// Container runtime client for managing containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Tries Docker first (for macOS dev), then falls back to Podman.
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self {
                    runtime_type: RuntimeType::Docker,
                    binary: "docker".to_string(),
                };
            }
        }

        if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else {
            // Fall back to podman, will fail at runtime
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a runtime subcommand and return stdout on success.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Whether an inspect failure means the container is gone, as opposed
    /// to the daemon being unreachable. Docker reports "No such object"
    /// or "No such container"; podman reports "no such container" or
    /// "... does not exist".
    fn is_missing_container(stderr: &str) -> bool {
        let message = stderr.to_ascii_lowercase();
        message.contains("no such container")
            || message.contains("no such object")
            || message.contains("does not exist")
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.run(
            "version",
            &["version".to_string(), "--format".to_string(), "json".to_string()],
        )
        .await
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        // Validate all inputs before spawning the runtime process.
        config.validate()?;

        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref network) = config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for port in &config.ports {
            args.push("-p".to_string());
            if port.host_port == 0 {
                // Runtime-assigned ephemeral host port.
                args.push(port.container_port.to_string());
            } else {
                args.push(format!("{}:{}", port.host_port, port.container_port));
            }
        }

        for (host, container) in &config.volumes {
            args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                args.push(format!("{}:{}:Z", host, container));
            } else {
                args.push(format!("{}:{}", host, container));
            }
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(config.image.clone());

        for cmd in &config.command {
            args.push(cmd.clone());
        }

        let stdout = self.run("run", &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn stop_container(&self, container_id: &str, grace_seconds: u32) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace_seconds.to_string(),
            container_id.to_string(),
        ];
        self.run("stop", &args).await?;
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let args = vec!["kill".to_string(), container_id.to_string()];
        self.run("kill", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        self.run("rm", &args).await?;
        Ok(())
    }

    async fn container_state(&self, id_or_name: &str) -> ContainerResult<Option<ContainerState>> {
        validate_container_id_or_name(id_or_name)?;

        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            id_or_name.to_string(),
        ];

        // Missing containers are reported as None; a daemon outage still
        // surfaces as an error so callers do not reconcile a live session
        // as lost.
        let stdout = match self.run("inspect", &args).await {
            Ok(out) => out,
            Err(ContainerError::CommandFailed { message, .. })
                if Self::is_missing_container(&message) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let status = stdout.trim().trim_matches('"');
        if status.is_empty() {
            return Ok(None);
        }

        Ok(Some(status.parse()?))
    }

    async fn host_port(
        &self,
        id_or_name: &str,
        container_port: u16,
    ) -> ContainerResult<Option<u16>> {
        validate_container_id_or_name(id_or_name)?;

        let format = format!(
            "{{{{(index (index .NetworkSettings.Ports \"{}/tcp\") 0).HostPort}}}}",
            container_port
        );
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            format,
            id_or_name.to_string(),
        ];

        // A container without this mapping makes the template's index call
        // fail; that counts as "no published port", not a daemon error.
        let stdout = match self.run("inspect", &args).await {
            Ok(out) => out,
            Err(ContainerError::CommandFailed { message, .. })
                if Self::is_missing_container(&message)
                    || message.contains("error calling index") =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let trimmed = stdout.trim().trim_matches('"');
        if trimmed.is_empty() {
            return Ok(None);
        }

        let port = trimmed.parse::<u16>().map_err(|_| {
            ContainerError::ParseError(format!("unexpected host port value '{}'", trimmed))
        })?;

        Ok(Some(port))
    }

    async fn logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        args.push(container_id.to_string());

        // The logs command reports container stderr on our stderr; a failed
        // invocation means the container is gone.
        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(format!("{}{}", stdout, stderr))
    }

    async fn ensure_network(&self, name: &str) -> ContainerResult<()> {
        validate_network_name(name)?;

        let inspect = vec![
            "network".to_string(),
            "inspect".to_string(),
            name.to_string(),
        ];
        if self.run("network inspect", &inspect).await.is_ok() {
            return Ok(());
        }

        let create = vec![
            "network".to_string(),
            "create".to_string(),
            name.to_string(),
        ];
        self.run("network create", &create).await?;
        Ok(())
    }
}
