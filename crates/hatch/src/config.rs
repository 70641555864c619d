//! Orchestrator configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML
//! file, then `HATCH_`-prefixed environment variables with `__` as the
//! section separator (e.g. `HATCH_IDLE_TIMEOUT_MINUTES=30`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Root directory holding per-session volumes.
    pub volume_root: PathBuf,
    /// Container image to run sessions with.
    pub image: String,
    /// Container network sessions are attached to.
    pub network: String,
    /// Port the session service listens on inside the container.
    pub service_port: u16,
    /// Minutes without activity before a running session is reaped.
    pub idle_timeout_minutes: i64,
    /// Seconds between idle scans.
    pub scan_interval_seconds: u64,
    /// Seconds a container gets to stop before it is killed.
    pub stop_grace_seconds: u32,
    /// Provisioning attempts before a session is marked failed.
    pub provision_retries: u32,
    /// Seconds to wait for a fresh container to become ready.
    pub ready_timeout_seconds: u64,
    /// Seconds the reaper gets to finish its tick on shutdown.
    pub shutdown_grace_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/hatch.db"),
            volume_root: PathBuf::from("./data/sessions"),
            image: "hatch-agent:latest".to_string(),
            network: "hatch-net".to_string(),
            service_port: 4096,
            idle_timeout_minutes: 15,
            scan_interval_seconds: 60,
            stop_grace_seconds: 10,
            provision_retries: 3,
            ready_timeout_seconds: 30,
            shutdown_grace_seconds: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from defaults, an optional file, and the
    /// environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        let built = builder
            .add_source(Environment::with_prefix("HATCH").separator("__"))
            .build()
            .context("building configuration")?;

        let config: OrchestratorConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Check that the timing knobs form a workable schedule.
    ///
    /// All violations are collected so an operator can fix a bad file in
    /// one pass.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.idle_timeout_minutes < 1 {
            problems.push("idle_timeout_minutes must be at least 1".to_string());
        }
        if self.scan_interval_seconds < 5 {
            problems.push("scan_interval_seconds must be at least 5".to_string());
        }
        // Widened so an oversized interval cannot wrap past the check.
        let idle_seconds = (self.idle_timeout_minutes as i128).saturating_mul(60);
        if self.idle_timeout_minutes >= 1 && self.scan_interval_seconds as i128 >= idle_seconds {
            problems.push(format!(
                "scan_interval_seconds ({}) must be shorter than the idle timeout ({}s)",
                self.scan_interval_seconds, idle_seconds
            ));
        }
        if self.stop_grace_seconds < 1 {
            problems.push("stop_grace_seconds must be at least 1".to_string());
        }
        if self.provision_retries < 1 {
            problems.push("provision_retries must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration: {}", problems.join("; "))
        }
    }
}
