//! Session Orchestration Library
//!
//! Core components for managing agent sessions and their containers:
//! a persisted session registry, a container provisioner, an idle
//! reaper, a recovery coordinator, and sandboxed workspace file access.

pub mod config;
pub mod container;
pub mod credential;
pub mod db;
pub mod error;
pub mod provision;
pub mod reaper;
pub mod recovery;
pub mod session;
pub mod workspace;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
