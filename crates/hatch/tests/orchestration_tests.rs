//! Orchestration integration tests: reaper, recovery, and the session
//! lifecycle, run against a mock container runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use tempfile::TempDir;

use hatch::config::OrchestratorConfig;
use hatch::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerState,
};
use hatch::credential::SqliteCredentialStore;
use hatch::db::Database;
use hatch::error::Error;
use hatch::provision::{ContainerRole, Provisioner, ReadinessProbe};
use hatch::reaper::IdleReaper;
use hatch::recovery::RecoveryCoordinator;
use hatch::session::{SessionRegistry, SessionStatus};

/// In-memory stand-in for docker/podman.
#[derive(Default)]
struct MockRuntime {
    counter: AtomicUsize,
    fail_create: AtomicBool,
    containers: StdMutex<HashMap<String, ContainerState>>,
    stopped: StdMutex<Vec<String>>,
}

impl MockRuntime {
    fn create_calls(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    fn stopped_ids(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntimeApi for MockRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "image pull failed".to_string(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-{}", n);
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), ContainerState::Running);
        Ok(id)
    }

    async fn stop_container(&self, container_id: &str, _grace: u32) -> ContainerResult<()> {
        self.stopped.lock().unwrap().push(container_id.to_string());
        self.containers
            .lock()
            .unwrap()
            .insert(container_id.to_string(), ContainerState::Exited);
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> ContainerResult<()> {
        self.containers
            .lock()
            .unwrap()
            .insert(container_id.to_string(), ContainerState::Exited);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.containers.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn container_state(&self, id_or_name: &str) -> ContainerResult<Option<ContainerState>> {
        Ok(self.containers.lock().unwrap().get(id_or_name).copied())
    }

    async fn host_port(
        &self,
        id_or_name: &str,
        _container_port: u16,
    ) -> ContainerResult<Option<u16>> {
        let running = self
            .containers
            .lock()
            .unwrap()
            .get(id_or_name)
            .is_some_and(|s| s.is_running());
        Ok(running.then_some(43055))
    }

    async fn logs(&self, _container_id: &str, _tail: Option<u32>) -> ContainerResult<String> {
        Ok(String::new())
    }

    async fn ensure_network(&self, _name: &str) -> ContainerResult<()> {
        Ok(())
    }
}

struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn is_ready(&self, _base_url: &str) -> bool {
        true
    }
}

struct Harness {
    registry: SessionRegistry,
    provisioner: Provisioner,
    runtime: Arc<MockRuntime>,
    config: OrchestratorConfig,
    _volumes: TempDir,
}

async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let registry = SessionRegistry::new(db.pool().clone());
    let credentials = Arc::new(SqliteCredentialStore::new(db.pool().clone()));
    let runtime = Arc::new(MockRuntime::default());
    let volumes = TempDir::new().unwrap();

    let config = OrchestratorConfig {
        volume_root: volumes.path().to_path_buf(),
        provision_retries: 1,
        ready_timeout_seconds: 2,
        ..Default::default()
    };

    let provisioner = Provisioner::new(runtime.clone(), credentials, config.clone())
        .with_probe(Arc::new(AlwaysReady));

    Harness {
        registry,
        provisioner,
        runtime,
        config,
        _volumes: volumes,
    }
}

/// Last-activity timestamp far enough in the past to count as idle.
const STALE: &str = "2020-01-01 00:00:00";

async fn timed_out_session(h: &Harness, id: &str, owner: &str) {
    h.registry.create(id, owner, None).await.unwrap();
    h.registry
        .update_container(id, Some("old-container"), None, SessionStatus::Running)
        .await
        .unwrap();
    h.registry.mark_timeout(id).await.unwrap();
}

#[tokio::test]
async fn test_reaper_times_out_only_stale_sessions() {
    let h = harness().await;

    h.registry.create("stale", "alice", None).await.unwrap();
    h.registry
        .update_container("stale", Some("c-stale"), None, SessionStatus::Running)
        .await
        .unwrap();
    h.registry
        .set_last_activity("stale", Some(STALE))
        .await
        .unwrap();

    h.registry.create("fresh", "alice", None).await.unwrap();
    h.registry
        .update_container("fresh", Some("c-fresh"), None, SessionStatus::Running)
        .await
        .unwrap();
    h.registry.touch_activity("fresh").await.unwrap();

    let reaper = IdleReaper::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());
    let reaped = reaper.reap_once().await.unwrap();
    assert_eq!(reaped, 1);

    let stale = h.registry.get("stale").await.unwrap();
    assert_eq!(stale.status, SessionStatus::Timeout);
    assert!(stale.container_id.is_none());
    assert!(h.runtime.stopped_ids().contains(&"c-stale".to_string()));

    let fresh = h.registry.get("fresh").await.unwrap();
    assert_eq!(fresh.status, SessionStatus::Running);
    assert_eq!(fresh.container_id.as_deref(), Some("c-fresh"));
}

#[tokio::test]
async fn test_reaper_treats_null_activity_as_idle() {
    let h = harness().await;

    h.registry.create("quiet", "alice", None).await.unwrap();
    h.registry
        .update_container("quiet", Some("c-quiet"), None, SessionStatus::Running)
        .await
        .unwrap();
    h.registry.set_last_activity("quiet", None).await.unwrap();

    let reaper = IdleReaper::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());
    assert_eq!(reaper.reap_once().await.unwrap(), 1);
    assert_eq!(
        h.registry.get("quiet").await.unwrap().status,
        SessionStatus::Timeout
    );
}

#[tokio::test]
async fn test_recovery_restarts_timed_out_session() {
    let h = harness().await;
    timed_out_session(&h, "s1", "alice").await;

    let coordinator =
        RecoveryCoordinator::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());

    let session = coordinator.ensure_running("s1", "alice").await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    let container_id = session.container_id.unwrap();
    assert_ne!(container_id, "old-container");
    assert_eq!(h.runtime.create_calls(), 1);

    // The returned row already carries the reset activity timestamp, and
    // a reaper scanning right after recovery must not select the session.
    assert!(session.last_activity_at.is_some());
    let stored = h.registry.get("s1").await.unwrap();
    assert_eq!(stored.container_id.as_deref(), Some(container_id.as_str()));
    assert!(stored.last_activity_at.is_some());
    assert!(h.registry.list_idle(15).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recovery_leaves_other_states_untouched() {
    let h = harness().await;
    h.registry.create("s1", "alice", None).await.unwrap();

    let coordinator =
        RecoveryCoordinator::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());

    let session = coordinator.ensure_running("s1", "alice").await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(h.runtime.create_calls(), 0);
}

#[tokio::test]
async fn test_recovery_rejects_foreign_owner() {
    let h = harness().await;
    timed_out_session(&h, "s1", "alice").await;

    let coordinator =
        RecoveryCoordinator::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());

    let err = coordinator.ensure_running("s1", "mallory").await.unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));
    assert_eq!(h.runtime.create_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_recovery_provisions_once() {
    let h = harness().await;
    timed_out_session(&h, "s1", "alice").await;

    let coordinator = Arc::new(RecoveryCoordinator::new(
        h.registry.clone(),
        h.provisioner.clone(),
        h.config.clone(),
    ));

    let calls = (0..10).map(|_| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.ensure_running("s1", "alice").await })
    });
    let results = join_all(calls).await;

    let mut container_ids = Vec::new();
    for result in results {
        let session = result.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        container_ids.push(session.container_id.unwrap());
    }

    assert_eq!(h.runtime.create_calls(), 1);
    container_ids.dedup();
    assert_eq!(container_ids.len(), 1);
}

#[tokio::test]
async fn test_failed_recovery_marks_session_errored() {
    let h = harness().await;
    timed_out_session(&h, "s1", "alice").await;
    h.runtime.fail_create.store(true, Ordering::SeqCst);

    let coordinator =
        RecoveryCoordinator::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());

    let err = coordinator.ensure_running("s1", "alice").await.unwrap_err();
    assert!(matches!(err, Error::Provisioning(_)));

    let session = h.registry.get("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert!(session.container_id.is_none());
}

#[tokio::test]
async fn test_full_lifecycle_reuses_nothing_across_recovery() {
    let h = harness().await;

    h.registry.create("s1", "alice", None).await.unwrap();
    assert_eq!(
        h.registry.get("s1").await.unwrap().status,
        SessionStatus::Pending
    );

    let first = h
        .provisioner
        .start("s1", ContainerRole::Plain, None)
        .await
        .unwrap();
    h.registry
        .update_container(
            "s1",
            Some(&first.container_id),
            first.base_url.as_deref(),
            SessionStatus::Running,
        )
        .await
        .unwrap();
    h.registry
        .set_last_activity("s1", Some(STALE))
        .await
        .unwrap();

    let reaper = IdleReaper::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());
    assert_eq!(reaper.reap_once().await.unwrap(), 1);
    assert_eq!(
        h.registry.get("s1").await.unwrap().status,
        SessionStatus::Timeout
    );

    let coordinator =
        RecoveryCoordinator::new(h.registry.clone(), h.provisioner.clone(), h.config.clone());
    let recovered = coordinator.ensure_running("s1", "alice").await.unwrap();

    assert_eq!(recovered.status, SessionStatus::Running);
    assert_ne!(recovered.container_id.as_deref(), Some(first.container_id.as_str()));
}

#[tokio::test]
async fn test_agent_provisioning_stages_credentials_in_volume() {
    let db = Database::in_memory().await.unwrap();
    let registry = SessionRegistry::new(db.pool().clone());
    let credentials = Arc::new(SqliteCredentialStore::new(db.pool().clone()));
    hatch::credential::CredentialStore::upsert(credentials.as_ref(), "agent-1", None, "tok-xyz")
        .await
        .unwrap();

    let runtime = Arc::new(MockRuntime::default());
    let volumes = TempDir::new().unwrap();
    let config = OrchestratorConfig {
        volume_root: volumes.path().to_path_buf(),
        ready_timeout_seconds: 2,
        ..Default::default()
    };
    let provisioner = Provisioner::new(runtime.clone(), credentials, config.clone())
        .with_probe(Arc::new(AlwaysReady));

    registry.create("s1", "alice", Some("agent-1")).await.unwrap();
    let provisioned = provisioner
        .start("s1", ContainerRole::Agent, Some("agent-1"))
        .await
        .unwrap();

    assert_eq!(provisioned.host_port, Some(43055));
    assert_eq!(provisioned.base_url.as_deref(), Some("http://127.0.0.1:43055"));

    let auth = std::fs::read_to_string(volumes.path().join("s1").join("auth.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&auth).unwrap();
    assert_eq!(value["github-copilot"]["refresh"], "tok-xyz");
    assert!(volumes.path().join("s1").join("workspace").is_dir());
}

#[tokio::test]
async fn test_agent_provisioning_without_agent_ref_is_rejected() {
    let h = harness().await;

    let err = h
        .provisioner
        .start("s1", ContainerRole::Agent, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(h.runtime.create_calls(), 0);
}
