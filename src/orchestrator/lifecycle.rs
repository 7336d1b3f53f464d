//! Launch and removal of single containers, kept consistent across the
//! runtime, the proxy's routing table and the store.
//!
//! `launch` does not return until the route's reload has resolved, so a
//! route handed to a caller is already servable (best effort; see
//! [`ReloadOutcome::Failed`]). Anything that fails after the runtime has
//! created a container is compensated before the error propagates.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::LaunchSettings;
use crate::error::{LifecycleError, StoreError};
use crate::model::{ContainerRecord, ContainerStatus};
use crate::naming::{generate_route_name, validate_route_name};
use crate::proxy::{ReloadOutcome, RoutePublisher};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::store::Store;

/// How many fresh names to try before giving up on a generated route.
const ROUTE_NAME_ATTEMPTS: usize = 3;

/// Where a freshly launched container ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchIntent {
    /// Warm pool; finishes `Available`.
    Pool,
    /// Handed straight to a session; finishes `Allocated`.
    Immediate,
}

impl LaunchIntent {
    fn target_status(self) -> ContainerStatus {
        match self {
            Self::Pool => ContainerStatus::Available,
            Self::Immediate => ContainerStatus::Allocated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Launched {
        container_id: String,
        route: String,
        status: ContainerStatus,
    },
    Removed {
        container_id: String,
        route: String,
    },
}

/// Progress of a launch, so compensation undoes exactly what was done.
#[derive(Default)]
struct LaunchProgress {
    recorded: bool,
    published: bool,
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    publisher: Arc<RoutePublisher>,
    settings: LaunchSettings,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        publisher: Arc<RoutePublisher>,
        settings: LaunchSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            runtime,
            store,
            publisher,
            settings,
            events,
        }
    }

    pub fn publisher(&self) -> &Arc<RoutePublisher> {
        &self.publisher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Environment handed to the workload: its route and permitted origins.
    pub fn workload_env(&self, route: &str) -> Vec<String> {
        vec![
            format!("SOCKET_PATH={}", route),
            format!("ORIGINS={}", self.settings.origins.join(",")),
        ]
    }

    /// Launch a container of the configured image under a generated route.
    pub async fn launch_generated(
        &self,
        intent: LaunchIntent,
    ) -> Result<ContainerRecord, LifecycleError> {
        let mut attempt = 1;
        loop {
            let route = generate_route_name();
            let env = self.workload_env(&route);
            match self.launch(&self.settings.image, &route, env, intent).await {
                Err(LifecycleError::RouteTaken { route }) if attempt < ROUTE_NAME_ATTEMPTS => {
                    tracing::debug!(%route, attempt, "Generated route collided, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Create, start, route and record one container.
    pub async fn launch(
        &self,
        image: &str,
        route: &str,
        env: Vec<String>,
        intent: LaunchIntent,
    ) -> Result<ContainerRecord, LifecycleError> {
        validate_route_name(route).map_err(|reason| LifecycleError::InvalidRoute {
            route: route.to_string(),
            reason,
        })?;
        if self.store.get_container_by_route(route).await?.is_some() {
            return Err(LifecycleError::RouteTaken {
                route: route.to_string(),
            });
        }

        let spec = ContainerSpec {
            image: image.to_string(),
            name: route.to_string(),
            env,
            internal_port: self.settings.internal_port,
            limits: self.settings.limits.clone(),
        };
        let created = self
            .runtime
            .create(&spec)
            .await
            .map_err(|source| LifecycleError::Runtime {
                container_id: route.to_string(),
                source,
            })?;

        let mut progress = LaunchProgress::default();
        match self
            .bring_up(&created.id, route, intent, created.assigned_port, &mut progress)
            .await
        {
            Ok(record) => {
                tracing::info!(
                    container_id = %record.id,
                    route = %record.route_name,
                    port = record.external_port,
                    status = %record.status,
                    "Container launched"
                );
                let _ = self.events.send(LifecycleEvent::Launched {
                    container_id: record.id.clone(),
                    route: record.route_name.clone(),
                    status: record.status,
                });
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(container_id = %created.id, %route, error = %e, "Launch failed, cleaning up");
                self.compensate(&created.id, route, &progress).await;
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        id: &str,
        route: &str,
        intent: LaunchIntent,
        known_port: Option<u16>,
        progress: &mut LaunchProgress,
    ) -> Result<ContainerRecord, LifecycleError> {
        let runtime_err = |source| LifecycleError::Runtime {
            container_id: id.to_string(),
            source,
        };

        self.runtime.start(id).await.map_err(runtime_err)?;
        let external_port = match known_port {
            Some(port) => port,
            None => self
                .runtime
                .inspect(id)
                .await
                .map_err(runtime_err)?
                .assigned_port
                .ok_or_else(|| {
                    runtime_err(RuntimeError::MissingPort {
                        id: id.to_string(),
                        port: self.settings.internal_port,
                    })
                })?,
        };

        let mut record = ContainerRecord {
            id: id.to_string(),
            route_name: route.to_string(),
            internal_port: self.settings.internal_port,
            external_port,
            status: ContainerStatus::Provisioning,
            created_at: Utc::now(),
        };
        match self.store.insert_container(&record).await {
            Ok(()) => progress.recorded = true,
            Err(StoreError::Constraint(_)) => {
                return Err(LifecycleError::RouteTaken {
                    route: route.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.publisher.publish(route, external_port).await?;
        progress.published = true;

        if self.publisher.reload().await == ReloadOutcome::Failed {
            tracing::warn!(%route, "Proxy reload failed; route may not be live yet");
        }
        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }

        let target = intent.target_status();
        if !self
            .store
            .transition_container(id, ContainerStatus::Provisioning, target)
            .await?
        {
            return Err(LifecycleError::InvalidTransition {
                container_id: id.to_string(),
                from: ContainerStatus::Provisioning.to_string(),
                to: target.to_string(),
            });
        }
        record.status = target;
        Ok(record)
    }

    /// Best-effort undo of a partial launch. Failures are logged only.
    async fn compensate(&self, id: &str, route: &str, progress: &LaunchProgress) {
        if let Err(e) = self.runtime.remove(id).await {
            if !e.is_not_found() {
                tracing::error!(container_id = %id, error = %e, "Failed to remove orphaned container");
            }
        }
        if progress.published {
            if let Err(e) = self.publisher.unpublish(route).await {
                tracing::warn!(%route, error = %e, "Failed to unpublish route of failed launch");
            }
            let _ = self.publisher.reload();
        }
        if progress.recorded {
            if let Err(e) = self.store.delete_container(id).await {
                tracing::warn!(container_id = %id, error = %e, "Failed to delete record of failed launch");
            }
        }
    }

    /// Stop and remove a container, drop its route, then its records.
    ///
    /// The triggered reload is not awaited. Returns the record as it was
    /// before removal began.
    pub async fn remove(&self, container_id: &str) -> Result<ContainerRecord, LifecycleError> {
        let record = self
            .store
            .begin_termination(container_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                container_id: container_id.to_string(),
            })?;

        self.retire_in_runtime(container_id).await?;

        if let Err(e) = self.publisher.unpublish(&record.route_name).await {
            tracing::warn!(
                container_id,
                route = %record.route_name,
                error = %e,
                "Failed to unpublish route; leaving stale fragment"
            );
        }

        self.store.delete_container(container_id).await?;
        let _ = self.publisher.reload();

        tracing::info!(container_id, route = %record.route_name, "Container removed");
        let _ = self.events.send(LifecycleEvent::Removed {
            container_id: container_id.to_string(),
            route: record.route_name.clone(),
        });
        Ok(record)
    }

    /// Stop (if running) and remove. A container the engine no longer knows
    /// counts as removed; any other removal failure is fatal.
    async fn retire_in_runtime(&self, container_id: &str) -> Result<(), LifecycleError> {
        match self.runtime.inspect(container_id).await {
            Ok(inspection) if inspection.running => {
                if let Err(e) = self.runtime.stop(container_id).await {
                    tracing::warn!(container_id, error = %e, "Stop failed, removing anyway");
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(container_id, "Container already gone from runtime");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(container_id, error = %e, "Inspect failed before removal");
            }
        }

        match self.runtime.remove(container_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(LifecycleError::Runtime {
                container_id: container_id.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::ProxyError;
    use crate::model::AllocationRecord;
    use crate::proxy::ProxyReloader;
    use crate::runtime::mock::MockRuntime;
    use crate::store::MemoryStore;

    struct OkReloader;

    #[async_trait]
    impl ProxyReloader for OkReloader {
        async fn reload(&self) -> Result<(), ProxyError> {
            Ok(())
        }
    }

    struct FailingReloader;

    #[async_trait]
    impl ProxyReloader for FailingReloader {
        async fn reload(&self) -> Result<(), ProxyError> {
            Err(ProxyError::ReloadFailed {
                reason: "nginx: [emerg] unexpected end of file".to_string(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        runtime: Arc<MockRuntime>,
        store: Arc<MemoryStore>,
        manager: ContainerManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let conf_dir = dir.path().to_path_buf();
        fixture_with(dir, conf_dir, Arc::new(OkReloader))
    }

    fn fixture_with(
        dir: TempDir,
        conf_dir: std::path::PathBuf,
        reloader: Arc<dyn ProxyReloader>,
    ) -> Fixture {
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RoutePublisher::new(
            conf_dir,
            "host.docker.internal",
            Duration::from_millis(10),
            reloader,
        ));
        let settings = LaunchSettings {
            origins: vec!["https://a.example".to_string(), "https://b.example".to_string()],
            settle: Duration::ZERO,
            ..LaunchSettings::default()
        };
        let manager = ContainerManager::new(runtime.clone(), store.clone(), publisher, settings);
        Fixture {
            _dir: dir,
            runtime,
            store,
            manager,
        }
    }

    #[tokio::test]
    async fn test_launch_for_pool_ends_available() {
        let f = fixture();
        let record = f
            .manager
            .launch("runner-prod", "calm-fox-abc12", vec![], LaunchIntent::Pool)
            .await
            .unwrap();

        assert_eq!(record.status, ContainerStatus::Available);
        assert_eq!(record.internal_port, 5000);
        assert!(f.manager.publisher().is_published("calm-fox-abc12").await);
        assert_eq!(f.manager.publisher().reload_generation(), 1);
        let stored = f.store.get_container(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContainerStatus::Available);
        assert_eq!(stored.external_port, record.external_port);
    }

    #[tokio::test]
    async fn test_launch_immediate_ends_allocated() {
        let f = fixture();
        let record = f
            .manager
            .launch_generated(LaunchIntent::Immediate)
            .await
            .unwrap();
        assert_eq!(record.status, ContainerStatus::Allocated);
    }

    #[tokio::test]
    async fn test_workload_env_contract() {
        let f = fixture();
        let record = f
            .manager
            .launch_generated(LaunchIntent::Pool)
            .await
            .unwrap();
        let env = f.runtime.env_of(&record.id).unwrap();
        assert!(env.contains(&format!("SOCKET_PATH={}", record.route_name)));
        assert!(env.contains(&"ORIGINS=https://a.example,https://b.example".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_route_rejected_before_runtime() {
        let f = fixture();
        let err = f
            .manager
            .launch("runner-prod", "../etc", vec![], LaunchIntent::Pool)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidRoute { .. }));
        assert_eq!(f.runtime.created_total(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_route_rejected() {
        let f = fixture();
        f.manager
            .launch("runner-prod", "calm-fox-abc12", vec![], LaunchIntent::Pool)
            .await
            .unwrap();
        let err = f
            .manager
            .launch("runner-prod", "calm-fox-abc12", vec![], LaunchIntent::Pool)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::RouteTaken { .. }));
        assert_eq!(f.runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_removes_orphan() {
        let f = fixture();
        f.runtime.set_fail_start(true);

        let err = f
            .manager
            .launch_generated(LaunchIntent::Pool)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Runtime { .. }));
        assert_eq!(f.runtime.created_total(), 1);
        assert_eq!(f.runtime.container_count(), 0);
        assert_eq!(f.store.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_failure_propagates_without_cleanup() {
        let f = fixture();
        f.runtime.set_fail_create(true);
        let err = f
            .manager
            .launch_generated(LaunchIntent::Pool)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Runtime { .. }));
        assert_eq!(f.runtime.removed_total(), 0);
    }

    #[tokio::test]
    async fn test_remove_clears_everything() {
        let f = fixture();
        let mut events = f.manager.subscribe();
        let record = f
            .manager
            .launch_generated(LaunchIntent::Immediate)
            .await
            .unwrap();
        f.store
            .insert_allocation(&AllocationRecord::bind("room-1", &record, Utc::now()))
            .await
            .unwrap();

        let removed = f.manager.remove(&record.id).await.unwrap();
        assert_eq!(removed.route_name, record.route_name);

        assert!(!f.runtime.exists(&record.id));
        assert!(f.store.get_container(&record.id).await.unwrap().is_none());
        assert!(f.store.get_allocation("room-1").await.unwrap().is_none());
        assert!(!f.manager.publisher().is_published(&record.route_name).await);

        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Launched { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Removed {
                container_id: record.id.clone(),
                route: record.route_name.clone(),
            }
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let f = fixture();
        let err = f.manager.remove("mock-999999").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_runtime_failure_is_fatal_and_retryable() {
        let f = fixture();
        let record = f
            .manager
            .launch_generated(LaunchIntent::Pool)
            .await
            .unwrap();

        f.runtime.set_fail_remove(true);
        let err = f.manager.remove(&record.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Runtime { .. }));
        let stuck = f.store.get_container(&record.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, ContainerStatus::Terminating);

        f.runtime.set_fail_remove(false);
        f.manager.remove(&record.id).await.unwrap();
        assert!(f.store.get_container(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_tolerates_container_already_gone() {
        let f = fixture();
        let record = f
            .manager
            .launch_generated(LaunchIntent::Pool)
            .await
            .unwrap();
        f.runtime.remove(&record.id).await.unwrap();

        f.manager.remove(&record.id).await.unwrap();
        assert!(f.store.get_container(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_survives_unpublish_failure() {
        let f = fixture();
        let record = f
            .manager
            .launch_generated(LaunchIntent::Immediate)
            .await
            .unwrap();
        f.store
            .insert_allocation(&AllocationRecord::bind("room-1", &record, Utc::now()))
            .await
            .unwrap();

        // A non-empty directory where the fragment file should be.
        let path = f.manager.publisher().fragment_path(&record.route_name);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();
        assert!(f.manager.publisher().unpublish(&record.route_name).await.is_err());

        f.manager.remove(&record.id).await.unwrap();
        assert!(!f.runtime.exists(&record.id));
        assert!(f.store.get_container(&record.id).await.unwrap().is_none());
        assert!(f.store.get_allocation("room-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_compensates() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let f = fixture_with(dir, missing, Arc::new(OkReloader));

        let err = f
            .manager
            .launch_generated(LaunchIntent::Pool)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Proxy(ProxyError::Write { .. })));
        assert_eq!(f.runtime.created_total(), 1);
        assert_eq!(f.runtime.container_count(), 0);
        assert_eq!(f.store.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_reload_failure_still_launches() {
        let dir = TempDir::new().unwrap();
        let conf_dir = dir.path().to_path_buf();
        let f = fixture_with(dir, conf_dir, Arc::new(FailingReloader));
        let mut outcomes = f.manager.publisher().subscribe();

        let record = f
            .manager
            .launch("runner-prod", "calm-fox-abc12", vec![], LaunchIntent::Pool)
            .await
            .unwrap();

        assert_eq!(outcomes.recv().await.unwrap(), ReloadOutcome::Failed);
        assert_eq!(record.status, ContainerStatus::Available);
        assert!(f.manager.publisher().is_published("calm-fox-abc12").await);
        let stored = f.store.get_container(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContainerStatus::Available);
    }
}
