//! In-memory container runtime.
//!
//! Hands out sequential ids and host ports, tracks running state, and can be
//! told to fail specific calls. Used by the test suites and by anything that
//! wants to exercise the orchestrator without a Docker daemon.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use async_trait::async_trait;

use super::error::{Result, RuntimeError};
use super::{ContainerInspection, ContainerRuntime, ContainerSpec, CreatedContainer};

const FIRST_HOST_PORT: u16 = 49152;

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
    port: u16,
}

/// A fake engine that never touches the host.
#[derive(Debug)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    next_id: AtomicU64,
    next_port: AtomicU16,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_remove: AtomicBool,
    unavailable: AtomicBool,
    created: AtomicU64,
    removed: AtomicU64,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_port: AtomicU16::new(FIRST_HOST_PORT),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `create` call fail with an engine error.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every `start` call fail (the container is still created).
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make every `remove` call fail with an engine error.
    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// Simulate an unreachable daemon for all calls.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Containers that currently exist in the fake engine.
    pub fn container_count(&self) -> usize {
        self.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().values().filter(|c| c.running).count()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Environment the container was created with.
    pub fn env_of(&self, id: &str) -> Option<Vec<String>> {
        self.lock().get(id).map(|c| c.spec.env.clone())
    }

    /// Total successful `create` calls.
    pub fn created_total(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Total successful `remove` calls.
    pub fn removed_total(&self) -> u64 {
        self.removed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable {
                reason: "mock engine offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        self.check_available()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Engine {
                reason: format!("image {} not found", spec.image),
            });
        }

        let mut containers = self.lock();
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::Engine {
                reason: format!("name {} already in use (409)", spec.name),
            });
        }

        let id = format!("mock-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
                port,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(CreatedContainer {
            id,
            assigned_port: None,
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.check_available()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Engine {
                reason: "port is already allocated".to_string(),
            });
        }
        match self.lock().get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound { id: id.to_string() }),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.check_available()?;
        match self.lock().get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound { id: id.to_string() }),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.check_available()?;
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(RuntimeError::Engine {
                reason: "removal of container is already in progress".to_string(),
            });
        }
        match self.lock().remove(id) {
            Some(_) => {
                self.removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RuntimeError::NotFound { id: id.to_string() }),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection> {
        self.check_available()?;
        match self.lock().get(id) {
            Some(container) => Ok(ContainerInspection {
                running: container.running,
                assigned_port: container.running.then_some(container.port),
            }),
            None => Err(RuntimeError::NotFound { id: id.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ResourceLimits;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            image: "runner-prod".to_string(),
            name: name.to_string(),
            env: Vec::new(),
            internal_port: 5000,
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_port_assigned_once_running() {
        let runtime = MockRuntime::new();
        let created = runtime.create(&spec("a")).await.unwrap();

        let before = runtime.inspect(&created.id).await.unwrap();
        assert!(!before.running);
        assert_eq!(before.assigned_port, None);

        runtime.start(&created.id).await.unwrap();
        let after = runtime.inspect(&created.id).await.unwrap();
        assert!(after.running);
        assert_eq!(after.assigned_port, Some(FIRST_HOST_PORT));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let runtime = MockRuntime::new();
        runtime.create(&spec("a")).await.unwrap();
        let err = runtime.create(&spec("a")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Engine { .. }));
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let runtime = MockRuntime::new();
        let err = runtime.remove("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unavailable_fails_everything() {
        let runtime = MockRuntime::new();
        runtime.set_unavailable(true);
        assert!(matches!(
            runtime.create(&spec("a")).await,
            Err(RuntimeError::Unavailable { .. })
        ));
        assert!(matches!(
            runtime.inspect("x").await,
            Err(RuntimeError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_counters() {
        let runtime = MockRuntime::new();
        let a = runtime.create(&spec("a")).await.unwrap();
        runtime.create(&spec("b")).await.unwrap();
        runtime.remove(&a.id).await.unwrap();
        assert_eq!(runtime.created_total(), 2);
        assert_eq!(runtime.removed_total(), 1);
        assert_eq!(runtime.container_count(), 1);
    }
}
