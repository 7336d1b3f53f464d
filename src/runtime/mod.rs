//! Container runtime boundary.
//!
//! The orchestrator only talks to containers through [`ContainerRuntime`].
//! [`DockerRuntime`] is the production adapter (bollard); [`mock::MockRuntime`]
//! keeps everything in memory for tests and dry runs.

pub mod docker;
pub mod error;
pub mod mock;

use async_trait::async_trait;

pub use docker::{DockerRuntime, connect_docker};
pub use error::{Result, RuntimeError};

/// Resource ceilings applied to every sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
    /// Cap for the `on-failure` restart policy.
    pub restart_max_retries: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            cpu_shares: 512,
            pids_limit: 256,
            restart_max_retries: 3,
        }
    }
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    /// Workload port, published on an ephemeral host port.
    pub internal_port: u16,
    pub limits: ResourceLimits,
}

/// What `create` hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    /// Known up front only for runtimes that assign ports at creation.
    pub assigned_port: Option<u16>,
}

/// Snapshot of a container as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspection {
    pub running: bool,
    pub assigned_port: Option<u16>,
}

/// Create/start/stop/remove/inspect containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerInspection>;
}
