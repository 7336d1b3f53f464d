//! Container and allocation records shared by the store and the orchestrator.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a provisioned container.
///
/// States only ever move forward: `Provisioning -> Available -> Allocated ->
/// Terminating`. A container launched for immediate use skips `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Provisioning,
    Available,
    Allocated,
    Terminating,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Available => "available",
            Self::Allocated => "allocated",
            Self::Terminating => "terminating",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Provisioning => 0,
            Self::Available => 1,
            Self::Allocated => 2,
            Self::Terminating => 3,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_transition_to(&self, next: ContainerStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "available" => Ok(Self::Available),
            "allocated" => Ok(Self::Allocated),
            "terminating" => Ok(Self::Terminating),
            other => Err(format!("unknown container status '{}'", other)),
        }
    }
}

/// A provisioned sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Runtime-assigned container id.
    pub id: String,
    /// Route path segment; also used as the container name.
    pub route_name: String,
    /// Port the workload listens on inside the container.
    pub internal_port: u16,
    /// Ephemeral host port the runtime bound to `internal_port`.
    pub external_port: u16,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
}

/// Binding of a caller session to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub session_id: String,
    pub route_name: String,
    pub container_id: String,
    pub allocated_at: DateTime<Utc>,
    /// Only moves forward, and only through heartbeats.
    pub last_activity: DateTime<Utc>,
}

impl AllocationRecord {
    /// Bind `session_id` to `container` with both timestamps set to `now`.
    pub fn bind(session_id: &str, container: &ContainerRecord, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            route_name: container.route_name.clone(),
            container_id: container.id.clone(),
            allocated_at: now,
            last_activity: now,
        }
    }

    pub fn route(&self) -> Route {
        Route(self.route_name.clone())
    }
}

/// The path segment under which a container is reachable through the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route(pub String);

impl Route {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
