//! In-process store.
//!
//! One lock guards both tables, so every trait method is atomic with respect
//! to every other. State is lost on restart; production uses Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::Store;
use crate::error::StoreError;
use crate::model::{AllocationRecord, ContainerRecord, ContainerStatus};

#[derive(Default)]
struct Tables {
    containers: HashMap<String, ContainerRecord>,
    /// Keyed by session id.
    allocations: HashMap<String, AllocationRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn container_count(&self) -> usize {
        self.tables.read().await.containers.len()
    }

    pub async fn allocation_count(&self) -> usize {
        self.tables.read().await.allocations.len()
    }

    pub async fn list_containers(&self) -> Vec<ContainerRecord> {
        let mut all: Vec<_> = self
            .tables
            .read()
            .await
            .containers
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_container(&self, record: &ContainerRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.containers.contains_key(&record.id) {
            return Err(StoreError::Constraint(format!(
                "container {} already exists",
                record.id
            )));
        }
        if tables
            .containers
            .values()
            .any(|c| c.route_name == record.route_name)
        {
            return Err(StoreError::Constraint(format!(
                "route {} already exists",
                record.route_name
            )));
        }
        tables.containers.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self.tables.read().await.containers.get(id).cloned())
    }

    async fn get_container_by_route(
        &self,
        route_name: &str,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .containers
            .values()
            .find(|c| c.route_name == route_name)
            .cloned())
    }

    async fn count_containers(&self, status: ContainerStatus) -> Result<usize, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .containers
            .values()
            .filter(|c| c.status == status)
            .count())
    }

    async fn list_containers_by_status(
        &self,
        status: ContainerStatus,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self
            .list_containers()
            .await
            .into_iter()
            .filter(|c| c.status == status)
            .collect())
    }

    async fn transition_container(
        &self,
        id: &str,
        from: ContainerStatus,
        to: ContainerStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let mut tables = self.tables.write().await;
        match tables.containers.get_mut(id) {
            Some(record) if record.status == from => {
                record.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_available(&self) -> Result<Option<ContainerRecord>, StoreError> {
        let mut tables = self.tables.write().await;
        let oldest = tables
            .containers
            .values()
            .filter(|c| c.status == ContainerStatus::Available)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|c| c.id.clone());

        Ok(oldest.and_then(|id| {
            let record = tables.containers.get_mut(&id)?;
            record.status = ContainerStatus::Allocated;
            Some(record.clone())
        }))
    }

    async fn begin_termination(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.containers.get_mut(id) else {
            return Ok(None);
        };
        let before = record.clone();
        record.status = ContainerStatus::Terminating;
        tables.allocations.retain(|_, a| a.container_id != id);
        Ok(Some(before))
    }

    async fn delete_container(&self, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        tables.allocations.retain(|_, a| a.container_id != id);
        Ok(tables.containers.remove(id).is_some())
    }

    async fn insert_allocation(&self, allocation: &AllocationRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.allocations.contains_key(&allocation.session_id) {
            return Err(StoreError::Constraint(format!(
                "session {} already allocated",
                allocation.session_id
            )));
        }
        if tables
            .allocations
            .values()
            .any(|a| a.route_name == allocation.route_name)
        {
            return Err(StoreError::Constraint(format!(
                "route {} already allocated",
                allocation.route_name
            )));
        }
        match tables.containers.get(&allocation.container_id) {
            Some(c) if c.status == ContainerStatus::Allocated => {}
            Some(c) => {
                return Err(StoreError::Constraint(format!(
                    "container {} is {}, not allocated",
                    c.id, c.status
                )));
            }
            None => {
                return Err(StoreError::Constraint(format!(
                    "container {} does not exist",
                    allocation.container_id
                )));
            }
        }
        tables
            .allocations
            .insert(allocation.session_id.clone(), allocation.clone());
        Ok(())
    }

    async fn get_allocation(
        &self,
        session_id: &str,
    ) -> Result<Option<AllocationRecord>, StoreError> {
        Ok(self.tables.read().await.allocations.get(session_id).cloned())
    }

    async fn touch_allocation(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.allocations.get_mut(session_id) {
            Some(allocation) => {
                allocation.last_activity = allocation.last_activity.max(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_idle_allocations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AllocationRecord>, StoreError> {
        let mut idle: Vec<_> = self
            .tables
            .read()
            .await
            .allocations
            .values()
            .filter(|a| a.last_activity < cutoff)
            .cloned()
            .collect();
        idle.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
        Ok(idle)
    }

    async fn delete_allocation(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .write()
            .await
            .allocations
            .remove(session_id)
            .is_some())
    }
}
