//! Persistent container and allocation state.
//!
//! The store is the only mutual-exclusion primitive the orchestrator relies
//! on: unique keys reject duplicate sessions and routes, and status changes
//! are compare-and-set so two callers can never claim the same container.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{AllocationRecord, ContainerRecord, ContainerStatus};

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Containers ====================

    /// Insert a new record. Fails with `Constraint` on a duplicate id or route.
    async fn insert_container(&self, record: &ContainerRecord) -> Result<(), StoreError>;

    async fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError>;

    async fn get_container_by_route(
        &self,
        route_name: &str,
    ) -> Result<Option<ContainerRecord>, StoreError>;

    async fn count_containers(&self, status: ContainerStatus) -> Result<usize, StoreError>;

    /// Containers in `status`, oldest first.
    async fn list_containers_by_status(
        &self,
        status: ContainerStatus,
    ) -> Result<Vec<ContainerRecord>, StoreError>;

    /// Move `id` from `from` to `to` if it is still in `from`.
    ///
    /// Returns `false` when the record is missing, in another state, or when
    /// `to` is not forward of `from`.
    async fn transition_container(
        &self,
        id: &str,
        from: ContainerStatus,
        to: ContainerStatus,
    ) -> Result<bool, StoreError>;

    /// Atomically mark the oldest `Available` container `Allocated`.
    async fn claim_available(&self) -> Result<Option<ContainerRecord>, StoreError>;

    /// Mark `id` `Terminating` and drop its allocation in one step.
    ///
    /// Returns the record as it was before the change, or `None` if absent.
    async fn begin_termination(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError>;

    /// Delete a container together with any allocation pointing at it.
    async fn delete_container(&self, id: &str) -> Result<bool, StoreError>;

    // ==================== Allocations ====================

    /// Insert a binding. Fails with `Constraint` on a duplicate session or
    /// route, or when the container is not `Allocated`.
    async fn insert_allocation(&self, allocation: &AllocationRecord) -> Result<(), StoreError>;

    async fn get_allocation(&self, session_id: &str)
    -> Result<Option<AllocationRecord>, StoreError>;

    /// Advance `last_activity` to `at` (never backwards). `false` if unknown.
    async fn touch_allocation(&self, session_id: &str, at: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Allocations whose `last_activity` is strictly before `cutoff`.
    async fn list_idle_allocations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AllocationRecord>, StoreError>;

    async fn delete_allocation(&self, session_id: &str) -> Result<bool, StoreError>;
}
