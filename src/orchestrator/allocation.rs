//! Session → route bindings.
//!
//! At most one allocation exists per session. The store's unique key on the
//! session id settles races between concurrent first requests: the loser
//! reads back the winner's binding and retires the container it claimed.

use std::sync::Arc;

use chrono::Utc;

use super::lifecycle::{ContainerManager, LaunchIntent};
use super::pool::PoolManager;
use crate::error::{AllocationError, StoreError};
use crate::model::{AllocationRecord, ContainerRecord, Route};
use crate::store::Store;

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 256;

/// Result of [`AllocationRegistry::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocated {
    pub route: Route,
    /// `false` when the session already had a binding.
    pub created: bool,
}

pub fn validate_session_id(session_id: &str) -> Result<(), AllocationError> {
    let invalid = |reason: &str| {
        Err(AllocationError::InvalidSession {
            reason: reason.to_string(),
        })
    };
    if session_id.trim().is_empty() {
        return invalid("session id is empty");
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return invalid("session id is too long");
    }
    if session_id.chars().any(char::is_control) {
        return invalid("session id contains control characters");
    }
    Ok(())
}

pub struct AllocationRegistry {
    store: Arc<dyn Store>,
    pool: Arc<PoolManager>,
    manager: Arc<ContainerManager>,
}

impl AllocationRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<PoolManager>,
        manager: Arc<ContainerManager>,
    ) -> Self {
        Self {
            store,
            pool,
            manager,
        }
    }

    /// Route for `session_id`, binding a container on first request.
    pub async fn allocate(&self, session_id: &str) -> Result<Allocated, AllocationError> {
        validate_session_id(session_id)?;

        if let Some(existing) = self.store.get_allocation(session_id).await? {
            return Ok(Allocated {
                route: existing.route(),
                created: false,
            });
        }

        let container = match self.pool.acquire().await? {
            Some(container) => container,
            None => {
                tracing::info!(session_id, "Pool empty, launching on demand");
                self.manager
                    .launch_generated(LaunchIntent::Immediate)
                    .await?
            }
        };

        self.bind(session_id, container).await
    }

    async fn bind(
        &self,
        session_id: &str,
        container: ContainerRecord,
    ) -> Result<Allocated, AllocationError> {
        let allocation = AllocationRecord::bind(session_id, &container, Utc::now());
        match self.store.insert_allocation(&allocation).await {
            Ok(()) => {
                tracing::info!(
                    session_id,
                    container_id = %container.id,
                    route = %container.route_name,
                    "Session allocated"
                );
                Ok(Allocated {
                    route: allocation.route(),
                    created: true,
                })
            }
            Err(StoreError::Constraint(reason)) => {
                self.retire(container.id);
                match self.store.get_allocation(session_id).await? {
                    Some(winner) => {
                        tracing::debug!(session_id, "Lost allocation race, using existing binding");
                        Ok(Allocated {
                            route: winner.route(),
                            created: false,
                        })
                    }
                    None => Err(StoreError::Constraint(reason).into()),
                }
            }
            Err(e) => {
                self.retire(container.id);
                Err(e.into())
            }
        }
    }

    /// Remove a claimed container that never got bound.
    fn retire(&self, container_id: String) {
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            if let Err(e) = manager.remove(&container_id).await {
                tracing::error!(container_id = %container_id, error = %e, "Failed to retire unbound container");
            }
        });
    }

    /// Record activity for `session_id`.
    pub async fn heartbeat(&self, session_id: &str) -> Result<(), AllocationError> {
        validate_session_id(session_id)?;
        if self.store.touch_allocation(session_id, Utc::now()).await? {
            tracing::trace!(session_id, "Heartbeat");
            Ok(())
        } else {
            Err(AllocationError::SessionNotFound {
                session_id: session_id.to_string(),
            })
        }
    }
}
