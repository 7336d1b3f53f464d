//! Warm pool of started, routed, unallocated containers.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;

use super::lifecycle::{ContainerManager, LaunchIntent};
use crate::error::StoreError;
use crate::model::{ContainerRecord, ContainerStatus};
use crate::store::Store;

/// Outcome of one `maintain` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintainReport {
    /// Deficit found at the start of the pass.
    pub requested: usize,
    pub launched: usize,
    pub failed: usize,
}

pub struct PoolManager {
    manager: Arc<ContainerManager>,
    store: Arc<dyn Store>,
    target: usize,
    /// Overlapping passes would both see the same deficit and overshoot.
    maintaining: Mutex<()>,
}

impl PoolManager {
    pub fn new(manager: Arc<ContainerManager>, store: Arc<dyn Store>, target: usize) -> Self {
        Self {
            manager,
            store,
            target,
            maintaining: Mutex::new(()),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub async fn available(&self) -> Result<usize, StoreError> {
        self.store.count_containers(ContainerStatus::Available).await
    }

    /// Launch enough containers to bring the pool back to its target.
    ///
    /// Launches run concurrently; a failed launch is logged and counted but
    /// does not stop its siblings.
    pub async fn maintain(&self) -> Result<MaintainReport, StoreError> {
        let _guard = self.maintaining.lock().await;

        let available = self.available().await?;
        let deficit = self.target.saturating_sub(available);
        if deficit == 0 {
            tracing::debug!(available, target = self.target, "Pool is full");
            return Ok(MaintainReport::default());
        }

        tracing::info!(available, target = self.target, deficit, "Replenishing pool");
        let results = join_all(
            (0..deficit).map(|_| self.manager.launch_generated(LaunchIntent::Pool)),
        )
        .await;

        let mut report = MaintainReport {
            requested: deficit,
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(_) => report.launched += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(error = %e, "Pool container failed to launch");
                }
            }
        }

        tracing::info!(
            launched = report.launched,
            failed = report.failed,
            "Pool maintenance finished"
        );
        Ok(report)
    }

    /// Take the oldest available container, if any, and backfill in the
    /// background.
    pub async fn acquire(self: &Arc<Self>) -> Result<Option<ContainerRecord>, StoreError> {
        let claimed = self.store.claim_available().await?;

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.maintain().await {
                tracing::warn!(error = %e, "Background pool maintenance failed");
            }
        });

        match &claimed {
            Some(record) => {
                tracing::debug!(container_id = %record.id, route = %record.route_name, "Acquired pooled container")
            }
            None => tracing::debug!("Pool empty"),
        }
        Ok(claimed)
    }
}
