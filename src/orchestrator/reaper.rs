//! Idle allocation reaper.
//!
//! Fires on a cron schedule and removes every allocation whose last heartbeat
//! is older than the inactivity threshold, together with its container.
//! Containers left in `terminating` by an earlier failed removal are retried
//! on every sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use super::lifecycle::ContainerManager;
use crate::config::ReaperSettings;
use crate::error::{LifecycleError, StoreError};
use crate::model::ContainerStatus;
use crate::store::Store;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle allocations plus stranded containers found.
    pub examined: usize,
    pub reaped: usize,
    pub failed: usize,
}

pub struct Reaper {
    store: Arc<dyn Store>,
    manager: Arc<ContainerManager>,
    schedule: Schedule,
    inactivity: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn Store>, manager: Arc<ContainerManager>, settings: ReaperSettings) -> Self {
        Self {
            store,
            manager,
            schedule: settings.schedule,
            inactivity: settings.inactivity,
        }
    }

    pub fn inactivity(&self) -> Duration {
        self.inactivity
    }

    /// Allocations with `last_activity` strictly before this are idle.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let threshold = chrono::Duration::from_std(self.inactivity).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Reap everything idle as of `now`. One failing item never stops the rest.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let stranded = self
            .store
            .list_containers_by_status(ContainerStatus::Terminating)
            .await?;
        let idle = self.store.list_idle_allocations(self.cutoff(now)).await?;
        let mut report = SweepReport {
            examined: stranded.len() + idle.len(),
            ..Default::default()
        };

        for container in stranded {
            match self.manager.remove(&container.id).await {
                Ok(_) | Err(LifecycleError::NotFound { .. }) => report.reaped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        container_id = %container.id,
                        error = %e,
                        "Failed to finish removing stranded container"
                    );
                }
            }
        }

        for allocation in idle {
            let removed = match self.manager.remove(&allocation.container_id).await {
                Ok(_) => true,
                // Container record already gone; only the binding is left.
                Err(LifecycleError::NotFound { .. }) => true,
                Err(e) => {
                    tracing::warn!(
                        session_id = %allocation.session_id,
                        container_id = %allocation.container_id,
                        error = %e,
                        "Failed to reap idle allocation"
                    );
                    false
                }
            };
            if !removed {
                report.failed += 1;
                continue;
            }

            match self.store.delete_allocation(&allocation.session_id).await {
                Ok(_) => {
                    report.reaped += 1;
                    tracing::info!(
                        session_id = %allocation.session_id,
                        route = %allocation.route_name,
                        last_activity = %allocation.last_activity,
                        "Reaped idle allocation"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(session_id = %allocation.session_id, error = %e, "Failed to delete reaped allocation");
                }
            }
        }

        Ok(report)
    }

    /// Start the scheduled sweep loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                schedule = %self.schedule,
                inactivity_secs = self.inactivity.as_secs(),
                "Reaper started"
            );

            loop {
                let Some(next) = self.schedule.upcoming(Utc).next() else {
                    tracing::warn!("Reaper schedule has no further firings, stopping");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                match self.sweep(Utc::now()).await {
                    Ok(report) => {
                        if report.examined > 0 {
                            tracing::info!(
                                examined = report.examined,
                                reaped = report.reaped,
                                failed = report.failed,
                                "Reaper sweep finished"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Reaper sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::config::LaunchSettings;
    use crate::proxy::RoutePublisher;
    use crate::runtime::mock::MockRuntime;
    use crate::store::MemoryStore;

    struct NeverReloads;

    #[async_trait::async_trait]
    impl crate::proxy::ProxyReloader for NeverReloads {
        async fn reload(&self) -> Result<(), crate::error::ProxyError> {
            Ok(())
        }
    }

    fn reaper(minutes: u64) -> Reaper {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RoutePublisher::new(
            std::env::temp_dir(),
            "localhost",
            Duration::from_millis(10),
            Arc::new(NeverReloads),
        ));
        let manager = Arc::new(ContainerManager::new(
            Arc::new(MockRuntime::new()),
            store.clone(),
            publisher,
            LaunchSettings::default(),
        ));
        let settings =
            ReaperSettings::new("0 */15 * * * *", Duration::from_secs(minutes * 60)).unwrap();
        Reaper::new(store, manager, settings)
    }

    #[test]
    fn test_cutoff_subtracts_threshold() {
        let reaper = reaper(45);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            reaper.cutoff(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 11, 15, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_sweep_on_empty_store() {
        let reaper = reaper(45);
        assert_eq!(reaper.sweep(Utc::now()).await.unwrap(), SweepReport::default());
    }
}
