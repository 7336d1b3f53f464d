//! Container orchestration.
//!
//! ```text
//!   allocate(session) ──▶ AllocationRegistry ──▶ PoolManager::acquire ──▶ Store (claim)
//!                                 │                     └── spawn maintain ──▶ ContainerManager::launch
//!                                 └── pool empty ──▶ ContainerManager::launch (immediate)
//!
//!   Reaper (cron) ──▶ Store (idle allocations) ──▶ ContainerManager::remove
//! ```

pub mod allocation;
pub mod lifecycle;
pub mod pool;
pub mod reaper;

use std::sync::Arc;

pub use allocation::{Allocated, AllocationRegistry};
pub use lifecycle::{ContainerManager, LaunchIntent, LifecycleEvent};
pub use pool::{MaintainReport, PoolManager};
pub use reaper::{Reaper, SweepReport};

use crate::config::{LaunchSettings, ReaperSettings};
use crate::proxy::RoutePublisher;
use crate::runtime::ContainerRuntime;
use crate::store::Store;

/// The wired-up set of orchestration components sharing one store,
/// runtime and publisher.
#[derive(Clone)]
pub struct Controller {
    pub store: Arc<dyn Store>,
    pub manager: Arc<ContainerManager>,
    pub pool: Arc<PoolManager>,
    pub registry: Arc<AllocationRegistry>,
    pub reaper: Arc<Reaper>,
}

impl Controller {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        publisher: Arc<RoutePublisher>,
        launch: LaunchSettings,
        pool_size: usize,
        reaper: ReaperSettings,
    ) -> Self {
        let manager = Arc::new(ContainerManager::new(
            runtime,
            Arc::clone(&store),
            publisher,
            launch,
        ));
        let pool = Arc::new(PoolManager::new(
            Arc::clone(&manager),
            Arc::clone(&store),
            pool_size,
        ));
        let registry = Arc::new(AllocationRegistry::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&manager),
        ));
        let reaper = Arc::new(Reaper::new(Arc::clone(&store), Arc::clone(&manager), reaper));
        Self {
            store,
            manager,
            pool,
            registry,
            reaper,
        }
    }
}
