//! Wiring shared by the subcommands.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::{self, ApiServer, ApiState};
use crate::config::ControllerConfig;
use crate::orchestrator::Controller;
use crate::proxy::{CommandReloader, RoutePublisher};
use crate::runtime::mock::MockRuntime;
use crate::runtime::{ContainerRuntime, DockerRuntime, connect_docker};
use crate::store::{MemoryStore, Store};

async fn open_store(config: &ControllerConfig, no_db: bool) -> anyhow::Result<Arc<dyn Store>> {
    if no_db {
        tracing::warn!("Running with the in-memory store (--no-db); state is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    match config.database_url.as_deref() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = crate::store::PostgresStore::connect(url).await?;
            store.run_migrations().await?;
            tracing::info!("Database connected and migrations applied");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            anyhow::bail!("DATABASE_URL is set but roomgate was built without the postgres feature")
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn open_runtime(mock: bool) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    if mock {
        tracing::warn!("Using the in-memory container runtime (--mock-runtime)");
        return Ok(Arc::new(MockRuntime::new()));
    }
    let docker = connect_docker().await?;
    tracing::info!("Connected to Docker");
    Ok(Arc::new(DockerRuntime::with_client(docker)))
}

/// Assemble the controller from configuration.
pub async fn build_controller(
    config: &ControllerConfig,
    no_db: bool,
    mock_runtime: bool,
) -> anyhow::Result<Controller> {
    let store = open_store(config, no_db).await?;
    let runtime = open_runtime(mock_runtime).await?;

    let reloader = CommandReloader::from_command_line(&config.proxy.reload_command)
        .ok_or_else(|| anyhow::anyhow!("NGINX_RELOAD_COMMAND is empty"))?;
    tracing::info!(
        conf_dir = %config.proxy.conf_dir.display(),
        command = %reloader.command_line(),
        debounce_ms = config.proxy.debounce.as_millis() as u64,
        "Route publisher configured"
    );
    let publisher = Arc::new(RoutePublisher::new(
        config.proxy.conf_dir.clone(),
        config.proxy.upstream_host.clone(),
        config.proxy.debounce,
        Arc::new(reloader),
    ));

    Ok(Controller::new(
        runtime,
        store,
        publisher,
        config.launch.clone(),
        config.pool_size,
        config.reaper.clone(),
    ))
}

/// Serve until Ctrl-C.
pub async fn run_serve_command(controller: Controller, config: &ControllerConfig) -> anyhow::Result<()> {
    let reaper = Arc::clone(&controller.reaper).spawn();

    let pool = Arc::clone(&controller.pool);
    tokio::spawn(async move {
        if let Err(e) = pool.maintain().await {
            tracing::warn!(error = %e, "Initial pool maintenance failed");
        }
    });

    let router = api::router(
        ApiState {
            registry: Arc::clone(&controller.registry),
        },
        &config.launch.origins,
    );
    let addr = SocketAddr::new(config.http.bind_addr, config.http.port);
    let mut server = ApiServer::new(addr, router);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    server.shutdown().await;
    reaper.abort();
    tracing::info!("Controller stopped");
    Ok(())
}

pub async fn run_sweep_command(controller: Controller) -> anyhow::Result<()> {
    let report = controller.reaper.sweep(chrono::Utc::now()).await?;
    println!(
        "examined {}  reaped {}  failed {}",
        report.examined, report.reaped, report.failed
    );
    if report.reaped > 0 {
        // Joins the reload the removals already requested.
        controller.manager.publisher().reload().await;
    }
    Ok(())
}

pub async fn run_maintain_command(controller: Controller) -> anyhow::Result<()> {
    let report = controller.pool.maintain().await?;
    let available = controller.pool.available().await?;
    println!(
        "requested {}  launched {}  failed {}  available {}/{}",
        report.requested,
        report.launched,
        report.failed,
        available,
        controller.pool.target()
    );
    Ok(())
}
