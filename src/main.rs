//! roomgate - main entry point.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use roomgate::ControllerConfig;
use roomgate::cli::{
    Cli, Command, build_controller, run_maintain_command, run_serve_command, run_sweep_command,
};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("roomgate=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // LOG_FORMAT may come from .env
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = ControllerConfig::from_env()?;
    tracing::info!(
        image = %config.launch.image,
        pool_size = config.pool_size,
        "Loaded configuration"
    );

    let controller = build_controller(&config, cli.no_db, cli.mock_runtime).await?;

    if cli.should_serve() {
        return run_serve_command(controller, &config).await;
    }
    match cli.command {
        Some(Command::Sweep) => run_sweep_command(controller).await,
        Some(Command::Maintain) => run_maintain_command(controller).await,
        None | Some(Command::Serve) => Ok(()),
    }
}
