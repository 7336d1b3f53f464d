//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the controller (`serve`, the default)
//! - One reaper pass (`sweep`)
//! - One pool maintenance pass (`maintain`)

mod run;

pub use run::{build_controller, run_maintain_command, run_serve_command, run_sweep_command};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "roomgate")]
#[command(about = "Warm-pooled sandbox containers behind dynamically published nginx routes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Use the in-memory store even if DATABASE_URL is set
    #[arg(long, global = true)]
    pub no_db: bool,

    /// Use the in-memory container runtime instead of Docker
    #[arg(long, global = true)]
    pub mock_runtime: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API, maintain the pool and run the reaper (default)
    Serve,

    /// Reap idle allocations once and exit
    Sweep,

    /// Top up the warm pool once and exit
    Maintain,
}

impl Cli {
    /// Check if we should run the long-lived controller.
    pub fn should_serve(&self) -> bool {
        matches!(self.command, None | Some(Command::Serve))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parse_no_args() {
        let cli = Cli::try_parse_from(["roomgate"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.no_db);
        assert!(!cli.mock_runtime);
        assert!(cli.should_serve());
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["roomgate", "sweep", "--no-db", "--mock-runtime"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Sweep)));
        assert!(cli.no_db);
        assert!(cli.mock_runtime);
        assert!(!cli.should_serve());
    }

    #[test]
    fn command_variants() {
        let cli = Cli::try_parse_from(["roomgate", "serve"]).unwrap();
        assert!(cli.should_serve());
        let cli = Cli::try_parse_from(["roomgate", "maintain"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Maintain)));
    }

    #[test]
    fn unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["roomgate", "gateway"]).is_err());
    }
}
