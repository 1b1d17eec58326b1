//! terraplaned — the Terraplane daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Secret vault, quota accountant, dependency graph
//! - Deployment service
//! - Config compiler + provisioning tool executor
//! - Per-project queue workers
//! - REST API
//!
//! # Usage
//!
//! ```text
//! terraplaned serve --config /etc/terraplane/terraplane.toml --port 8480
//! terraplaned config --config /etc/terraplane/terraplane.toml
//! ```

mod control_plane;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "terraplaned", about = "Terraplane control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API and run the queue workers.
    Serve {
        /// Path to terraplane.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,terraplane=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let config = control_plane::load_config(config.as_deref(), port, data_dir)?;
            control_plane::run_control_plane(config).await
        }
        Command::Config { config } => {
            let config = control_plane::load_config(config.as_deref(), None, None)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
