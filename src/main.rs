//! cluster-http: multi-process HTTP/1.x server.
//!
//! ```text
//!                   ┌────────────── master ──────────────┐
//!  Client ─ TCP ──▶ │ Listener → Acceptor → RoundRobin   │
//!                   │                │ SCM_RIGHTS         │
//!                   └────────────────┼───────────────────┘
//!                     ┌──────────────┼──────────────┐
//!                     ▼              ▼              ▼
//!                  worker 1       worker 2       worker N
//!                  Session → parser → handler → ResponseChannel
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use cluster_http::config::{load_config, validation::validate_config, Role, ServerConfig};
use cluster_http::lifecycle::startup;
use cluster_http::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "cluster-http", version, about = "Multi-process HTTP server with connection handoff")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the listener bind address (host:port)
    #[arg(short, long, global = true)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept and serve in a single process
    Standalone,
    /// Accept and hand connections to worker processes
    Master {
        /// Number of workers to spawn
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Serve connections handed over by a master
    Worker {
        /// Master's cluster socket
        #[arg(long)]
        cluster_socket: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    match cli.command {
        Commands::Standalone => config.cluster.role = Role::Standalone,
        Commands::Master { workers } => {
            config.cluster.role = Role::Master;
            if let Some(workers) = workers {
                config.cluster.workers = workers;
            }
        }
        Commands::Worker { cluster_socket } => {
            config.cluster.role = Role::Worker;
            if let Some(path) = cluster_socket {
                config.cluster.socket_path = path;
            }
        }
    }

    if let Err(errors) = validate_config(&config) {
        for error in errors {
            eprintln!("Invalid configuration: {error}");
        }
        return ExitCode::FAILURE;
    }

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match startup::run(config, cli.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}
