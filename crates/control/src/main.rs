mod cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleet")]
#[command(about = "fleet control plane: job queue, result application and reconciliation", version)]
struct Cli {
    /// Path to control.toml (defaults to the data dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent API and every reconcile loop
    Serve,
    /// Queue a job for an agent
    Dispatch {
        #[arg(long)]
        agent: String,
        #[arg(long = "type")]
        job_type: String,
        /// Payload field (repeatable): key=value, values parsed as JSON when possible
        #[arg(long = "param")]
        params: Vec<String>,
        /// Record an invalid payload as a failed job instead of rejecting it
        #[arg(long, default_value_t = false)]
        log_failures: bool,
    },
    /// List jobs, newest first
    Jobs {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one job
    Job { id: String },
    /// Cancel a queued job
    Cancel { id: String },
    /// Run a single pass of one loop (firewall, disk, disk-scan, schedules, status, leases) or `all`
    Reconcile {
        #[arg(default_value = "all")]
        kind: String,
    },
    /// Print recent audit events
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Check the hash chain as well
        #[arg(long, default_value_t = false)]
        verify: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command {
        Commands::Serve => {
            cmd::serve(config, async {
                setup_shutdown_handler().await;
                info!("Shutdown signal received, stopping control plane gracefully");
            })
            .await
        }
        Commands::Dispatch { agent, job_type, params, log_failures } => {
            cmd::dispatch(config, agent, job_type, params, log_failures).await
        }
        Commands::Jobs { status, limit } => cmd::list_jobs(config, status, limit).await,
        Commands::Job { id } => cmd::job_status(config, id).await,
        Commands::Cancel { id } => cmd::cancel_job(config, id).await,
        Commands::Reconcile { kind } => {
            let shutdown = setup_shutdown_handler();
            tokio::select! {
                result = cmd::reconcile(config, kind) => result,
                _ = shutdown => Ok(())
            }
        }
        Commands::Audit { limit, verify } => cmd::audit(config, limit, verify).await,
    }
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error=%e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error=%e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
