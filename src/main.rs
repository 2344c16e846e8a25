//! IP tracking CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zentinel_ip_tracking::blocklist::BlockOutcome;
use zentinel_ip_tracking::recorder::DEFAULT_HISTORY_LIMIT;
use zentinel_ip_tracking::scheduler::{run_with_retry, JobOutcome};
use zentinel_ip_tracking::store::SuspiciousStore;
use zentinel_ip_tracking::{Config, IpTracking};

#[derive(Parser, Debug)]
#[command(name = "zentinel-ip-tracking")]
#[command(about = "Request tracking, IP blocklist management and anomaly detection")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ip-tracking.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Block an IP address
    Block {
        address: String,
        /// Reason recorded with the block
        #[arg(short, long, default_value = "")]
        reason: String,
    },
    /// Remove an IP address from the blocklist
    Unblock { address: String },
    /// List blocked IP addresses, most recent first
    List,
    /// Show recent requests from an IP address
    Logs {
        address: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// List suspicious activity flags
    Flags {
        /// Include flags already marked as investigated
        #[arg(long)]
        all: bool,
    },
    /// Mark a flag as investigated
    Investigate { id: i64 },
    /// Delete a flag
    Forget { id: i64 },
    /// Run the anomaly scanner once
    Scan,
    /// Run the anomaly scanner periodically until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let command = args.command.unwrap_or(Command::Run);
    let app = IpTracking::new(config).await?;

    match command {
        Command::Block { address, reason } => {
            match app.blocklist.block(&address, &reason).await? {
                BlockOutcome::Created => println!("Successfully blocked IP: {}", address),
                BlockOutcome::AlreadyBlocked => println!("IP {} is already blocked", address),
                BlockOutcome::ReasonUpdated { previous } => println!(
                    "IP {} is already blocked; reason updated (was: {:?})",
                    address, previous
                ),
            }
        }
        Command::Unblock { address } => {
            app.blocklist.unblock(&address).await?;
            println!("Successfully unblocked IP: {}", address);
        }
        Command::List => {
            let blocked = app.blocklist.list().await?;
            if blocked.is_empty() {
                println!("No IPs are currently blocked");
            }
            for record in blocked {
                println!(
                    "{}\t{}\t{}",
                    record.address,
                    record.blocked_at.to_rfc3339(),
                    record.reason
                );
            }
        }
        Command::Logs { address, limit } => {
            let entries = app.recorder.recent(&address, limit).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Flags { all } => {
            let flags = app.stores().suspicious.list(all).await?;
            println!("{}", serde_json::to_string_pretty(&flags)?);
        }
        Command::Investigate { id } => {
            if !app.stores().suspicious.mark_investigated(id).await? {
                anyhow::bail!("No suspicious entry with id {}", id);
            }
            println!("Marked entry {} as investigated", id);
        }
        Command::Forget { id } => {
            if !app.stores().suspicious.delete(id).await? {
                anyhow::bail!("No suspicious entry with id {}", id);
            }
            println!("Deleted entry {}", id);
        }
        Command::Scan => {
            let mut shutdown = shutdown_on_ctrl_c();
            match run_with_retry(app.scanner.as_ref(), app.retry_policy(), &mut shutdown).await {
                JobOutcome::Succeeded { output, .. } => {
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                JobOutcome::Failed { attempts, error } => {
                    return Err(error.context(format!("scan failed after {} attempts", attempts)));
                }
                JobOutcome::Cancelled { .. } => warn!("Scan cancelled"),
            }
        }
        Command::Run => {
            app.scheduler()
                .run(app.scanner.as_ref(), shutdown_on_ctrl_c())
                .await;
        }
    }

    Ok(())
}

/// Flag raised once Ctrl-C is received.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    shutdown_rx
}
