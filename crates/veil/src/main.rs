//! Veil: multi-protocol VPN client
//!
//! Entry point. Initializes the global allocator and logging, then runs
//! one of the subcommands against the configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use veil_net::DnsResolver;
use veil_vpn::{Config, ServiceState, StatusPayload, VpnService, system_backend};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "veil")]
#[command(version)]
#[command(about = "WireGuard, OpenVPN and SSH VPN client")]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "veil.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and stay connected until Ctrl-C
    Connect,
    /// Manage the local route list
    Routes {
        #[command(subcommand)]
        action: RoutesAction,
    },
    /// Remove kill switch rules left behind by a crashed run
    Reconcile,
}

#[derive(Subcommand)]
enum RoutesAction {
    /// Print the entries
    List,
    /// Append an address, CIDR or domain
    Add { entry: String },
    /// Delete an entry
    Remove { entry: String },
}

fn main() -> Result<()> {
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = Config::from_toml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if matches!(args.command, Command::Connect) {
        config.validate().context("invalid configuration")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(args.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let backend = system_backend()?;
    let resolver = Arc::new(DnsResolver::with_defaults().await?);
    let service = VpnService::new(config, backend, resolver);

    match command {
        Command::Connect => connect(service).await,
        Command::Routes { action } => routes(&service, action).await,
        Command::Reconcile => {
            service.reconcile().await?;
            info!("Stale kill switch rules removed");
            Ok(())
        }
    }
}

async fn connect(service: Arc<VpnService>) -> Result<()> {
    info!("Veil starting...");
    if let Err(e) = service.reconcile().await {
        warn!("Startup clean-up failed: {}", e);
    }

    service.set_status_listener(Arc::new(|status: &StatusPayload| {
        match serde_json::to_string(status) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("Failed to encode status: {}", e),
        }
    }));

    service.start();
    if !service.config().autostart {
        service.connect().await?;
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Interrupted, disconnecting");
    service.shutdown().await;

    if service.state() != ServiceState::Disconnected {
        warn!("Service ended in state {}", service.state());
    }
    info!("Veil shutting down");
    Ok(())
}

async fn routes(service: &VpnService, action: RoutesAction) -> Result<()> {
    match action {
        RoutesAction::List => {
            let entries = service.route_entries().await?;
            for ip in &entries.ips {
                println!("{ip}");
            }
            for domain in &entries.domains {
                println!("{domain}");
            }
        }
        RoutesAction::Add { entry } => {
            service.check_route_list_writable().await?;
            if !service.add_route_entry(&entry).await? {
                info!("{} is already listed", entry);
            }
        }
        RoutesAction::Remove { entry } => {
            if !service.remove_route_entry(&entry).await? {
                info!("{} was not listed", entry);
            }
        }
    }
    Ok(())
}
