// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote device sharing daemon.
//!
//! # Usage
//!
//! ```bash
//! # Share the local catalog with the clients listed in the config
//! sam-remote server --config remote.toml --catalog catalog.toml
//!
//! # Mirror a remote server's catalog
//! sam-remote client --config remote.toml
//!
//! # Check a configuration file
//! sam-remote validate --config remote.toml
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sam_remote::{
    Catalog, CatalogMirror, ClientConfig, Device, Mailbox, MemoryCatalog, RemoteClient,
    RemoteConfig, RemoteMessage, RemoteServer, ServerConfig, SessionState, Shutdown,
    StaticDirectory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Remote device sharing for a hierarchical storage manager
#[derive(Parser, Debug)]
#[command(name = "sam-remote")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Share the local catalog with remote clients
    Server {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Catalog file (TOML, `[[volumes]]` tables); reloaded on SIGHUP
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Connect to a remote server and mirror its catalog
    Client {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = match &args.command {
        Commands::Server { config, .. }
        | Commands::Client { config }
        | Commands::Validate { config } => config.clone(),
    };
    let config = RemoteConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    match args.command {
        Commands::Server { catalog, .. } => {
            let Some(server) = config.server else {
                bail!("{} has no [server] section", config_path.display());
            };
            run_server(server, catalog).await
        }
        Commands::Client { .. } => {
            let Some(client) = config.client else {
                bail!("{} has no [client] section", config_path.display());
            };
            run_client(client).await
        }
        Commands::Validate { .. } => {
            println!("Configuration valid: {}", config_path.display());
            if let Some(server) = &config.server {
                println!(
                    "  server: family set {}, eq {}, {} authorized host(s)",
                    server.family_set,
                    server.equipment,
                    server.clients.len()
                );
            }
            if let Some(client) = &config.client {
                println!(
                    "  client: family set {}, eq {}, server {}",
                    client.family_set, client.equipment, client.server_host
                );
            }
            Ok(())
        }
    }
}

async fn run_server(config: ServerConfig, catalog_path: Option<PathBuf>) -> anyhow::Result<()> {
    let catalog = Arc::new(match &catalog_path {
        Some(path) => MemoryCatalog::from_file(path)
            .with_context(|| format!("loading catalog {}", path.display()))?,
        None => MemoryCatalog::new(),
    });

    info!("+----------------------------------------------------+");
    info!("|       sam-remote server v{:<26}|", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!("|  Family set: {:37} |", config.family_set);
    info!("|  Equipment:  {:37} |", config.equipment);
    info!(
        "|  Discovery:  {:37} |",
        format!("{}:{}", config.bind_address, config.discovery_port)
    );
    info!("|  Clients:    {:37} |", config.clients.len());
    info!("|  Volumes:    {:37} |", catalog.len());
    info!("+----------------------------------------------------+");

    let family_set = config.family_set_name()?;
    let device = Arc::new(Device::server(
        config.device_name.clone(),
        family_set,
        config.equipment,
    ));
    let directory = Arc::new(
        StaticDirectory::new(config.bind_address, Duration::from_secs(10))
            .with_service(config.service_name.clone(), config.discovery_port),
    );

    let server = RemoteServer::new(config, device, catalog.clone(), directory).await?;
    let mailbox = Arc::new(Mailbox::new());
    let pump = server.spawn_pump(Arc::clone(&mailbox))?;

    spawn_ctrl_c(server.shutdown_signal());
    if let Some(path) = catalog_path {
        spawn_reload(catalog, path, mailbox, server.shutdown_signal());
    }

    server.run().await?;

    let stats = server.stats();
    tokio::task::spawn_blocking(move || pump.join())
        .await?
        .map_err(|_| anyhow::anyhow!("pump thread panicked"))?;

    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        records = stats.records_received,
        "Remote sharing server stopped"
    );
    Ok(())
}

async fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    info!("+----------------------------------------------------+");
    info!("|       sam-remote client v{:<26}|", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!("|  Family set: {:37} |", config.family_set);
    info!("|  Equipment:  {:37} |", config.equipment);
    info!(
        "|  Server:     {:37} |",
        format!("{}:{}", config.server_host, config.discovery_port)
    );
    info!(
        "|  Keepalive:  {:37} |",
        if config.keepalive {
            format!("{}s", config.keepalive_interval_secs)
        } else {
            "off".to_string()
        }
    );
    info!("+----------------------------------------------------+");

    let family_set = config.family_set_name()?;
    let device = Arc::new(Device::client(
        config.device_name.clone(),
        family_set,
        config.equipment,
        config.server_host.clone(),
    ));
    let directory = Arc::new(
        StaticDirectory::new(std::net::Ipv4Addr::UNSPECIFIED.into(), config.connect_timeout())
            .with_service(config.service_name.clone(), config.discovery_port),
    );
    let mirror = Arc::new(MemoryCatalog::new());
    mirror.set_available(false);

    let shutdown = Shutdown::new();
    spawn_ctrl_c(shutdown.clone());

    let handle = RemoteClient::new(config, device, mirror.clone(), directory)?
        .with_shutdown(shutdown.clone())
        .spawn();

    let mut state = handle.subscribe();
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == SessionState::Connected {
                    info!(volumes = mirror.len(), "Connected to remote server");
                } else {
                    info!(state = ?current, volumes = mirror.len(), "Session state changed");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    let stats = handle.stats();
    handle.disconnect().await?;
    info!(
        sessions = stats.sessions,
        updates = stats.updates_applied,
        volumes = mirror.len(),
        "Remote sharing client stopped"
    );
    Ok(())
}

fn spawn_ctrl_c(shutdown: Shutdown) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping...");
        }
        shutdown.trigger();
    });
}

/// Reload the catalog file on SIGHUP and forward the differences.
#[cfg(unix)]
fn spawn_reload(
    catalog: Arc<MemoryCatalog>,
    path: PathBuf,
    mailbox: Arc<Mailbox<RemoteMessage>>,
    shutdown: Shutdown,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!("SIGHUP handler not installed: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }

            let catalog = Arc::clone(&catalog);
            let mailbox = Arc::clone(&mailbox);
            let path = path.clone();
            let reload = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
                let fresh = MemoryCatalog::from_file(&path)?;
                let changes = catalog.replace_all(fresh.entries());
                let count = changes.len();
                if count > 0 {
                    mailbox
                        .post(RemoteMessage::CatalogChange(changes))
                        .map_err(|_| anyhow::anyhow!("server is shutting down"))?;
                }
                Ok(count)
            });
            match reload.await {
                Ok(Ok(count)) => info!(changes = count, "Catalog reloaded"),
                Ok(Err(e)) => warn!("Catalog reload failed: {:#}", e),
                Err(e) => warn!("Catalog reload task failed: {}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload(
    _catalog: Arc<MemoryCatalog>,
    _path: PathBuf,
    _mailbox: Arc<Mailbox<RemoteMessage>>,
    _shutdown: Shutdown,
) {
}
