//! presence-daemon: peer presence over WebSockets.
//!
//! With bootstrap peers configured it runs as a client: the first bootstrap
//! peer is the backend whose reachability is reported as the connection
//! status, and LAN peers are discovered and greeted. Without bootstrap peers
//! it runs as a backend that only answers greetings.
//!
//! Status events are written to stdout as JSON lines; logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use presence_daemon::discovery::{self, LanDiscovery};
use presence_daemon::{backend, bridge, BackoffConfig, Config, SubstrateConfig, WsSubstrate};

use presence_core::{OrchestratorSettings, SessionOrchestrator, StatusPublisher, Substrate};

#[derive(Parser, Debug)]
#[command(name = "presence-daemon")]
#[command(about = "Peer presence and handshake daemon")]
struct Args {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on for incoming connections
    #[arg(short, long)]
    listen: Option<String>,

    /// Peer ID (generated if not provided)
    #[arg(long)]
    peer_id: Option<String>,

    /// Bootstrap peer address, repeatable; the first one is the backend
    #[arg(short, long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Static peer address announced as discovered, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Address other peers should dial us at
    #[arg(long)]
    advertise: Option<String>,

    /// Disable mDNS discovery on the local network
    #[arg(long)]
    no_mdns: bool,

    /// Label sent to peers (default: Whoosh-<hostname>)
    #[arg(long)]
    device_name: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Command-line values override the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(peer_id) = &self.peer_id {
            config.peer_id = Some(peer_id.clone());
        }
        if !self.bootstrap.is_empty() {
            config.presence.bootstrap_peers = self.bootstrap.clone();
        }
        config.static_peers.extend(self.peers.iter().cloned());
        if let Some(advertise) = &self.advertise {
            config.advertise_address = Some(advertise.clone());
        }
        if self.no_mdns {
            config.mdns = false;
        }
        if let Some(name) = &self.device_name {
            config.presence.device_name = Some(name.clone());
        }
    }
}

fn write_line(line: String) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
}

fn start_lan_discovery(
    config: &Config,
    substrate: &WsSubstrate,
) -> Result<(LanDiscovery, mdns_sd::Receiver<mdns_sd::ServiceEvent>)> {
    let mut lan = LanDiscovery::new(&config.presence.discovery_tag)?;
    lan.register(
        &substrate.local_identity(),
        &config.device_name(),
        substrate.listen_url(),
        substrate.local_addr().port(),
    )?;
    let receiver = lan.browse()?;
    Ok((lan, receiver))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,presence_daemon=debug,presence_core=debug"
    } else {
        "info,presence_daemon=info,presence_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    info!("Starting presence-daemon");
    info!("Listen address: {}", config.listen);

    let local_id = config.identity()?;
    let label = config.device_name();
    let bootstrap = config
        .presence
        .bootstrap_addresses()
        .context("Invalid bootstrap peer address")?;
    let static_peers = config
        .static_addresses()
        .context("Invalid static peer address")?;

    // Status feed to stdout, UI requests from stdin
    let publisher = Arc::new(StatusPublisher::new());
    let _status_lines = bridge::subscribe_lines(&publisher, write_line);
    let ui = tokio::spawn(bridge::serve_requests(
        BufReader::new(tokio::io::stdin()),
        Arc::clone(&publisher),
        write_line,
    ));

    let (substrate, events) = WsSubstrate::start(SubstrateConfig {
        local_id: local_id.clone(),
        label: label.clone(),
        protocols: vec![config.presence.protocol.clone()],
        listen: config.listen.clone(),
        advertise_address: config.advertise_address.clone(),
        bootstrap,
        identify_timeout: config.presence.handshake_timeout(),
        bootstrap_backoff: BackoffConfig::default(),
    })
    .await
    .context("Failed to start WebSocket substrate")?;

    info!("Peer ID: {} ({})", local_id, label);

    if config.is_backend() {
        info!("No bootstrap peers configured, running as backend");
        publisher.set_local_identity(&local_id);

        let server = tokio::spawn(backend::serve(
            events,
            label,
            config.presence.protocol.clone(),
            config.presence.handshake_timeout(),
        ));

        info!("Daemon running. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown signal received");

        substrate.stop().await?;
        server.abort();
    } else {
        let mut lan = None;
        let receiver = if config.mdns {
            match start_lan_discovery(&config, &substrate) {
                Ok((discovery, receiver)) => {
                    lan = Some(discovery);
                    Some(receiver)
                }
                Err(e) => {
                    warn!("LAN discovery disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        let discovery_task = tokio::spawn(discovery::run_discovery(
            substrate.clone(),
            receiver,
            static_peers,
            config.presence.discovery_interval(),
        ));

        let settings = OrchestratorSettings::from_config(&config.presence, label)?;
        let orchestrator = SessionOrchestrator::new(
            settings,
            Arc::new(substrate.clone()),
            events,
            Arc::clone(&publisher),
        );
        let handle = orchestrator.start();

        info!("Daemon running. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown signal received");

        discovery_task.abort();
        handle.stop().await?;
        drop(lan);
    }

    ui.abort();
    info!("Shutting down");
    // The blocking stdin read cannot be cancelled and would hold up runtime shutdown
    std::process::exit(0)
}
