// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! WolfRelay — Fleet Synchronization Engine for the Wolf Software Suite
//!
//! A single-binary daemon that:
//! - Mirrors every managed relay server's node configuration into a local cache
//! - Classifies hosts online/offline from pushed heartbeats with hysteresis
//! - Paces a full-fleet synchronization pass across each 24h window
//! - Fires Telegram/Discord/Slack notifications on state transitions
//! - Provisions the heartbeat agent onto hosts over SSH

mod adapter;
mod alerting;
mod api;
mod cache;
mod config;
mod hosts;
mod monitor;
mod provision;
mod scheduler;
mod store;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// WolfRelay — relay fleet synchronization and liveness engine
#[derive(Parser)]
#[command(name = "wolfrelay", version, about = "Fleet sync and liveness for remote relay servers")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8563)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Data directory for config, host list, and caches
    #[arg(short, long, default_value = "/etc/wolfrelay")]
    data_dir: PathBuf,

    /// Print the heartbeat secret and exit (for enrolling agents)
    #[arg(long)]
    show_secret: bool,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wolfrelay=info".parse().unwrap())
                .add_directive("actix_web=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let _ = std::fs::create_dir_all(&cli.data_dir);

    let config = config::FleetConfig::load(&cli.data_dir);

    // --show-secret: print the agent token and exit
    if cli.show_secret {
        println!("{}", config.heartbeat_secret);
        return Ok(());
    }

    let registry = Arc::new(hosts::HostRegistry::load(&cli.data_dir));
    let heartbeats = Arc::new(monitor::HeartbeatCache::new());
    let cache = Arc::new(cache::NodeCache::load(
        &cli.data_dir,
        config.clone(),
        registry.clone(),
    ));
    let provisioner = Arc::new(provision::Provisioner::new(
        registry.clone(),
        cache.clone(),
        cli.data_dir.clone(),
        config.clone(),
    ));

    info!("");
    info!("  🐺 WolfRelay v{}", env!("CARGO_PKG_VERSION"));
    info!("  ──────────────────────────────────");
    info!("  Hosts:      {}", registry.len());
    info!("  Data dir:   {}", cli.data_dir.display());
    info!("  API:        http://{}:{}", cli.bind, cli.port);
    info!("");

    // Background: coalesced cache flushes
    cache.spawn_flush_loop(5);

    // Background: liveness evaluation + alert dispatch
    let (alert_tx, alert_rx) = tokio::sync::mpsc::unbounded_channel();
    alerting::spawn_dispatcher(cli.data_dir.clone(), alert_rx);
    let liveness = Arc::new(monitor::LivenessMonitor::new(
        heartbeats.clone(),
        registry.clone(),
        alert_tx,
        &config,
    ));
    liveness.spawn_loop(config.monitor_interval_secs);

    // Background: the paced fleet sync loop, stoppable at host boundaries
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let sync = scheduler::SyncScheduler::new(
        registry.clone(),
        cache.clone(),
        cli.data_dir.clone(),
        config.clone(),
    );
    let sync_task = tokio::spawn(sync.run(shutdown_rx));

    let shutdown_on_interrupt = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received — letting in-flight host operations finish");
            let _ = shutdown_on_interrupt.send(true);
        }
    });

    // Create app state
    let app_state = web::Data::new(api::AppState {
        registry,
        cache: cache.clone(),
        heartbeats,
        provisioner,
        config,
        data_dir: cli.data_dir.clone(),
    });

    let result = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(api::configure)
    })
    .bind(format!("{}:{}", cli.bind, cli.port))?
    .run()
    .await;

    // The scheduler persists its cursor as it goes; one last cache flush
    // keeps the documents aligned with memory.
    let _ = shutdown_tx.send(true);
    let _ = sync_task.await;
    cache.flush_if_dirty();
    result
}
