//! `proxy` binary entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use httpgate::config::ProxyConfig;
use httpgate::filter::FilterEngine;
use httpgate::logger::EventLogger;
use httpgate::server::ProxyServer;
use httpgate::shutdown::{self, ShutdownSignal};

/// Filtering forward HTTP proxy with CONNECT tunneling.
#[derive(Parser, Debug)]
#[command(name = "proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(default_value = "config/proxy_config.json", env = "PROXY_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, env = "PROXY_DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .init();

    let config = ProxyConfig::load(&args.config)?;
    info!("starting proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("bind address: {}:{}", config.host, config.port);
    info!("concurrency budget: {}", config.thread_pool_size);

    let logger = EventLogger::open(&config.log_file);
    let filter = Arc::new(FilterEngine::load(&config.blocked_domains_file, logger.clone()));

    let signal = ShutdownSignal::new();
    let server = ProxyServer::bind(config, filter, logger, signal.clone()).await?;
    let server_task = tokio::spawn(server.run());

    shutdown::wait_for_signal().await;
    info!("shutdown signal received, draining connections");
    signal.trigger();

    server_task.await??;
    info!("shutdown complete");
    Ok(())
}
