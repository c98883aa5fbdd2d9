//! Controller monitoring service.
//!
//! Polls S7 controllers on independent timers, streams the readings to every
//! connected client and accepts tag writes over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clpmonitor::{HttpServer, Monitor, MonitorConfig, simulated_plc};
use clpmonitor_s7::{TcpFactory, TransportFactory};
use tokio::sync::watch;
use tracing::{info, warn};

/// Controller monitoring service.
#[derive(Parser, Debug)]
#[command(name = "clpmonitor")]
#[command(about = "Polls S7 controllers and streams their data over HTTP")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "clpmonitor.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Serve every controller endpoint from an in-process simulator.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = MonitorConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut log_config = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_config.level = level.clone();
    }
    clpmonitor_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting clpmonitor");
    info!("Loaded configuration from {:?}", args.config);

    let factory: Arc<dyn TransportFactory> = if args.simulate {
        warn!("Simulation mode: no controller will be contacted");
        Arc::new(simulated_plc(&config.jobs))
    } else {
        Arc::new(TcpFactory)
    };

    let monitor = Monitor::build(&config, factory).context("Failed to build broadcast engine")?;
    monitor
        .engine()
        .start()
        .context("Failed to start broadcast engine")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = HttpServer::new(monitor.clone(), config.http.listen);
    let mut server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
        result = &mut server_task => {
            monitor.engine().stop().await;
            result.context("HTTP server task failed")??;
            anyhow::bail!("HTTP server exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    // Completing the subscribers ends open event streams
    monitor.engine().stop().await;
    server_task.await.context("HTTP server task failed")??;

    info!("clpmonitor stopped");
    Ok(())
}
