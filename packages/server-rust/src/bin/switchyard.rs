//! Switchyard broker binary.
//!
//! Usage:
//!   switchyard --config broker.json
//!   switchyard --config broker.json --listen 0.0.0.0:7400 --health 0.0.0.0:8080

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use switchyard_server::network::{health, AppState, SessionListener};
use switchyard_server::shutdown::{stopped, ShutdownSignal};
use switchyard_server::{Broker, BrokerConfig, ProcessRegistry};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(about = "Request/reply message broker")]
#[command(version)]
struct Args {
    /// Path to the JSON broker configuration
    #[arg(short, long, env = "SWITCHYARD_CONFIG")]
    config: PathBuf,

    /// Address to accept sessions from remote brokers on
    #[arg(short, long, env = "SWITCHYARD_LISTEN")]
    listen: Option<String>,

    /// Address to serve health endpoints on
    #[arg(long, env = "SWITCHYARD_HEALTH")]
    health: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "SWITCHYARD_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = BrokerConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let broker = Broker::new(&config, &ProcessRegistry::with_builtins())?;
    broker.start()?;
    info!(broker = broker.name(), "broker running");

    let stop = ShutdownSignal::new();
    let mut tasks = Vec::new();

    if let Some(addr) = &args.listen {
        let listener = SessionListener::bind(addr).await?;
        tasks.push(tokio::spawn(
            listener.serve(Arc::clone(broker.connections()), stop.subscribe()),
        ));
    }

    if let Some(addr) = &args.health {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding health endpoints on {addr}"))?;
        let state = AppState::new(Arc::clone(broker.status()));
        let mut rx = stop.subscribe();
        tasks.push(tokio::spawn(health::serve(listener, state, async move {
            stopped(&mut rx).await;
        })));
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    stop.trigger();
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "server task failed"),
            Err(e) => error!(error = %e, "server task panicked"),
        }
    }
    broker.close();
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
