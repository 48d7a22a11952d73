//! httpmeter demo server
//!
//! Serves a small axum application instrumented with the Prometheus layer,
//! exposing `/metrics` and `/openmetrics`.

mod config;
mod server;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use httpmeter_core::logging::init_logging;
use httpmeter_core::multiprocess::spawn_flush_task;
use httpmeter_core::{MetricsRegistry, MultiProcessCollector};

#[derive(Parser, Debug)]
#[command(name = "httpmeter")]
#[command(about = "HTTP metrics demo server", long_about = None)]
struct Args {
    /// Config file path
    #[arg(long, env = "HTTPMETER_CONFIG_PATH")]
    config: Option<String>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_logging(&config.logging)?;

    info!("Starting httpmeter v{}", env!("CARGO_PKG_VERSION"));
    info!(
        prefix = %config.exporter.prefix,
        app_name = %config.exporter.app_name,
        group_paths = config.exporter.group_paths,
        "Exporter configured"
    );

    let collector = MultiProcessCollector::from_env().map(Arc::new);
    let flush_task = collector.as_ref().map(|collector| {
        info!(dir = %collector.dir().display(), "Multi-process mode enabled");
        spawn_flush_task(
            Arc::clone(collector),
            MetricsRegistry::global().clone(),
            Duration::from_secs(config.multiprocess.flush_interval_seconds),
        )
    });

    let router = server::create_router(config.exporter.clone())?;
    let result = server::serve(&config.http_address(), router).await;

    if let Some(task) = flush_task {
        task.abort();
    }
    if let Some(collector) = collector {
        // flush the final counts so the archive includes them
        if let Err(e) = collector.persist(MetricsRegistry::global()).await {
            warn!(error = %e, "Failed to persist final metrics snapshot");
        }
        if let Err(e) = collector.mark_process_dead(std::process::id()).await {
            warn!(error = %e, "Failed to archive metrics snapshot");
        }
    }

    result
}
