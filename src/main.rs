// src/main.rs

//! Binary entry point. Loads configuration, sets up reloadable logging, and
//! (when enabled) exposes the Prometheus metrics registry on its own port.
//! The fetch pipeline and ESI compiler are a library surface only — this
//! binary never opens a client-facing listener.

use anyhow::Result;
use ferrocache::config::Config;
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("ferrocache version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("ferrocache.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    // Held so the reload handle outlives the process; a future admin
    // surface (not part of this build) would use it to change levels live.
    let _reload_handle = Arc::new(reload_handle);

    info!(version = VERSION, "starting ferrocache");

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(port).await {
                error!(error = %e, "metrics endpoint stopped");
            }
        });
        info!(port, "metrics endpoint listening");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

/// A minimal hand-rolled HTTP/1.0 responder: every connection gets the
/// current Prometheus text-format registry, regardless of request line.
/// One purpose, one port — not worth pulling in a web framework for.
async fn serve_metrics(port: u16) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    loop {
        let (mut stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = ferrocache::core::metrics::gather_metrics();
            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}
