// mlatd - Mode S multilateration server
// Licensed under AGPL v3

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tower_http::services::ServeDir;
use tracing::{error, info};

use mlatd::config::Config;
use mlatd::coordinator::Coordinator;
use mlatd::net::listener::{run_client_listener, run_output_listener};
use mlatd::output::{CsvOutput, JsonFeed};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_logging(config.verbose);

    info!("starting mlatd");

    let work_dir = config.work_dir.as_ref().map(PathBuf::from);
    if let Some(dir) = &work_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut coordinator = Coordinator::new(work_dir.clone());

    // Result fan-out: one broadcast channel feeds every network subscriber.
    let (feed_tx, _) = tokio::sync::broadcast::channel::<Vec<u8>>(256);
    if !config.results_listen.is_empty() {
        coordinator.add_output(Box::new(JsonFeed::new(feed_tx.clone())));
    }
    for path in &config.write_csv {
        match CsvOutput::create(path) {
            Ok(csv) => {
                info!("writing CSV results to {path}");
                coordinator.add_output(Box::new(csv));
            }
            Err(e) => error!("cannot open CSV output {path}: {e}"),
        }
    }

    let (events_tx, events_rx) = tokio::sync::mpsc::channel(1024);
    tokio::spawn(coordinator.run(events_rx));

    // Receiver input listener.
    let client_addr: std::net::SocketAddr = config.client_listen.parse()?;
    {
        let events = events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_client_listener(client_addr, events).await {
                error!("client listener failed: {e}");
            }
        });
    }

    // Result feed listeners.
    for addr in &config.results_listen {
        match addr.parse::<std::net::SocketAddr>() {
            Ok(addr) => {
                let feed = feed_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_output_listener(addr, feed).await {
                        error!("result feed listener failed: {e}");
                    }
                });
            }
            Err(e) => error!("invalid results address {addr}: {e}"),
        }
    }

    // Status snapshots over HTTP.
    if let (Some(port), Some(dir)) = (config.http_port, work_dir) {
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(l) => l,
                Err(e) => {
                    error!("status HTTP bind failed on port {port}: {e}");
                    return;
                }
            };
            info!("status HTTP on port {port}");
            let app = axum::Router::new().fallback_service(ServeDir::new(dir));
            if let Err(e) = axum::serve(listener, app).await {
                error!("status HTTP server error: {e}");
            }
        });
    }

    info!("server ready");
    signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true);
    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
