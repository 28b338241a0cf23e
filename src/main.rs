mod bandwidth;
mod cli;
mod error;
mod events;
mod proxy;
mod server;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bandwidth::{BandwidthTester, CONTINUOUS_INTERVAL};
use crate::cli::{Cli, Command, StartArgs};
use crate::events::{EventSink, ProgressEvent};
use crate::proxy::ProxyPool;
use crate::server::SocksServer;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "socksmux=debug"
    } else {
        "socksmux=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Some(Command::Start(args)) => {
            if let Err(e) = run(args).await {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        None => Cli::print_usage(),
    }
}

async fn run(args: StartArgs) -> anyhow::Result<()> {
    let proxies = args.load_proxies()?;

    info!("starting SOCKS proxy server on {}:{}", args.host, args.port);
    info!("dispatching to {} remote proxies:", proxies.len());
    for proxy in &proxies {
        info!("  - {proxy}");
    }

    let pool = Arc::new(ProxyPool::new(proxies)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    tokio::spawn(proxy::prober::run(
        pool.clone(),
        args.auto_optimize,
        shutdown_rx.clone(),
    ));

    if args.auto_optimize {
        let sink = EventSink::new(|event: &ProgressEvent| {
            if let Ok(json) = serde_json::to_string(event) {
                info!(target: "socksmux::optimize", "{json}");
            }
        });
        let tester = BandwidthTester::new(sink);
        tokio::spawn(tester.run_continuous(
            pool.all().to_vec(),
            CONTINUOUS_INTERVAL,
            shutdown_rx.clone(),
        ));
    }

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("SOCKS server listening on {}", listener.local_addr()?);

    let server = SocksServer::new(pool);
    tokio::select! {
        _ = server.run(listener, shutdown_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            let _ = shutdown_tx.send(());
        }
    }

    Ok(())
}
