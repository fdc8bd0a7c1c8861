use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};
use unilink_shared::envelope::RequestEnvelope;

mod config;
mod dispatcher;
mod http;
mod link;
mod tls;
mod tunnel;

use config::LinkConfig;
use dispatcher::{Dispatcher, ProxyJob};

#[derive(Parser)]
#[command(name = "unilink-agent")]
#[command(version = "0.1.0")]
#[command(about = "Local proxy agent that funnels HTTP traffic over one relay connection", long_about = None)]
struct Cli {
    /// Relay host
    #[arg(long, env = "UNILINK_RELAY_HOST", default_value = "127.0.0.1")]
    relay_host: String,

    /// Relay port
    #[arg(long, env = "UNILINK_RELAY_PORT", default_value_t = 9100)]
    relay_port: u16,

    /// Local proxy listen port
    #[arg(short, long, env = "UNILINK_LISTEN_PORT", default_value_t = 8118)]
    port: u16,

    /// Wrap the relay connection in TLS
    #[arg(long, env = "UNILINK_TLS")]
    tls: bool,

    /// Enable verbose logging
    #[arg(short, long, env = "UNILINK_DEBUG")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let link = link::spawn(LinkConfig::new(
        cli.relay_host.clone(),
        cli.relay_port,
        cli.tls,
    ));
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    tokio::spawn(Dispatcher::new(link).run(jobs_rx));

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind local proxy port {}", cli.port))?;
    info!(
        "proxy listening on 0.0.0.0:{} (relay {}:{}{})",
        cli.port,
        cli.relay_host,
        cli.relay_port,
        if cli.tls { ", tls" } else { "" }
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                let jobs = jobs_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, jobs).await {
                        warn!("client {peer}: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Read one proxy request off a local client connection and queue it.
async fn handle_client(
    mut stream: TcpStream,
    jobs: mpsc::UnboundedSender<ProxyJob>,
) -> Result<()> {
    let req = match http::read_request(&mut stream).await {
        Ok(req) => req,
        Err(e) => {
            if let Some(status) = e.status() {
                let _ = stream.write_all(&http::render_error(status, &e.to_string())).await;
                let _ = stream.shutdown().await;
            }
            return Err(e.into());
        }
    };

    if req.method.eq_ignore_ascii_case("CONNECT") {
        info!("CONNECT {}", req.target);
        let _ = jobs.send(ProxyJob::Tunnel {
            target: req.target,
            client: stream,
            early_data: req.body,
        });
    } else {
        info!("{} {}", req.method, req.target);
        let mut envelope = RequestEnvelope::new(req.method, req.target);
        envelope.headers = req.headers;
        envelope.set_body(&req.body);
        let _ = jobs.send(ProxyJob::Request {
            envelope,
            client: stream,
        });
    }
    Ok(())
}
