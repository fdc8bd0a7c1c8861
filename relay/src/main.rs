use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

mod outbound;
mod session;
mod tls;

#[tokio::main]
async fn main() -> Result<()> {
    let debug = env_flag("UNILINK_DEBUG");
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("unilink_relay={level},unilink_shared={level}"))
        .init();

    let port: u16 = std::env::var("UNILINK_PORT")
        .unwrap_or_else(|_| "9100".to_string())
        .parse()
        .unwrap_or(9100);

    let acceptor = if env_flag("UNILINK_TLS") {
        let cert = std::env::var("UNILINK_TLS_CERT")
            .context("UNILINK_TLS_CERT is required when UNILINK_TLS is set")?;
        let key = std::env::var("UNILINK_TLS_KEY")
            .context("UNILINK_TLS_KEY is required when UNILINK_TLS is set")?;
        Some(tls::acceptor(Path::new(&cert), Path::new(&key))?)
    } else {
        None
    };

    let client = outbound::build_client()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        "unilink relay on {addr}{}",
        if acceptor.is_some() { " (tls)" } else { "" }
    );

    session::serve(listener, acceptor, client).await
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
