//! The single agent session and its frame loop.
//!
//! The relay serves exactly one agent connection at a time; anyone else
//! knocking while a session is live is turned away immediately, leaving the
//! original session authoritative. Within a session, requests are handled
//! strictly one at a time: a frame is executed to completion before the next
//! one is even decoded off the stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use unilink_shared::envelope::{RequestEnvelope, ResponseEnvelope};
use unilink_shared::frame::{self, FrameDecoder, FrameType};

use crate::outbound;

/// Accept loop enforcing the single-session invariant.
pub async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    client: reqwest::Client,
) -> Result<()> {
    let slot = Arc::new(Semaphore::new(1));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (sock, peer) = accepted.context("accept failed")?;
                match slot.clone().try_acquire_owned() {
                    Ok(permit) => {
                        info!("agent connected from {peer}");
                        let acceptor = acceptor.clone();
                        let client = client.clone();
                        tokio::spawn(async move {
                            let res = match acceptor {
                                Some(tls) => match tls.accept(sock).await {
                                    Ok(stream) => run(stream, &client).await,
                                    Err(e) => {
                                        warn!("tls handshake with {peer} failed: {e}");
                                        Ok(())
                                    }
                                },
                                None => run(sock, &client).await,
                            };
                            match res {
                                Ok(()) => info!("agent session from {peer} closed"),
                                Err(e) => warn!("agent session from {peer} ended: {e}"),
                            }
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        warn!("refusing second connection from {peer}");
                        drop(sock);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Run one agent session until the connection closes.
pub async fn run<S>(stream: S, client: &reqwest::Client) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 16 * 1024];

    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.feed(&buf[..n]);
        while let Some((kind, payload)) = decoder.next_frame() {
            match FrameType::from_u8(kind) {
                Some(FrameType::Request) => handle_request(&payload, client, &mut wr).await?,
                Some(FrameType::Response) => warn!("agent sent a response frame, ignoring"),
                None => debug!("skipping unknown frame type {kind}"),
            }
        }
    }
}

async fn handle_request<W>(payload: &[u8], client: &reqwest::Client, wr: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let envelope = match RequestEnvelope::from_json(payload) {
        Ok(env) => env,
        Err(e) => {
            // Nothing sane to answer; the agent's own timeout covers it.
            warn!("discarding malformed request envelope: {e}");
            return Ok(());
        }
    };

    if envelope.is_connect() {
        handle_connect(&envelope, wr).await
    } else {
        info!("{} {}", envelope.method, envelope.url);
        let resp = outbound::execute(client, &envelope).await;
        send_response(wr, &resp).await
    }
}

/// Dial the CONNECT target directly. On success the acknowledgment goes out
/// right away, but the session stays busy until the remote end closes: a
/// tunnel occupies the channel exactly like one HTTP call.
async fn handle_connect<W>(envelope: &RequestEnvelope, wr: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    info!("CONNECT {}", envelope.url);
    match TcpStream::connect(envelope.url.as_str()).await {
        Ok(mut remote) => {
            send_response(wr, &ResponseEnvelope::synthetic(200, "connection established")).await?;
            let mut sink = [0u8; 4096];
            loop {
                match remote.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!("CONNECT peer {} closed", envelope.url);
            Ok(())
        }
        Err(e) => {
            warn!("CONNECT {} failed: {e}", envelope.url);
            send_response(wr, &ResponseEnvelope::synthetic(502, &format!("connect failed: {e}")))
                .await
        }
    }
}

async fn send_response<W>(wr: &mut W, resp: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = resp.to_json()?;
    wr.write_all(&frame::encode(FrameType::Response, &payload)).await?;
    Ok(())
}
