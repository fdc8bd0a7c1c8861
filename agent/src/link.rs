//! Connection lifecycle manager for the relay link.
//!
//! A single actor task owns the one outbound connection to the relay. It is
//! the only component allowed to create or destroy that connection. At most
//! one request is in flight at a time, so inbound response frames are
//! matched positionally against a single pending slot.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use unilink_shared::frame::{self, FrameDecoder, FrameType};
use unilink_shared::{Error, Result};

use crate::config::LinkConfig;
use crate::tls;

pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

enum LinkCmd {
    /// Write one request frame and register the reply slot.
    Dispatch {
        frame: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Void the pending slot; the waiter gave up.
    Abandon,
}

/// Handle used by the dispatcher to talk to the link actor.
#[derive(Clone)]
pub struct LinkHandle {
    cmds: mpsc::Sender<LinkCmd>,
}

impl LinkHandle {
    /// Send one request payload as a type-0 frame and wait for the next
    /// response payload. The caller applies its own response timeout and
    /// calls [`abandon`](Self::abandon) when it gives up, so a late answer
    /// is dropped instead of being attributed to the next request.
    pub async fn roundtrip(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let cmd = LinkCmd::Dispatch {
            frame: frame::encode(FrameType::Request, payload),
            reply: tx,
        };
        self.cmds.send(cmd).await.map_err(|_| Error::LinkDown)?;
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::LinkDown),
        }
    }

    pub async fn abandon(&self) {
        let _ = self.cmds.send(LinkCmd::Abandon).await;
    }
}

/// Spawn the link actor and connect eagerly.
pub fn spawn(cfg: LinkConfig) -> LinkHandle {
    let (tx, rx) = mpsc::channel(8);
    let task = LinkTask {
        cfg,
        cmds: rx,
        conn: None,
        decoder: FrameDecoder::new(),
        pending: None,
        retry: None,
    };
    tokio::spawn(task.run());
    LinkHandle { cmds: tx }
}

struct LinkTask {
    cfg: LinkConfig,
    cmds: mpsc::Receiver<LinkCmd>,
    conn: Option<Box<dyn Transport>>,
    decoder: FrameDecoder,
    pending: Option<oneshot::Sender<Result<Vec<u8>>>>,
    /// Deadline of the single armed reconnect attempt, if any.
    retry: Option<Instant>,
}

impl LinkTask {
    async fn run(mut self) {
        self.ensure_connected().await;
        let mut buf = [0u8; 16 * 1024];
        loop {
            tokio::select! {
                cmd = self.cmds.recv() => match cmd {
                    Some(LinkCmd::Dispatch { frame, reply }) => self.dispatch(frame, reply).await,
                    Some(LinkCmd::Abandon) => self.pending = None,
                    None => break,
                },
                read = read_some(&mut self.conn, &mut buf) => match read {
                    Ok(0) => {
                        warn!("relay closed the connection");
                        self.drop_conn();
                    }
                    Ok(n) => self.on_data(n, &buf),
                    Err(e) => {
                        warn!("relay link read error: {e}");
                        self.drop_conn();
                    }
                },
                _ = wait_retry(self.retry) => {
                    self.retry = None;
                    self.ensure_connected().await;
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Vec<u8>, reply: oneshot::Sender<Result<Vec<u8>>>) {
        // A leftover waiter here means its round-trip already timed out.
        self.pending = None;
        if self.conn.is_none() {
            self.ensure_connected().await;
        }
        let Some(conn) = self.conn.as_mut() else {
            let _ = reply.send(Err(Error::LinkDown));
            return;
        };
        if let Err(e) = conn.write_all(&frame).await {
            warn!("relay link write error: {e}");
            self.drop_conn();
            let _ = reply.send(Err(Error::Connection(e.to_string())));
            return;
        }
        self.pending = Some(reply);
    }

    /// No-op when a live connection exists; otherwise one bounded connect
    /// attempt. Success cancels any armed reconnect timer.
    async fn ensure_connected(&mut self) {
        if self.conn.is_some() {
            return;
        }
        match timeout(self.cfg.connect_timeout, connect(&self.cfg)).await {
            Ok(Ok(conn)) => {
                info!("connected to relay at {}", self.cfg.addr());
                self.conn = Some(conn);
                self.decoder.clear();
                self.retry = None;
            }
            Ok(Err(e)) => {
                warn!("relay connect failed: {e}");
                self.schedule_retry();
            }
            Err(_) => {
                warn!(
                    "relay connect timed out after {:?}",
                    self.cfg.connect_timeout
                );
                self.schedule_retry();
            }
        }
    }

    /// Arm the reconnect timer unless one is already pending. There is never
    /// more than one timer, and retries continue indefinitely at a fixed
    /// interval.
    fn schedule_retry(&mut self) {
        if self.retry.is_none() {
            self.retry = Some(Instant::now() + self.cfg.retry_delay);
        }
    }

    /// Tear down the connection. The in-flight request, if any, is resolved
    /// as a hard failure: no resend happens at this layer.
    fn drop_conn(&mut self) {
        self.conn = None;
        self.decoder.clear();
        if let Some(tx) = self.pending.take() {
            let _ = tx.send(Err(Error::LinkDown));
        }
        self.schedule_retry();
    }

    fn on_data(&mut self, n: usize, buf: &[u8]) {
        self.decoder.feed(&buf[..n]);
        while let Some((kind, payload)) = self.decoder.next_frame() {
            match FrameType::from_u8(kind) {
                Some(FrameType::Response) => match self.pending.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(payload));
                    }
                    None => debug!("response frame with no waiter, dropping"),
                },
                Some(FrameType::Request) => warn!("relay sent a request frame, ignoring"),
                None => debug!("skipping unknown frame type {kind}"),
            }
        }
    }
}

async fn read_some(
    conn: &mut Option<Box<dyn Transport>>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match conn.as_mut() {
        Some(c) => c.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn wait_retry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn connect(cfg: &LinkConfig) -> Result<Box<dyn Transport>> {
    let tcp = TcpStream::connect(cfg.addr()).await?;
    tcp.set_nodelay(true)?;
    if cfg.tls {
        let connector = tls::connector();
        let name = rustls::pki_types::ServerName::try_from(cfg.host.clone())
            .map_err(|e| Error::Connection(e.to_string()))?;
        let stream = connector.connect(name, tcp).await?;
        Ok(Box::new(stream))
    } else {
        Ok(Box::new(tcp))
    }
}
