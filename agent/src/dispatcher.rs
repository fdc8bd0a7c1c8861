//! Local sequential dispatcher.
//!
//! One worker drains the job queue in strict arrival order with at most one
//! job in flight — the property the whole system exists for. Response
//! frames carry no correlation identifier; the next one always belongs to
//! the job currently at the head, which is only sound because of the
//! single-in-flight discipline.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use unilink_shared::envelope::{RequestEnvelope, ResponseEnvelope};
use unilink_shared::Error;

use crate::config::RESPONSE_TIMEOUT;
use crate::http;
use crate::link::LinkHandle;
use crate::tunnel;

/// One queued unit of local client work.
pub enum ProxyJob {
    /// An ordinary HTTP request, relayed over the managed link.
    Request {
        envelope: RequestEnvelope,
        client: TcpStream,
    },
    /// A CONNECT tunnel, bridged directly but serialized by the same queue.
    Tunnel {
        target: String,
        client: TcpStream,
        early_data: Vec<u8>,
    },
}

pub struct Dispatcher {
    link: LinkHandle,
    response_timeout: Duration,
}

impl Dispatcher {
    pub fn new(link: LinkHandle) -> Self {
        Self {
            link,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(link: LinkHandle, response_timeout: Duration) -> Self {
        Self {
            link,
            response_timeout,
        }
    }

    /// Drain the queue until the agent shuts down.
    pub async fn run(self, mut jobs: mpsc::UnboundedReceiver<ProxyJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                ProxyJob::Request { envelope, client } => {
                    self.relay_request(envelope, client).await;
                }
                ProxyJob::Tunnel {
                    target,
                    client,
                    early_data,
                } => {
                    // The queue is held until the tunnel ends.
                    if let Err(e) = tunnel::bridge(client, &target, &early_data).await {
                        warn!("tunnel to {target} failed: {e}");
                    }
                }
            }
        }
    }

    async fn relay_request(&self, envelope: RequestEnvelope, mut client: TcpStream) {
        let method = envelope.method.clone();
        let url = envelope.url.clone();

        let answer = match envelope.to_json() {
            Ok(payload) => match timeout(self.response_timeout, self.link.roundtrip(&payload)).await
            {
                Ok(Ok(raw)) => render_relay_answer(&raw),
                Ok(Err(e)) => {
                    warn!("{method} {url}: {e}");
                    http::render_error(502, &format!("relay unavailable: {e}"))
                }
                Err(_) => {
                    // Void the pending slot so a late answer is dropped.
                    self.link.abandon().await;
                    let e = Error::ResponseTimeout;
                    warn!("{method} {url}: {e}");
                    http::render_error(504, &e.to_string())
                }
            },
            Err(e) => {
                warn!("{method} {url}: cannot encode envelope: {e}");
                http::render_error(502, "cannot encode request")
            }
        };

        if let Err(e) = client.write_all(&answer).await {
            debug!("{method} {url}: client went away before the answer: {e}");
        }
        let _ = client.shutdown().await;
    }
}

fn render_relay_answer(raw: &[u8]) -> Vec<u8> {
    let resp = match ResponseEnvelope::from_json(raw) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("malformed relay response: {e}");
            return http::render_error(502, "malformed relay response");
        }
    };
    match resp.body_bytes() {
        Ok(body) => http::render_response(&resp, &body),
        Err(e) => {
            warn!("undecodable relay response body: {e}");
            http::render_error(502, "undecodable relay response body")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::link;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use unilink_shared::frame::{self, FrameDecoder, FrameType};

    fn link_cfg(port: u16) -> LinkConfig {
        LinkConfig {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            connect_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(50),
        }
    }

    async fn sockpair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    fn request_job(url: &str, client: TcpStream) -> ProxyJob {
        ProxyJob::Request {
            envelope: RequestEnvelope::new("GET", url),
            client,
        }
    }

    async fn read_answer(mut client: TcpStream) -> (String, Vec<u8>) {
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let head_end = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let head = String::from_utf8(raw[..head_end].to_vec()).unwrap();
        let body = raw[head_end + 4..].to_vec();
        (head, body)
    }

    /// Echo relay: answers each request envelope with a 200 whose body is
    /// the request's url, one frame at a time.
    async fn echo_relay(listener: TcpListener, count: usize) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut dec = FrameDecoder::new();
        let mut buf = [0u8; 16 * 1024];
        let mut served = 0;
        while served < count {
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0, "agent hung up early");
            dec.feed(&buf[..n]);
            let mut batch = Vec::new();
            while let Some(f) = dec.next_frame() {
                batch.push(f);
            }
            // Single-in-flight: the agent must never have a second request
            // on the wire before the first is answered.
            assert!(batch.len() <= 1, "saw {} concurrent requests", batch.len());
            for (kind, payload) in batch {
                assert_eq!(kind, FrameType::Request as u8);
                let env: RequestEnvelope = serde_json::from_slice(&payload).unwrap();
                let resp = ResponseEnvelope::new(200, HashMap::new(), env.url.as_bytes());
                let out = frame::encode(FrameType::Response, &serde_json::to_vec(&resp).unwrap());
                sock.write_all(&out).await.unwrap();
                served += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_fifo_correlation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = tokio::spawn(echo_relay(listener, 3));

        let link = link::spawn(link_cfg(port));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Dispatcher::new(link).run(rx));

        let mut clients = Vec::new();
        for i in 0..3 {
            let (agent_side, client_side) = sockpair().await;
            tx.send(request_job(&format!("http://example.com/{i}"), agent_side))
                .unwrap();
            clients.push(client_side);
        }

        // Each client gets the answer for its own request, in order.
        for (i, client) in clients.into_iter().enumerate() {
            let (head, body) = read_answer(client).await;
            assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {head}");
            assert_eq!(body, format!("http://example.com/{i}").into_bytes());
        }
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_withheld_response_answers_504_and_advances() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Relay that swallows the first request and answers the second.
        let relay = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut dec = FrameDecoder::new();
            let mut buf = [0u8; 16 * 1024];
            let mut seen = 0;
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0);
                dec.feed(&buf[..n]);
                while let Some((_, payload)) = dec.next_frame() {
                    seen += 1;
                    if seen == 2 {
                        let env: RequestEnvelope = serde_json::from_slice(&payload).unwrap();
                        let resp = ResponseEnvelope::new(200, HashMap::new(), env.url.as_bytes());
                        let out = frame::encode(
                            FrameType::Response,
                            &serde_json::to_vec(&resp).unwrap(),
                        );
                        sock.write_all(&out).await.unwrap();
                        return;
                    }
                }
            }
        });

        let link = link::spawn(link_cfg(port));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Dispatcher::with_timeout(link, Duration::from_millis(200)).run(rx));

        let (agent1, client1) = sockpair().await;
        let (agent2, client2) = sockpair().await;
        tx.send(request_job("http://example.com/slow", agent1)).unwrap();
        tx.send(request_job("http://example.com/next", agent2)).unwrap();

        let (head1, body1) = read_answer(client1).await;
        assert!(head1.starts_with("HTTP/1.1 504 Gateway Timeout"), "head: {head1}");
        assert!(!body1.is_empty());

        // The queue advanced: the second request succeeds.
        let (head2, body2) = read_answer(client2).await;
        assert!(head2.starts_with("HTTP/1.1 200 OK"), "head: {head2}");
        assert_eq!(body2, b"http://example.com/next");
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_link_down_answers_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let link = link::spawn(link_cfg(port));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Dispatcher::new(link).run(rx));

        let (agent_side, client) = sockpair().await;
        tx.send(request_job("http://example.com/", agent_side)).unwrap();

        let (head, body) = read_answer(client).await;
        assert!(head.starts_with("HTTP/1.1 502 Bad Gateway"), "head: {head}");
        assert!(String::from_utf8(body).unwrap().contains("relay unavailable"));
    }

    #[tokio::test]
    async fn test_synthetic_relay_failure_passes_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let relay = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut dec = FrameDecoder::new();
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                dec.feed(&buf[..n]);
                if dec.next_frame().is_some() {
                    let resp = ResponseEnvelope::synthetic(502, "getaddrinfo failed for bad.invalid");
                    let out =
                        frame::encode(FrameType::Response, &serde_json::to_vec(&resp).unwrap());
                    sock.write_all(&out).await.unwrap();
                    return;
                }
            }
        });

        let link = link::spawn(link_cfg(port));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Dispatcher::new(link).run(rx));

        let (agent_side, client) = sockpair().await;
        tx.send(request_job("http://bad.invalid/", agent_side)).unwrap();

        let (head, body) = read_answer(client).await;
        assert!(head.starts_with("HTTP/1.1 502 Bad Gateway"), "head: {head}");
        assert_eq!(body, b"getaddrinfo failed for bad.invalid");
        relay.await.unwrap();
    }
}
