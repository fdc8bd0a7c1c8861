//! Local proxy surface: request reading and response rendering for the
//! listener that ship-side clients talk to.
//!
//! Requests arrive in proxy form — absolute-form URLs (`GET http://...`),
//! origin-form paths with a `Host` header, or `CONNECT host:port`. Bodies
//! are read by `Content-Length`; chunked uploads are refused with 411.

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use unilink_shared::envelope::ResponseEnvelope;

/// Hard cap on a request head; anything larger is answered with 431.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Headers the agent recomputes when replaying a relayed response: the body
/// is written whole with a fresh `Content-Length`, so the origin's framing
/// headers must not survive.
const DROPPED_RESPONSE_HEADERS: [&str; 4] =
    ["content-length", "transfer-encoding", "connection", "keep-alive"];

/// A parsed local proxy request.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: String,
    /// Request-line target: absolute-form URL, origin-form path, or
    /// `host:port` for CONNECT.
    pub target: String,
    /// Headers with name case preserved as received.
    pub headers: HashMap<String, String>,
    /// Request body. For CONNECT this holds any bytes the client pipelined
    /// after its head instead.
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("connection closed before a full request arrived")]
    Incomplete,
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("chunked request bodies are not supported")]
    LengthRequired,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Status to answer the client with, when the fault is answerable.
    pub fn status(&self) -> Option<u16> {
        match self {
            ParseError::HeadTooLarge => Some(431),
            ParseError::Malformed(_) => Some(400),
            ParseError::LengthRequired => Some(411),
            ParseError::Incomplete | ParseError::Io(_) => None,
        }
    }
}

/// Read one proxy request off the stream.
pub async fn read_request<R>(stream: &mut R) -> Result<ProxyRequest, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ParseError::HeadTooLarge);
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(ParseError::Incomplete);
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| ParseError::Malformed("head is not valid UTF-8"))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::Malformed("empty request"))?;
    let (method, target) = parse_request_line(request_line)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = split_header(line).ok_or(ParseError::Malformed("bad header line"))?;
        headers.insert(name.to_string(), value.to_string());
    }

    let trailing = buf[head_end + 4..].to_vec();
    if method.eq_ignore_ascii_case("CONNECT") {
        // No body to read; whatever follows the head belongs to the tunnel.
        return Ok(ProxyRequest { method, target, headers, body: trailing });
    }

    if get(&headers, "transfer-encoding").is_some() {
        return Err(ParseError::LengthRequired);
    }
    let content_len = get(&headers, "content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = trailing;
    while body.len() < content_len {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(ParseError::Incomplete);
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_len);

    Ok(ProxyRequest { method, target, headers, body })
}

/// Byte offset of the `\r\n\r\n` terminating a request head.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(line: &str) -> Result<(String, String), ParseError> {
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or(ParseError::Malformed("missing method"))?;
    let target = parts.next().ok_or(ParseError::Malformed("missing target"))?;
    let version = parts.next().ok_or(ParseError::Malformed("missing HTTP version"))?;
    if !version.starts_with("HTTP/") {
        return Err(ParseError::Malformed("bad HTTP version"));
    }
    Ok((method.to_string(), target.to_string()))
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(':')?;
    Some((line[..idx].trim(), line[idx + 1..].trim()))
}

fn get<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Render a relayed response back to the local client. Framing headers are
/// recomputed; the connection is closed after one exchange.
pub fn render_response(resp: &ResponseEnvelope, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        resp.status_code,
        reason_phrase(resp.status_code)
    );
    for (name, value) in &resp.headers {
        if DROPPED_RESPONSE_HEADERS.iter().any(|d| name.eq_ignore_ascii_case(d)) {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Render a locally generated error answer with a plain-text reason body.
pub fn render_error(status: u16, reason: &str) -> Vec<u8> {
    let body = format!("{reason}\n");
    let mut bytes = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        body.len()
    )
    .into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        411 => "Length Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "",
    }
}
