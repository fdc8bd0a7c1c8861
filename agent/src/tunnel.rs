//! CONNECT tunnel bridge.
//!
//! HTTPS tunnels are bridged straight from the agent to the requested
//! target: the bridge dials `host:port`, answers the local client with a
//! tunnel-established status line, and splices bytes both ways until either
//! side closes. Tunnel jobs still pass through the dispatcher queue, so one
//! tunnel session is serialized exactly like one relayed request.

use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use unilink_shared::Result;

use crate::http;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Dial `target` and splice the client connection onto it. `early_data` is
/// anything the client pipelined after its CONNECT head; it is forwarded
/// ahead of the splice.
pub async fn bridge(mut client: TcpStream, target: &str, early_data: &[u8]) -> Result<()> {
    let mut upstream = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(e) => {
            let answer = http::render_error(502, &format!("cannot reach {target}: {e}"));
            let _ = client.write_all(&answer).await;
            let _ = client.shutdown().await;
            return Err(e.into());
        }
    };

    client.write_all(ESTABLISHED).await?;
    if !early_data.is_empty() {
        upstream.write_all(early_data).await?;
    }

    match copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => debug!("tunnel to {target} closed ({up} bytes up, {down} bytes down)"),
        Err(e) => debug!("tunnel to {target} aborted: {e}"),
    }
    Ok(())
}
