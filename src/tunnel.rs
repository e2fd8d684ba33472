//! CONNECT tunneling.
//!
//! After the acknowledgement the proxy is a byte pipe: two copy
//! directions run until each side's reader hits EOF. EOF propagates as a
//! directional shutdown (TCP FIN) on the peer's write side so TLS-style
//! close handshakes complete while the reverse direction drains.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::ProxyError;
use crate::forward::{connect_upstream, Timeouts, RELAY_BUF_SIZE};
use crate::response;

/// Byte counts for a finished tunnel.
#[derive(Debug, Default)]
pub struct TunnelOutcome {
    /// Bytes relayed client -> upstream.
    pub bytes_to_upstream: u64,
    /// Bytes relayed upstream -> client.
    pub bytes_to_client: u64,
}

/// Establish and run a CONNECT tunnel to `(host, port)`.
///
/// The acknowledgement is the only locally generated write on the
/// success path; after it, payload bytes cross untouched in both
/// directions until the peers are done.
pub async fn run_tunnel(
    client: &mut TcpStream,
    host: &str,
    port: u16,
    timeouts: &Timeouts,
) -> Result<TunnelOutcome, ProxyError> {
    let mut upstream = connect_upstream(host, port, timeouts).await?;

    client
        .write_all(response::CONNECT_ESTABLISHED)
        .await
        .map_err(ProxyError::ClientIo)?;
    debug!("tunnel established to {}:{}", host, port);

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let (bytes_to_upstream, bytes_to_client) = tokio::join!(
        relay_direction(&mut client_read, &mut upstream_write),
        relay_direction(&mut upstream_read, &mut client_write),
    );

    Ok(TunnelOutcome {
        bytes_to_upstream,
        bytes_to_client,
    })
}

/// Copy until EOF, then half-close the write peer. Read and write
/// failures end the direction the same way EOF does; the reverse
/// direction decides for itself.
async fn relay_direction<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!("tunnel read ended: {}", e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            trace!("tunnel write ended: {}", e);
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    total
}
