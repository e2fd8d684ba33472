//! Responses the proxy originates itself.
//!
//! Everything else a client receives is relayed upstream bytes; these
//! are the only locally generated writes.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Literal CONNECT acknowledgement. Nothing else is ever written on a
/// successful tunnel before relay begins.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Write a complete error response for `status`.
///
/// Best effort: the client may already be gone, and the record of the
/// failure is the log line, not this write.
pub async fn write_error<W: AsyncWrite + Unpin>(stream: &mut W, status: u16) {
    let _ = stream.write_all(render_error(status).as_bytes()).await;
}

fn render_error(status: u16) -> String {
    let (reason, body) = match status {
        400 => ("Bad Request", ""),
        403 => ("Forbidden", "Access Denied"),
        502 => ("Bad Gateway", ""),
        504 => ("Gateway Timeout", ""),
        _ => ("Internal Server Error", ""),
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
}
