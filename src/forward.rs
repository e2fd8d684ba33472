//! HTTP forwarding to origin servers.
//!
//! Rewrites absolute-form request targets to origin-form, relays the
//! declared request body, and streams the response back as opaque
//! bytes. One upstream connection per forwarded request; no keep-alive
//! pooling.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::error::ProxyError;
use crate::request::{find_subsequence, head_end, ParsedRequest};

pub(crate) const RELAY_BUF_SIZE: usize = 8 * 1024;

/// Timeouts applied to the upstream leg.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub io: Duration,
}

/// Result of a completed forwarded transaction.
#[derive(Debug)]
pub struct ForwardOutcome {
    /// Status code parsed from the upstream status line, if one was seen.
    pub status: Option<u16>,
    /// Response body bytes relayed to the client (the head is relayed
    /// too, but the log record sizes the payload).
    pub bytes_to_client: u64,
}

/// Open the upstream connection for `(host, port)`.
///
/// Shared with the CONNECT tunnel; the supervisor picks the error
/// response from the returned variant.
pub async fn connect_upstream(
    host: &str,
    port: u16,
    timeouts: &Timeouts,
) -> Result<TcpStream, ProxyError> {
    match timeout(timeouts.connect, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect(e)),
        Err(_) => Err(ProxyError::UpstreamTimeout),
    }
}

/// Forward a parsed non-CONNECT request and relay the response.
///
/// `body_prefix` holds bytes the parser read past the header terminator;
/// they reach the upstream before any fresh client reads.
pub async fn forward_http(
    client: &mut TcpStream,
    request: &ParsedRequest,
    body_prefix: &[u8],
    timeouts: &Timeouts,
) -> Result<ForwardOutcome, ProxyError> {
    let mut upstream = connect_upstream(&request.host, request.port, timeouts).await?;

    let head = rewrite_head(request);
    write_upstream(&mut upstream, &head, timeouts.io).await?;
    if !body_prefix.is_empty() {
        write_upstream(&mut upstream, body_prefix, timeouts.io).await?;
    }

    // Remaining request body: bounded by Content-Length, or opaque until
    // client EOF for chunked coding. Anything else means no body.
    let body_remaining = request
        .content_length()
        .map(|length| length.saturating_sub(body_prefix.len() as u64))
        .unwrap_or(0);
    let body_until_eof = request.content_length().is_none() && request.is_chunked();

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let request_leg = async {
        let result = if body_remaining > 0 {
            copy_limited(&mut client_read, &mut upstream_write, body_remaining).await
        } else if body_until_eof {
            copy_until_eof(&mut client_read, &mut upstream_write).await
        } else {
            Ok(0)
        };
        if let Err(e) = result {
            trace!("request body relay ended early: {}", e);
        }
    };
    let response_leg = relay_response(&mut upstream_read, &mut client_write, timeouts.io);

    // The transaction is over when the response leg finishes; a stalled
    // or endless request body must not keep the connection alive.
    tokio::pin!(request_leg, response_leg);
    let mut request_done = false;
    loop {
        tokio::select! {
            outcome = &mut response_leg => break outcome,
            _ = &mut request_leg, if !request_done => request_done = true,
        }
    }
}

/// Upper bound on the response head retained for status and body-size
/// accounting; past it the remainder counts as body.
const RESPONSE_HEAD_SCAN_LIMIT: usize = 32 * 1024;

/// Relay the upstream response to the client verbatim. The first bytes
/// are additionally scanned for the status code and the head/body
/// boundary so the log record can size the payload.
async fn relay_response<R, W>(
    upstream: &mut R,
    client: &mut W,
    io_timeout: Duration,
) -> Result<ForwardOutcome, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF_SIZE];
    let mut relayed: u64 = 0;
    let mut body_bytes: u64 = 0;
    let mut status = None;
    let mut head_scan: Vec<u8> = Vec::new();
    let mut head_complete = false;
    loop {
        let n = match timeout(io_timeout, upstream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProxyError::UpstreamIo(e)),
            // A 504 is only owed while the client has seen nothing.
            Err(_) if relayed == 0 => return Err(ProxyError::UpstreamTimeout),
            Err(_) => {
                return Err(ProxyError::UpstreamIo(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream read timed out mid-response",
                )))
            }
        };
        if n == 0 {
            break;
        }
        if head_complete {
            body_bytes += n as u64;
        } else {
            head_scan.extend_from_slice(&buf[..n]);
            if status.is_none() {
                status = parse_status_line(&head_scan);
            }
            if let Some(end) = head_end(&head_scan) {
                head_complete = true;
                body_bytes += (head_scan.len() - end) as u64;
            } else if head_scan.len() > RESPONSE_HEAD_SCAN_LIMIT {
                head_complete = true;
            }
        }
        client
            .write_all(&buf[..n])
            .await
            .map_err(ProxyError::ClientIo)?;
        relayed += n as u64;
    }
    Ok(ForwardOutcome {
        status,
        bytes_to_client: body_bytes,
    })
}

async fn write_upstream<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    io_timeout: Duration,
) -> Result<(), ProxyError> {
    match timeout(io_timeout, writer.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ProxyError::UpstreamIo(e)),
        Err(_) => Err(ProxyError::UpstreamTimeout),
    }
}

async fn copy_limited<R, W>(reader: &mut R, writer: &mut W, mut remaining: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        remaining -= n as u64;
    }
    Ok(total)
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::io::copy(reader, writer).await
}

/// Build the upstream head: an origin-form start line plus the original
/// header block byte-for-byte, minus a single `Proxy-Connection` header,
/// plus a synthesised Host when the client sent none.
pub fn rewrite_head(request: &ParsedRequest) -> Vec<u8> {
    let raw = &request.raw_head[..];
    let headers_start = find_subsequence(raw, b"\n").map(|pos| pos + 1).unwrap_or(raw.len());

    let mut head = Vec::with_capacity(raw.len() + 64);
    head.extend_from_slice(request.method.as_bytes());
    head.push(b' ');
    head.extend_from_slice(origin_form_target(&request.target).as_bytes());
    head.push(b' ');
    head.extend_from_slice(request.version.as_bytes());
    head.extend_from_slice(b"\r\n");

    let has_host = request.header("host").is_some();
    let mut rest = &raw[headers_start..];
    let mut skipping_folds = false;
    while !rest.is_empty() {
        let line_end = find_subsequence(rest, b"\n").map(|pos| pos + 1).unwrap_or(rest.len());
        let line = &rest[..line_end];
        rest = &rest[line_end..];

        let content = trim_line_ending(line);
        if content.is_empty() {
            if !has_host {
                head.extend_from_slice(
                    format!("Host: {}\r\n", request.host_header_value()).as_bytes(),
                );
            }
            head.extend_from_slice(b"\r\n");
            break;
        }
        if skipping_folds && (content[0] == b' ' || content[0] == b'\t') {
            continue;
        }
        skipping_folds = false;
        if header_name_is(content, "proxy-connection") {
            skipping_folds = true;
            continue;
        }
        head.extend_from_slice(line);
    }
    head
}

/// Origin-form request target for an absolute-form one, preserving the
/// path and query bytes exactly.
fn origin_form_target(target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    let Some(scheme_end) = target.find("://") else {
        return target.to_string();
    };
    let after_authority = &target[scheme_end + 3..];
    match after_authority.find(['/', '?']) {
        Some(pos) if after_authority.as_bytes()[pos] == b'?' => {
            format!("/{}", &after_authority[pos..])
        }
        Some(pos) => after_authority[pos..].to_string(),
        None => "/".to_string(),
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn header_name_is(line: &[u8], name: &str) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    line[..colon].trim_ascii().eq_ignore_ascii_case(name.as_bytes())
}

/// Status code from the first complete line of an upstream response.
fn parse_status_line(chunk: &[u8]) -> Option<u16> {
    let line_end = find_subsequence(chunk, b"\n")?;
    let line = std::str::from_utf8(&chunk[..line_end]).ok()?.trim_end();
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn parsed(head: &str) -> ParsedRequest {
        ParsedRequest::parse(Bytes::copy_from_slice(head.as_bytes())).unwrap()
    }

    #[test]
    fn test_rewrite_absolute_to_origin_form() {
        let request =
            parsed("GET http://example.org/a/b?q=%20x HTTP/1.1\r\nHost: example.org\r\nAccept: */*\r\n\r\n");
        let head = rewrite_head(&request);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /a/b?q=%20x HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_rewrite_synthesises_host_when_absent() {
        let request = parsed("GET http://example.org:8080/x HTTP/1.1\r\nAccept: */*\r\n\r\n");
        let text = String::from_utf8(rewrite_head(&request)).unwrap();
        assert!(text.contains("Host: example.org:8080\r\n"));
    }

    #[test]
    fn test_rewrite_strips_proxy_connection_only() {
        let request = parsed(
            "GET http://h/ HTTP/1.1\r\nHost: h\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive\r\n\r\n",
        );
        let text = String::from_utf8(rewrite_head(&request)).unwrap();
        assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Host: h\r\n"));
    }

    #[test]
    fn test_origin_form_target_edge_cases() {
        assert_eq!(origin_form_target("http://h/p/q?r=s"), "/p/q?r=s");
        assert_eq!(origin_form_target("http://h"), "/");
        assert_eq!(origin_form_target("http://h?x=1"), "/?x=1");
        assert_eq!(origin_form_target("/already/origin"), "/already/origin");
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n\r\nabc"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.0 404 Not Found\r\n"), Some(404));
        assert_eq!(parse_status_line(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_copy_limited_stops_at_bound() {
        let mut reader = std::io::Cursor::new(b"0123456789".to_vec());
        let mut sink = Vec::new();
        let copied = copy_limited(&mut reader, &mut sink, 4).await.unwrap();
        assert_eq!(copied, 4);
        assert_eq!(sink, b"0123");
    }
}
