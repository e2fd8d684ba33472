//! HTTP request head reading and parsing.
//!
//! The parser reads just far enough to learn the request's destination:
//! the start line, the header block, and nothing of the body. The raw
//! head bytes are retained so the forwarder can rewrite the request
//! target and relay everything else untouched.

use std::io;

use bytes::{Bytes, BytesMut};
use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;

/// Parsed request head.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// Method token, uppercased.
    pub method: String,
    /// Request target exactly as it appeared on the wire.
    pub target: String,
    /// `HTTP/1.x` version token.
    pub version: String,
    /// Destination host, lowercased; IPv6 literals unbracketed.
    pub host: String,
    /// Destination port.
    pub port: u16,
    pub is_connect: bool,
    /// Headers in wire order with names preserved for forwarding.
    pub headers: Vec<(String, String)>,
    /// Start line + header block + terminating empty line, byte-exact.
    pub raw_head: Bytes,
}

/// Read from `stream` until the end of the header section.
///
/// Returns the head bytes (terminator included) and any bytes read past
/// it, i.e. a pipelined request body the forwarder must not drop. The
/// head is bounded by `max`; overflow is a malformed request.
pub async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    max: usize,
) -> Result<(Bytes, Bytes), ProxyError> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = head_end(&buf) {
            if end > max {
                return Err(ProxyError::MalformedRequest(format!(
                    "header section exceeds {} bytes",
                    max
                )));
            }
            let rest = buf.split_off(end);
            return Ok((buf.freeze(), rest.freeze()));
        }
        if buf.len() >= max {
            return Err(ProxyError::MalformedRequest(format!(
                "header section exceeds {} bytes",
                max
            )));
        }
        let n = stream.read_buf(&mut buf).await.map_err(ProxyError::ClientIo)?;
        if n == 0 {
            return Err(if buf.is_empty() {
                ProxyError::ClientIo(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a request arrived",
                ))
            } else {
                ProxyError::MalformedRequest(
                    "connection closed inside the header section".to_string(),
                )
            });
        }
    }
}

/// Offset one past the header terminator: CRLF CRLF, or the earliest
/// bare LF LF as a fallback for sloppy clients.
pub(crate) fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = find_subsequence(buf, b"\r\n\r\n").map(|pos| pos + 4);
    let lf = find_subsequence(buf, b"\n\n").map(|pos| pos + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl ParsedRequest {
    /// Parse a complete request head as returned by [`read_head`].
    pub fn parse(raw_head: Bytes) -> Result<Self, ProxyError> {
        let text = std::str::from_utf8(&raw_head).map_err(|_| {
            ProxyError::MalformedRequest("header section is not valid UTF-8".to_string())
        })?;

        let mut lines = text.lines();
        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| ProxyError::MalformedRequest("empty request".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(method), Some(target), Some(version), None) => (method, target, version),
            _ => {
                return Err(ProxyError::MalformedRequest(format!(
                    "bad request line: {}",
                    request_line
                )))
            }
        };
        if !version.starts_with("HTTP/") {
            return Err(ProxyError::MalformedRequest(format!(
                "bad HTTP version: {}",
                version
            )));
        }
        let method = method.to_ascii_uppercase();

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            // obs-fold: a continuation line extends the previous value.
            if line.starts_with(' ') || line.starts_with('\t') {
                let Some((_, value)) = headers.last_mut() else {
                    return Err(ProxyError::MalformedRequest(
                        "continuation line before any header".to_string(),
                    ));
                };
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(ProxyError::MalformedRequest(format!(
                    "header line without a colon: {}",
                    line
                )));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let is_connect = method == "CONNECT";
        let (host, port) = if is_connect {
            connect_host_port(target)?
        } else if target.starts_with('/') {
            let host_value =
                lookup(&headers, "host").ok_or(ProxyError::MissingHost)?;
            host_header_host_port(host_value)?
        } else {
            absolute_host_port(target)?
        };

        Ok(ParsedRequest {
            method,
            target: target.to_string(),
            version: version.to_string(),
            host,
            port,
            is_connect,
            headers,
            raw_head,
        })
    }

    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }

    /// The start line as logged: `METHOD TARGET VERSION`.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }

    /// Declared request body length, when present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// Whether the request body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map_or(false, |value| value.to_ascii_lowercase().contains("chunked"))
    }

    /// Value for a synthesised Host header, rebracketing IPv6 literals.
    pub fn host_header_value(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == 80 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

fn lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host)
}

/// CONNECT targets are authority-form `host:port`; the port is mandatory.
fn connect_host_port(target: &str) -> Result<(String, u16), ProxyError> {
    let uri: Uri = target
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("bad CONNECT target: {}", target)))?;
    if uri.scheme().is_some() || uri.path_and_query().is_some() {
        return Err(ProxyError::MalformedRequest(format!(
            "CONNECT target must be authority-form: {}",
            target
        )));
    }
    let authority = uri.authority().ok_or_else(|| {
        ProxyError::MalformedRequest(format!("bad CONNECT target: {}", target))
    })?;
    let port = authority.port_u16().ok_or_else(|| {
        ProxyError::MalformedRequest(format!("CONNECT target has no port: {}", target))
    })?;
    Ok((unbracket(authority.host()).to_ascii_lowercase(), port))
}

/// Absolute-form targets carry the destination in the URI; the port
/// defaults from the scheme.
fn absolute_host_port(target: &str) -> Result<(String, u16), ProxyError> {
    let uri: Uri = target
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("bad request target: {}", target)))?;
    let scheme = uri.scheme_str().ok_or_else(|| {
        ProxyError::MalformedRequest(format!(
            "request target is neither origin-form nor absolute-form: {}",
            target
        ))
    })?;
    let host = uri.host().ok_or_else(|| {
        ProxyError::MalformedRequest(format!("absolute-form target has no host: {}", target))
    })?;
    let port = uri
        .port_u16()
        .unwrap_or(if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 });
    Ok((unbracket(host).to_ascii_lowercase(), port))
}

/// Origin-form requests name their destination in the Host header.
fn host_header_host_port(value: &str) -> Result<(String, u16), ProxyError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ProxyError::MissingHost);
    }
    if let Some(rest) = value.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(ProxyError::MalformedRequest(format!(
                "unterminated IPv6 literal in Host: {}",
                value
            )));
        };
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => 80,
            None => {
                return Err(ProxyError::MalformedRequest(format!(
                    "bad Host header: {}",
                    value
                )))
            }
        };
        return Ok((host.to_ascii_lowercase(), port));
    }
    match value.rsplit_once(':') {
        // An unbracketed colon either separates the port or belongs to a
        // bare IPv6 literal, which has more than one.
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_ascii_lowercase(), parse_port(port)?))
        }
        Some(_) => Ok((value.to_ascii_lowercase(), 80)),
        None => Ok((value.to_ascii_lowercase(), 80)),
    }
}

fn parse_port(port: &str) -> Result<u16, ProxyError> {
    port.parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("bad port: {}", port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(head: &str) -> Result<ParsedRequest, ProxyError> {
        ParsedRequest::parse(Bytes::copy_from_slice(head.as_bytes()))
    }

    #[test]
    fn test_absolute_form_get() {
        let request =
            parse("GET http://Example.ORG/x?a=1 HTTP/1.1\r\nHost: example.org\r\n\r\n").unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.host, "example.org");
        assert_eq!(request.port, 80);
        assert!(!request.is_connect);
        assert_eq!(request.target, "http://Example.ORG/x?a=1");
        assert_eq!(
            request.request_line(),
            "GET http://Example.ORG/x?a=1 HTTP/1.1"
        );
    }

    #[test]
    fn test_absolute_form_with_port_and_https_default() {
        let request = parse("GET http://example.org:8080/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.port, 8080);

        let request = parse("GET https://example.org/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.port, 443);
    }

    #[test]
    fn test_origin_form_uses_host_header() {
        let request = parse("GET /path HTTP/1.1\r\nHost: upstream.test:8080\r\n\r\n").unwrap();
        assert_eq!(request.host, "upstream.test");
        assert_eq!(request.port, 8080);

        let request = parse("GET /path HTTP/1.1\r\nHost: upstream.test\r\n\r\n").unwrap();
        assert_eq!(request.port, 80);
    }

    #[test]
    fn test_origin_form_without_host_fails() {
        let err = parse("GET /path HTTP/1.1\r\nAccept: */*\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::MissingHost));
    }

    #[test]
    fn test_connect_authority_form() {
        let request = parse("CONNECT www.tls.test:443 HTTP/1.1\r\n\r\n").unwrap();
        assert!(request.is_connect);
        assert_eq!(request.host, "www.tls.test");
        assert_eq!(request.port, 443);
    }

    #[test]
    fn test_connect_without_port_fails() {
        let err = parse("CONNECT www.tls.test HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[test]
    fn test_ipv6_literals_are_unbracketed() {
        let request = parse("CONNECT [::1]:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.host, "::1");
        assert_eq!(request.port, 443);
        assert_eq!(request.host_header_value(), "[::1]:443");

        let request = parse("GET /x HTTP/1.1\r\nHost: [2001:db8::2]:8080\r\n\r\n").unwrap();
        assert_eq!(request.host, "2001:db8::2");
        assert_eq!(request.port, 8080);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive_names_preserved() {
        let request =
            parse("GET http://h/ HTTP/1.1\r\nX-Custom-Header: v\r\ncontent-length: 12\r\n\r\n")
                .unwrap();
        assert_eq!(request.header("x-custom-header"), Some("v"));
        assert_eq!(request.headers[0].0, "X-Custom-Header");
        assert_eq!(request.content_length(), Some(12));
    }

    #[test]
    fn test_obs_fold_continuation_joins_value() {
        let request =
            parse("GET http://h/ HTTP/1.1\r\nX-Long: first\r\n second\r\n\tthird\r\n\r\n").unwrap();
        assert_eq!(request.header("x-long"), Some("first second third"));
    }

    #[test]
    fn test_bare_lf_line_endings_accepted() {
        let request = parse("GET /x HTTP/1.1\nHost: h.test\n\n").unwrap();
        assert_eq!(request.host, "h.test");
    }

    #[test]
    fn test_chunked_detection() {
        let request =
            parse("POST http://h/ HTTP/1.1\r\nTransfer-Encoding: gzip, Chunked\r\n\r\n").unwrap();
        assert!(request.is_chunked());
    }

    #[test]
    fn test_garbage_request_line_fails() {
        assert!(matches!(
            parse("NOT A VALID REQUEST LINE AT ALL\r\n\r\n").unwrap_err(),
            ProxyError::MalformedRequest(_)
        ));
        assert!(matches!(
            parse("GET /x SIP/2.0\r\nHost: h\r\n\r\n").unwrap_err(),
            ProxyError::MalformedRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_read_head_splits_pipelined_body() {
        let wire = b"POST http://h/ HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody".to_vec();
        let mut reader = std::io::Cursor::new(wire);
        let (head, rest) = read_head(&mut reader, 16 * 1024).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(&rest[..], b"body");
    }

    #[tokio::test]
    async fn test_read_head_enforces_limit() {
        let wire = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(512));
        let mut reader = std::io::Cursor::new(wire.into_bytes());
        let err = read_head(&mut reader, 128).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_read_head_eof_before_terminator() {
        let mut reader = std::io::Cursor::new(b"GET / HTTP/1.1\r\nHost:".to_vec());
        let err = read_head(&mut reader, 16 * 1024).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));

        let mut reader = std::io::Cursor::new(Vec::new());
        let err = read_head(&mut reader, 16 * 1024).await.unwrap_err();
        assert!(matches!(err, ProxyError::ClientIo(_)));
    }
}
