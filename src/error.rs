//! Connection-level error taxonomy.
//!
//! Every failure that terminates a connection maps to one of these
//! variants. The supervisor uses the mapping to pick the client-facing
//! response (when one is still owed) and the reason tag written to the
//! event log.

use std::io;

use thiserror::Error;

/// Terminal failure of a single proxied connection.
///
/// Errors are always contained to the connection they occurred on; the
/// accept loop never sees them.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request line or header section could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Origin-form request without a Host header.
    #[error("request has no Host header")]
    MissingHost,

    /// Destination denied by the filter rules.
    #[error("destination denied by filter rules")]
    Blocked,

    /// Upstream TCP connect failed (refused, unreachable, resolution).
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(#[source] io::Error),

    /// Upstream connect or first response byte deadline elapsed.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Upstream socket failed mid-transfer.
    #[error("upstream i/o failed: {0}")]
    UpstreamIo(#[source] io::Error),

    /// Client socket failed or went away.
    #[error("client i/o failed: {0}")]
    ClientIo(#[source] io::Error),

    /// Cooperative cancellation during shutdown.
    #[error("connection cancelled by shutdown")]
    Shutdown,
}

impl ProxyError {
    /// Stable tag used in ERROR log records.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::MalformedRequest(_) => "MALFORMED_REQUEST",
            ProxyError::MissingHost => "MISSING_HOST",
            ProxyError::Blocked => "BLOCKED",
            ProxyError::UpstreamConnect(_) => "UPSTREAM_CONNECT",
            ProxyError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyError::UpstreamIo(_) => "UPSTREAM_IO",
            ProxyError::ClientIo(_) => "CLIENT_IO",
            ProxyError::Shutdown => "SHUTDOWN",
        }
    }

    /// Status code of the response the proxy still owes the client for
    /// this failure. Mid-stream failures and shutdown tear down silently.
    pub fn response_status(&self) -> Option<u16> {
        match self {
            ProxyError::MalformedRequest(_) | ProxyError::MissingHost => Some(400),
            ProxyError::Blocked => Some(403),
            ProxyError::UpstreamConnect(_) => Some(502),
            ProxyError::UpstreamTimeout => Some(504),
            ProxyError::UpstreamIo(_) | ProxyError::ClientIo(_) | ProxyError::Shutdown => None,
        }
    }
}
