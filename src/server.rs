//! Connection supervision.
//!
//! Owns the listening socket, the concurrency permits, and the
//! per-connection lifecycle: deadline-bounded head read, parse, filter
//! decision, dispatch to the forwarder or tunnel, and exactly one log
//! record per accepted connection. Handler failures never reach the
//! accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::filter::FilterEngine;
use crate::forward::{self, ForwardOutcome, Timeouts};
use crate::logger::EventLogger;
use crate::request::{self, ParsedRequest};
use crate::response;
use crate::shutdown::ShutdownSignal;
use crate::tunnel::{self, TunnelOutcome};

pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ProxyConfig,
    filter: Arc<FilterEngine>,
    logger: EventLogger,
    shutdown: ShutdownSignal,
    permits: Arc<Semaphore>,
}

impl ProxyServer {
    /// Bind the listening socket with the configured backlog.
    ///
    /// Binding happens here rather than in [`run`](Self::run) so startup
    /// failures surface before the accept loop, and so tests can read
    /// the ephemeral port from [`local_addr`](Self::local_addr).
    pub async fn bind(
        config: ProxyConfig,
        filter: Arc<FilterEngine>,
        logger: EventLogger,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let addr: SocketAddr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
                })
            })
            .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {}", addr))?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;

        let permits = Arc::new(Semaphore::new(config.thread_pool_size));
        info!(
            "listening on {} (max {} connections, backlog {})",
            local_addr, config.thread_pool_size, config.backlog
        );

        Ok(Self {
            listener,
            local_addr,
            config,
            filter,
            logger,
            shutdown,
            permits,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Returns once shutdown triggers and the in-flight
    /// connections drain (or the grace period expires).
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.logger
            .info(&format!("Proxy server started on {}", self.local_addr));

        loop {
            if self.shutdown.is_shutting_down() {
                break;
            }
            // Hold a permit before accepting: past the concurrency
            // budget, new connections wait in the kernel backlog.
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = self.permits.clone().acquire_owned() => {
                    permit.expect("connection semaphore closed")
                }
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
            };
            debug!("accepted connection from {}", peer);

            let handler = ConnectionHandler {
                filter: self.filter.clone(),
                logger: self.logger.clone(),
                shutdown: self.shutdown.clone(),
                timeouts: Timeouts {
                    connect: self.config.connect_timeout(),
                    io: self.config.io_timeout(),
                },
                max_header_bytes: self.config.max_header_bytes,
            };
            let guard = self.shutdown.track_connection();
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                handler.handle(stream, peer).await;
            });
        }

        drop(self.listener);
        info!(
            "listener closed, draining {} active connections",
            self.shutdown.active_connections()
        );
        self.shutdown
            .wait_for_drain(self.config.shutdown_grace())
            .await;
        self.logger.info("Proxy server shut down");
        Ok(())
    }
}

/// Everything one connection needs, detached from the server so the
/// accept loop keeps running while handlers live on their own tasks.
struct ConnectionHandler {
    filter: Arc<FilterEngine>,
    logger: EventLogger,
    shutdown: ShutdownSignal,
    timeouts: Timeouts,
    max_header_bytes: usize,
}

/// Context accumulated while a connection progresses; consumed by the
/// one log record its terminal transition emits.
#[derive(Default)]
struct Transaction {
    dest: Option<(String, u16)>,
    request_line: Option<String>,
}

enum Summary {
    Forwarded(ForwardOutcome),
    Tunneled(TunnelOutcome),
}

impl ConnectionHandler {
    /// Drive one connection to its terminal state and emit its record.
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut transaction = Transaction::default();

        // Flag check after subscribing: a broadcast sent before the
        // subscription would otherwise be missed.
        let result = if self.shutdown.is_shutting_down() {
            Err(ProxyError::Shutdown)
        } else {
            tokio::select! {
                result = self.drive(&mut stream, peer, &mut transaction) => result,
                _ = shutdown_rx.recv() => Err(ProxyError::Shutdown),
            }
        };

        let dest = transaction
            .dest
            .as_ref()
            .map(|(host, port)| (host.as_str(), *port));
        let request_line = transaction.request_line.as_deref();

        match result {
            Ok(Summary::Forwarded(outcome)) => {
                let (host, port) = dest.unwrap_or(("-", 0));
                let status = outcome
                    .status
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "000".to_string());
                self.logger.allowed(
                    peer,
                    host,
                    port,
                    request_line.unwrap_or("-"),
                    &status,
                    outcome.bytes_to_client,
                );
            }
            Ok(Summary::Tunneled(outcome)) => {
                let (host, port) = dest.unwrap_or(("-", 0));
                debug!(
                    "tunnel closed: {} bytes to upstream, {} bytes to client",
                    outcome.bytes_to_upstream, outcome.bytes_to_client
                );
                self.logger.allowed(
                    peer,
                    host,
                    port,
                    request_line.unwrap_or("-"),
                    "200",
                    outcome.bytes_to_client,
                );
            }
            Err(error) => {
                // Errors past the CONNECT ack and mid-stream failures
                // carry no status and tear down silently.
                if let Some(status) = error.response_status() {
                    response::write_error(&mut stream, status).await;
                }
                match error {
                    ProxyError::Blocked => {
                        let (host, port) = dest.unwrap_or(("-", 0));
                        self.logger
                            .blocked(peer, host, port, request_line.unwrap_or("-"));
                    }
                    error => {
                        self.logger.failed(
                            peer,
                            dest,
                            request_line,
                            &format!("{}: {}", error.reason(), error),
                        );
                    }
                }
            }
        }

        let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
    }

    async fn drive(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        transaction: &mut Transaction,
    ) -> Result<Summary, ProxyError> {
        // The initial-request deadline covers the whole head read.
        let (head, body_prefix) =
            match timeout(self.timeouts.io, request::read_head(stream, self.max_header_bytes))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ProxyError::ClientIo(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for the request head",
                    )))
                }
            };

        let request = ParsedRequest::parse(head)?;
        transaction.request_line = Some(request.request_line());
        transaction.dest = Some((request.host.clone(), request.port));
        debug!(
            "{} requested {} {}:{}",
            peer, request.method, request.host, request.port
        );

        if self.filter.is_blocked(&request.host, request.port) {
            return Err(ProxyError::Blocked);
        }

        if request.is_connect {
            let outcome =
                tunnel::run_tunnel(stream, &request.host, request.port, &self.timeouts).await?;
            Ok(Summary::Tunneled(outcome))
        } else {
            let outcome =
                forward::forward_http(stream, &request, &body_prefix, &self.timeouts).await?;
            Ok(Summary::Forwarded(outcome))
        }
    }
}
