//! Transaction event log.
//!
//! One line is appended per terminal transition:
//!
//! ```text
//! 2026-08-02 14:05:01.123 - INFO - ALLOWED | 127.0.0.1:51224 -> example.org:80 | GET http://example.org/x HTTP/1.1 | 200 | 3 bytes
//! ```
//!
//! Writes are serialised by the file mutex so concurrent handlers never
//! interleave partial records. A failed open or write drops the record
//! rather than stalling a connection; records are also mirrored to
//! `tracing` for console capture.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EventLogger {
    file: Arc<Mutex<Option<File>>>,
}

impl EventLogger {
    /// Open the log file in append mode, creating its directory first.
    ///
    /// On failure the logger stays usable and silently discards records.
    pub fn open(path: &Path) -> Self {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    warn!("could not create log directory {}: {}", dir.display(), e);
                }
            }
        }
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("could not open log file {}: {}", path.display(), e);
                None
            }
        };
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    /// Logger that discards every record. Used by tests.
    pub fn disabled() -> Self {
        Self {
            file: Arc::new(Mutex::new(None)),
        }
    }

    /// Record for an allowed, completed transaction.
    pub fn allowed(
        &self,
        client: SocketAddr,
        host: &str,
        port: u16,
        request_line: &str,
        status: &str,
        bytes: u64,
    ) {
        self.append(
            "INFO",
            &format!(
                "ALLOWED | {}:{} -> {}:{} | {} | {} | {} bytes",
                client.ip(),
                client.port(),
                host,
                port,
                request_line,
                status,
                bytes
            ),
        );
    }

    /// Record for a request denied by the filter rules.
    pub fn blocked(&self, client: SocketAddr, host: &str, port: u16, request_line: &str) {
        self.append(
            "WARNING",
            &format!(
                "BLOCKED | {}:{} -> {}:{} | {}",
                client.ip(),
                client.port(),
                host,
                port,
                request_line
            ),
        );
    }

    /// Record for a transaction that ended in an error. Destination and
    /// request line may be unknown when the failure precedes parsing.
    pub fn failed(
        &self,
        client: SocketAddr,
        dest: Option<(&str, u16)>,
        request_line: Option<&str>,
        reason: &str,
    ) {
        let dest = match dest {
            Some((host, port)) => format!("{}:{}", host, port),
            None => "-".to_string(),
        };
        self.append(
            "ERROR",
            &format!(
                "ERROR | {}:{} -> {} | {} | {}",
                client.ip(),
                client.port(),
                dest,
                request_line.unwrap_or("-"),
                reason
            ),
        );
    }

    /// Lifecycle message (startup, shutdown, degraded filter).
    pub fn info(&self, message: &str) {
        self.append("INFO", message);
    }

    pub fn error(&self, message: &str) {
        self.append("ERROR", message);
    }

    fn append(&self, level: &str, message: &str) {
        debug!(target: "proxy_log", "{} {}", level, message);
        let line = format!(
            "{} - {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message
        );
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if let Some(ref mut file) = *guard {
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("dropped log record: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_log(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("httpgate-logger-{}-{}", std::process::id(), name))
    }

    fn client() -> SocketAddr {
        "10.0.0.1:51000".parse().unwrap()
    }

    #[test]
    fn test_allowed_record_format() {
        let path = temp_log("allowed.log");
        let _ = std::fs::remove_file(&path);
        let logger = EventLogger::open(&path);

        logger.allowed(
            client(),
            "example.org",
            80,
            "GET http://example.org/x HTTP/1.1",
            "200",
            3,
        );

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(
            "INFO - ALLOWED | 10.0.0.1:51000 -> example.org:80 | GET http://example.org/x HTTP/1.1 | 200 | 3 bytes"
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_blocked_record_omits_status_and_bytes() {
        let path = temp_log("blocked.log");
        let _ = std::fs::remove_file(&path);
        let logger = EventLogger::open(&path);

        logger.blocked(client(), "example.com", 80, "GET http://example.com/ HTTP/1.1");

        let text = std::fs::read_to_string(&path).unwrap();
        let line = text.lines().next().unwrap();
        assert!(line.contains("WARNING - BLOCKED | 10.0.0.1:51000 -> example.com:80"));
        assert!(line.ends_with("GET http://example.com/ HTTP/1.1"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_failed_record_with_unknown_destination() {
        let path = temp_log("failed.log");
        let _ = std::fs::remove_file(&path);
        let logger = EventLogger::open(&path);

        logger.failed(client(), None, None, "MALFORMED_REQUEST: bad request line");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("ERROR - ERROR | 10.0.0.1:51000 -> - | - | MALFORMED_REQUEST"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_disabled_logger_drops_records() {
        let logger = EventLogger::disabled();
        logger.info("nothing should happen");
        logger.failed(client(), None, None, "CLIENT_IO: gone");
    }
}
