//! Proxy configuration.
//!
//! Loaded once at startup from a JSON file. Every field is optional in
//! the file and takes the defaults below when absent; unknown keys are
//! ignored. A missing file is written out with the defaults so a first
//! run leaves a template behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the listening socket binds to.
    pub host: String,
    /// Port the listening socket binds to.
    pub port: u16,
    /// Maximum number of in-flight connections.
    pub thread_pool_size: usize,
    /// Kernel accept queue depth.
    pub backlog: u32,
    /// Rule file consulted by the filter engine.
    pub blocked_domains_file: PathBuf,
    /// Transaction log file.
    pub log_file: PathBuf,
    /// Upstream connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read/write timeout in seconds, applied to both legs.
    pub io_timeout_secs: u64,
    /// Upper bound on a request head (start line plus headers).
    pub max_header_bytes: usize,
    /// Grace period for draining connections on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            thread_pool_size: 10,
            backlog: 100,
            blocked_domains_file: PathBuf::from("config/blocked_domains.txt"),
            log_file: PathBuf::from("logs/proxy.log"),
            connect_timeout_secs: 10,
            io_timeout_secs: 30,
            max_header_bytes: 16 * 1024,
            shutdown_grace_secs: 5,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from `path`.
    ///
    /// A missing file is created with the defaults; invalid JSON is a
    /// startup error (the process exits 1 rather than guessing).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.write_template(path) {
                warn!("could not write default config to {}: {}", path.display(), e);
            } else {
                info!("created default configuration file: {}", path.display());
            }
            return Ok(config);
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ProxyConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON in config file {}", path.display()))?;
        Ok(config)
    }

    fn write_template(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("httpgate-config-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8888);
        assert_eq!(config.thread_pool_size, 10);
        assert_eq!(config.backlog, 100);
        assert_eq!(
            config.blocked_domains_file,
            PathBuf::from("config/blocked_domains.txt")
        );
        assert_eq!(config.log_file, PathBuf::from("logs/proxy.log"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = temp_path("partial.json");
        fs::write(&path, r#"{"port": 18080, "thread_pool_size": 4}"#).unwrap();

        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.port, 18080);
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.host, "127.0.0.1");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let path = temp_path("unknown.json");
        fs::write(&path, r#"{"port": 9999, "not_a_real_key": true}"#).unwrap();

        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.port, 9999);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let path = temp_path("broken.json");
        fs::write(&path, "{not json").unwrap();

        assert!(ProxyConfig::load(&path).is_err());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_creates_template() {
        let path = temp_path("fresh/proxy_config.json");
        let _ = fs::remove_file(&path);

        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.port, 8888);
        assert!(path.exists());

        let _ = fs::remove_file(&path);
    }
}
