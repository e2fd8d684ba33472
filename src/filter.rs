//! Host filter rules.
//!
//! Rules load from a plain-text file, one per line: a bare hostname, a
//! `*.suffix` wildcard, or an IPv4/IPv6 literal. `#` starts a comment to
//! end of line and blank lines are skipped. Evaluation is a first-match
//! scan over the rules in file order; any match denies.
//!
//! The file's modification time is checked before each decision. When it
//! moved, a fresh rule set is built off to the side and swapped in under
//! the write lock, so in-flight decisions always observe one consistent
//! generation. A missing or unreadable file degrades the engine to the
//! empty, fully permissive rule set with a single ERROR record on first
//! observation.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::logger::EventLogger;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    /// Literal hostname, stored lowercased.
    Exact(String),
    /// `*.suffix` wildcard; matches the bare suffix too.
    Suffix(String),
    /// IPv4 or IPv6 literal, compared as a parsed address.
    Ip(IpAddr),
}

/// One immutable generation of parsed rules.
#[derive(Debug, Default)]
struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(ip) = line.parse::<IpAddr>() {
                rules.push(Rule::Ip(ip));
            } else if let Some(suffix) = line.strip_prefix("*.") {
                rules.push(Rule::Suffix(suffix.to_ascii_lowercase()));
            } else {
                rules.push(Rule::Exact(line.to_ascii_lowercase()));
            }
        }
        RuleSet { rules }
    }

    /// First-match scan. `host` must already be lowercased.
    fn matches(&self, host: &str) -> bool {
        let addr: Option<IpAddr> = host.parse().ok();
        self.rules.iter().any(|rule| match rule {
            // IP rules only apply to address hosts, hostname rules only
            // to names; a hostname never matches an IP rule.
            Rule::Ip(ip) => addr == Some(*ip),
            Rule::Exact(name) => addr.is_none() && name == host,
            Rule::Suffix(suffix) => {
                addr.is_none()
                    && (host == suffix
                        || (host.len() > suffix.len()
                            && host.ends_with(suffix.as_str())
                            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'))
            }
        })
    }
}

struct FilterState {
    rules: RuleSet,
    mtime: Option<SystemTime>,
    /// Missing-file error already reported.
    degraded: bool,
}

pub struct FilterEngine {
    path: PathBuf,
    state: RwLock<FilterState>,
    logger: EventLogger,
}

impl FilterEngine {
    /// Load rules from `path`. A missing or unreadable file leaves the
    /// engine permissive rather than refusing to start.
    pub fn load(path: impl Into<PathBuf>, logger: EventLogger) -> Self {
        let path = path.into();
        let state = match read_rules(&path) {
            Ok((rules, mtime)) => {
                info!(
                    "loaded {} filter rules from {}",
                    rules.rules.len(),
                    path.display()
                );
                FilterState {
                    rules,
                    mtime: Some(mtime),
                    degraded: false,
                }
            }
            Err(e) => {
                logger.error(&format!(
                    "filter rules unavailable, proxy is permissive ({}: {})",
                    path.display(),
                    e
                ));
                warn!("filter rules unavailable ({}): {}", path.display(), e);
                FilterState {
                    rules: RuleSet::default(),
                    mtime: None,
                    degraded: true,
                }
            }
        };
        Self {
            path,
            state: RwLock::new(state),
            logger,
        }
    }

    /// Decide whether `(host, port)` is denied by the current rules.
    pub fn is_blocked(&self, host: &str, port: u16) -> bool {
        self.reload_if_changed();
        let host = host.trim().to_ascii_lowercase();
        let blocked = self.state.read().unwrap().rules.matches(&host);
        if blocked {
            debug!("filter denied {}:{}", host, port);
        }
        blocked
    }

    pub fn rule_count(&self) -> usize {
        self.state.read().unwrap().rules.rules.len()
    }

    /// Swap in a fresh rule set when the file's mtime moved.
    fn reload_if_changed(&self) {
        let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                let mut state = self.state.write().unwrap();
                if !state.degraded {
                    state.rules = RuleSet::default();
                    state.mtime = None;
                    state.degraded = true;
                    self.logger.error(&format!(
                        "filter rules unavailable, proxy is permissive ({}: {})",
                        self.path.display(),
                        e
                    ));
                    warn!("filter rules unavailable ({}): {}", self.path.display(), e);
                }
                return;
            }
        };

        if self.state.read().unwrap().mtime == Some(mtime) {
            return;
        }

        match read_rules(&self.path) {
            Ok((rules, mtime)) => {
                info!(
                    "reloaded {} filter rules from {}",
                    rules.rules.len(),
                    self.path.display()
                );
                let mut state = self.state.write().unwrap();
                *state = FilterState {
                    rules,
                    mtime: Some(mtime),
                    degraded: false,
                };
            }
            Err(e) => {
                warn!("failed to reload filter rules: {}", e);
            }
        }
    }
}

fn read_rules(path: &Path) -> io::Result<(RuleSet, SystemTime)> {
    let mtime = fs::metadata(path)?.modified()?;
    let text = fs::read_to_string(path)?;
    Ok((RuleSet::parse(&text), mtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_rules(name: &str, content: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("httpgate-filter-{}-{}", std::process::id(), name));
        fs::write(&path, content).unwrap();
        path
    }

    fn engine(path: &Path) -> FilterEngine {
        FilterEngine::load(path, EventLogger::disabled())
    }

    #[test]
    fn test_comments_and_blank_lines_are_skipped() {
        let set = RuleSet::parse("# header\n\nexample.com # trailing note\n   \n# more\n");
        assert_eq!(set.rules.len(), 1);
        assert!(set.matches("example.com"));
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        let path = temp_rules("exact", "Example.COM\n");
        let filter = engine(&path);

        assert!(filter.is_blocked("example.com", 80));
        assert!(filter.is_blocked("EXAMPLE.com", 443));
        assert!(!filter.is_blocked("example.org", 80));
        assert!(!filter.is_blocked("sub.example.com", 80));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_suffix_wildcard_alignment() {
        let path = temp_rules("suffix", "*.example.net\n");
        let filter = engine(&path);

        assert!(filter.is_blocked("a.b.example.net", 80));
        assert!(filter.is_blocked("sub.example.net", 80));
        // By convention the bare host matches its own wildcard.
        assert!(filter.is_blocked("example.net", 80));
        // Label alignment: no partial-label matches.
        assert!(!filter.is_blocked("other-example.net", 80));
        assert!(!filter.is_blocked("example.net.evil.com", 80));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_ip_rules_only_match_addresses() {
        let path = temp_rules("ips", "10.1.2.3\n::1\n");
        let filter = engine(&path);

        assert!(filter.is_blocked("10.1.2.3", 80));
        assert!(filter.is_blocked("::1", 443));
        // Equivalent spellings of the same address still match.
        assert!(filter.is_blocked("0:0:0:0:0:0:0:1", 443));
        // A hostname never matches an IP rule.
        assert!(!filter.is_blocked("10.1.2.3.example.com", 80));
        assert!(!filter.is_blocked("host-10-1-2-3", 80));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_hostname_rule_never_matches_address() {
        let set = RuleSet::parse("*.1\nlocalhost\n");
        // "127.0.0.1" parses as an address, so only IP rules may match it.
        assert!(!set.matches("127.0.0.1"));
        assert!(set.matches("localhost"));
    }

    #[test]
    fn test_first_match_order_is_file_order() {
        let set = RuleSet::parse("first.example\nsecond.example\n");
        assert_eq!(set.rules.len(), 2);
        assert!(set.matches("second.example"));
    }

    #[test]
    fn test_missing_file_is_permissive() {
        let path = std::env::temp_dir().join(format!(
            "httpgate-filter-{}-does-not-exist",
            std::process::id()
        ));
        let filter = engine(&path);

        assert_eq!(filter.rule_count(), 0);
        assert!(!filter.is_blocked("anything.example", 80));
    }

    #[test]
    fn test_reload_after_file_change() {
        let path = temp_rules("reload", "old.example\n");
        let filter = engine(&path);
        assert!(filter.is_blocked("old.example", 80));
        assert!(!filter.is_blocked("new.example", 80));

        // Coarse mtime filesystems need a visible tick between writes.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        fs::write(&path, "new.example\n").unwrap();

        assert!(filter.is_blocked("new.example", 80));
        assert!(!filter.is_blocked("old.example", 80));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_degrades_when_file_disappears() {
        let path = temp_rules("vanish", "gone.example\n");
        let filter = engine(&path);
        assert!(filter.is_blocked("gone.example", 80));

        fs::remove_file(&path).unwrap();

        assert!(!filter.is_blocked("gone.example", 80));
        assert_eq!(filter.rule_count(), 0);
    }
}
