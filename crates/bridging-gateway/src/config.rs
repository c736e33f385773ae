//! Gateway configuration: a JSON file naming the bridge endpoint, the link
//! token, and the outbound whitelist.
//!
//! Each whitelist rule holds four arrays; the rule is expanded into the
//! Cartesian product of concrete `(netloc, METHOD, scheme, path)` tuples at
//! load time so lookups are a single hash probe.

use bridging_core::{BridgingError, BridgingResult};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    bridge_netloc: String,
    bridge_token: String,
    #[serde(default)]
    whitelist: Vec<WhitelistRule>,
}

/// One rule from the config file; expanded on ingest.
#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistRule {
    pub netloc: Vec<String>,
    pub method: Vec<String>,
    pub scheme: Vec<String>,
    pub path: Vec<String>,
}

/// A concrete allow-list tuple. Methods are stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WhitelistEntry {
    pub netloc: String,
    pub method: String,
    pub scheme: String,
    pub path: String,
}

/// Immutable outbound firewall built at startup.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: HashSet<WhitelistEntry>,
}

impl Whitelist {
    fn from_rules(rules: &[WhitelistRule]) -> Self {
        let mut entries = HashSet::new();
        for rule in rules {
            for netloc in &rule.netloc {
                for method in &rule.method {
                    for scheme in &rule.scheme {
                        for path in &rule.path {
                            entries.insert(WhitelistEntry {
                                netloc: netloc.clone(),
                                method: method.to_uppercase(),
                                scheme: scheme.clone(),
                                path: path.clone(),
                            });
                        }
                    }
                }
            }
        }
        Self { entries }
    }

    /// Check an outbound call; the method is upper-cased for the lookup.
    pub fn allows(&self, netloc: &str, method: &str, scheme: &str, path: &str) -> bool {
        self.entries.contains(&WhitelistEntry {
            netloc: netloc.to_string(),
            method: method.to_uppercase(),
            scheme: scheme.to_string(),
            path: path.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bridge endpoint, e.g. `wss://bridge.example`.
    pub bridge_netloc: String,
    /// Token sent in the `bridging-token` header of the dial.
    pub bridge_token: String,
    pub whitelist: Whitelist,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> BridgingResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BridgingError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> BridgingResult<Self> {
        let file: ConfigFile = serde_json::from_str(data)
            .map_err(|e| BridgingError::Config(format!("config parse error: {e}")))?;
        if file.bridge_netloc.is_empty() {
            return Err(BridgingError::Config("bridge_netloc is empty".into()));
        }
        Ok(Self {
            bridge_netloc: file.bridge_netloc,
            bridge_token: file.bridge_token,
            whitelist: Whitelist::from_rules(&file.whitelist),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "bridge_netloc": "wss://bridge.example",
        "bridge_token": "t0k3n",
        "whitelist": [
            {
                "netloc": ["svc.internal:80", "svc2.internal:8080"],
                "method": ["get", "Post"],
                "scheme": ["http"],
                "path": ["/ping", "/echo"]
            },
            {
                "netloc": ["echo.internal:9000"],
                "method": ["GET"],
                "scheme": ["ws"],
                "path": ["/echo"]
            }
        ]
    }"#;

    #[test]
    fn expands_cartesian_product() {
        let cfg = GatewayConfig::parse(SAMPLE).unwrap();
        // 2 netlocs × 2 methods × 1 scheme × 2 paths + 1×1×1×1
        assert_eq!(cfg.whitelist.len(), 9);
        assert_eq!(cfg.bridge_netloc, "wss://bridge.example");
        assert_eq!(cfg.bridge_token, "t0k3n");
    }

    #[test]
    fn methods_are_uppercased_on_ingest_and_lookup() {
        let cfg = GatewayConfig::parse(SAMPLE).unwrap();
        assert!(cfg.whitelist.allows("svc.internal:80", "GET", "http", "/ping"));
        assert!(cfg.whitelist.allows("svc.internal:80", "get", "http", "/ping"));
        assert!(cfg.whitelist.allows("svc2.internal:8080", "post", "http", "/echo"));
    }

    #[test]
    fn misses_are_denied() {
        let cfg = GatewayConfig::parse(SAMPLE).unwrap();
        assert!(!cfg.whitelist.allows("evil.internal:80", "GET", "http", "/ping"));
        assert!(!cfg.whitelist.allows("svc.internal:80", "DELETE", "http", "/ping"));
        assert!(!cfg.whitelist.allows("svc.internal:80", "GET", "https", "/ping"));
        assert!(!cfg.whitelist.allows("svc.internal:80", "GET", "http", "/pong"));
    }

    #[test]
    fn websocket_entries_match_ws_scheme() {
        let cfg = GatewayConfig::parse(SAMPLE).unwrap();
        assert!(cfg.whitelist.allows("echo.internal:9000", "GET", "ws", "/echo"));
        assert!(!cfg.whitelist.allows("echo.internal:9000", "GET", "wss", "/echo"));
    }

    #[test]
    fn missing_whitelist_means_deny_all() {
        let cfg = GatewayConfig::parse(
            r#"{"bridge_netloc": "ws://b", "bridge_token": "t"}"#,
        )
        .unwrap();
        assert!(cfg.whitelist.is_empty());
        assert!(!cfg.whitelist.allows("svc.internal:80", "GET", "http", "/ping"));
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(GatewayConfig::parse("{not json").is_err());
        assert!(GatewayConfig::parse(r#"{"bridge_token": "t"}"#).is_err());
        assert!(GatewayConfig::parse(r#"{"bridge_netloc": "", "bridge_token": "t"}"#).is_err());
    }
}
