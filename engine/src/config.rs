//! The configuration snapshot the engine consumes once at start.
//!
//! A plain JSON key/value document; live edits never affect a running
//! engine, a change requires a restart.

use crate::error::EngineError;
use crate::rules::Disposition;
use crate::upstream::Resolver;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub auto_start: bool,
    pub ipv6_enabled: bool,
    pub block_logging: bool,
    pub show_notification: bool,
    pub upstream_list: Vec<UpstreamConfig>,
    pub host_sources: Vec<HostSource>,
    /// Explicit per-host overrides, merged after the sources.
    pub user_rules: Vec<UserRule>,
    pub app_inclusion: AppInclusion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub name: String,
    /// Address literal; a bare IP defaults to port 53.
    pub addr: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSource {
    pub name: String,
    /// Filesystem path of the (pre-downloaded) hosts file.
    pub location: String,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRule {
    pub host: String,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppDefaultMode {
    All,
    None,
    #[default]
    Auto,
}

/// Per-application tunnel selection. Opaque to the engine: it is handed to
/// the tunnel builder, which applies it where the platform supports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppInclusion {
    pub included: Vec<String>,
    pub excluded: Vec<String>,
    pub default_mode: AppDefaultMode,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let data = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot start with. The tunnel fd is
    /// never created for an invalid configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        for upstream in &self.upstream_list {
            parse_resolver_addr(&upstream.addr).ok_or_else(|| {
                EngineError::Config(format!(
                    "upstream '{}': bad address literal '{}'",
                    upstream.name, upstream.addr
                ))
            })?;
        }
        for source in &self.host_sources {
            if source.location.is_empty() {
                return Err(EngineError::Config(format!(
                    "host source '{}' has no location",
                    source.name
                )));
            }
        }
        Ok(())
    }

    /// The enabled upstream resolvers, in configured order. Empty when the
    /// engine should inherit the underlying link's resolvers.
    pub fn enabled_resolvers(&self) -> Vec<Resolver> {
        self.upstream_list
            .iter()
            .filter(|u| u.enabled)
            .filter_map(|u| {
                parse_resolver_addr(&u.addr).map(|addr| Resolver {
                    name: u.name.clone(),
                    addr,
                })
            })
            .collect()
    }
}

/// Boot-time gate: autostart only when configured on and the engine was
/// active when the host last shut down.
pub fn should_autostart(config: &Config, persisted_active: bool) -> bool {
    config.auto_start && persisted_active
}

fn parse_resolver_addr(literal: &str) -> Option<SocketAddr> {
    if let Ok(addr) = literal.parse::<SocketAddr>() {
        return Some(addr);
    }
    literal
        .parse::<std::net::IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, crate::dns::DNS_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let doc = r#"{
            "autoStart": true,
            "ipv6Enabled": false,
            "blockLogging": true,
            "showNotification": false,
            "upstreamList": [
                {"name": "quad9", "addr": "9.9.9.9"},
                {"name": "alt", "addr": "149.112.112.112:53", "enabled": false}
            ],
            "hostSources": [
                {"name": "stevenblack", "location": "/var/lib/burrow/hosts/stevenblack", "disposition": "DENY"}
            ],
            "userRules": [
                {"host": "telemetry.example.com", "disposition": "DENY"}
            ],
            "appInclusion": {"included": [], "excluded": ["com.example.app"], "defaultMode": "AUTO"}
        }"#;
        let config: Config = serde_json::from_str(doc).unwrap();
        config.validate().unwrap();
        assert!(config.auto_start);
        assert!(config.block_logging);
        assert_eq!(config.upstream_list.len(), 2);
        assert!(config.upstream_list[0].enabled, "enabled defaults to true");
        assert_eq!(config.host_sources[0].disposition, Disposition::Deny);
        assert_eq!(config.user_rules[0].host, "telemetry.example.com");
        assert_eq!(config.app_inclusion.default_mode, AppDefaultMode::Auto);

        let resolvers = config.enabled_resolvers();
        assert_eq!(resolvers.len(), 1);
        assert_eq!(resolvers[0].addr, "9.9.9.9:53".parse().unwrap());
    }

    #[test]
    fn test_defaults_for_missing_keys() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(!config.auto_start);
        assert!(!config.ipv6_enabled);
        assert!(config.upstream_list.is_empty());
        assert_eq!(config.app_inclusion.default_mode, AppDefaultMode::Auto);
    }

    #[test]
    fn test_bad_upstream_addr_rejected() {
        let doc = r#"{"upstreamList": [{"name": "bad", "addr": "not-an-ip"}]}"#;
        let config: Config = serde_json::from_str(doc).unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_should_autostart() {
        let mut config = Config::default();
        assert!(!should_autostart(&config, true));
        config.auto_start = true;
        assert!(!should_autostart(&config, false));
        assert!(should_autostart(&config, true));
    }
}
