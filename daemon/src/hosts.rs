//! Host-side inputs for the engine: hosts-file sources and the resolvers
//! inherited from the underlying link.

use burrow_engine::{Config, Resolver, RuleTable};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Build the rule table from the configured sources and user overrides.
///
/// Source locations are filesystem paths; fetching remote lists is the
/// downloader's job, so a missing file only skips that source.
pub fn build_rule_table(config: &Config) -> RuleTable {
    let mut builder = RuleTable::builder();
    for source in &config.host_sources {
        match std::fs::read_to_string(Path::new(&source.location)) {
            Ok(content) => {
                let entries = builder.add_source(source.disposition, content.lines());
                tracing::info!(source = %source.name, entries, "host source loaded");
            }
            Err(e) => {
                tracing::warn!(source = %source.name, location = %source.location, error = %e, "host source skipped");
            }
        }
    }
    for rule in &config.user_rules {
        builder.add_override(&rule.host, rule.disposition);
    }
    builder.build()
}

/// The underlying link's resolvers, used when the configured upstream list
/// is empty or fully disabled.
pub fn system_resolvers() -> Vec<Resolver> {
    match std::fs::read_to_string(RESOLV_CONF) {
        Ok(content) => parse_resolv_conf(&content),
        Err(e) => {
            tracing::warn!(error = %e, "cannot read {RESOLV_CONF}");
            Vec::new()
        }
    }
}

fn parse_resolv_conf(content: &str) -> Vec<Resolver> {
    let mut resolvers = Vec::new();
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("nameserver") {
            continue;
        }
        let Some(literal) = tokens.next() else {
            continue;
        };
        if let Ok(ip) = literal.parse::<IpAddr>() {
            resolvers.push(Resolver {
                name: format!("system ({ip})"),
                addr: SocketAddr::new(ip, 53),
            });
        }
    }
    resolvers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolv_conf() {
        let content = "\
# generated by NetworkManager
search lan
nameserver 192.168.1.1
nameserver 2606:4700:4700::1111
options edns0
";
        let resolvers = parse_resolv_conf(content);
        assert_eq!(resolvers.len(), 2);
        assert_eq!(resolvers[0].addr, "192.168.1.1:53".parse().unwrap());
        assert_eq!(
            resolvers[1].addr,
            "[2606:4700:4700::1111]:53".parse().unwrap()
        );
    }

    #[test]
    fn test_parse_resolv_conf_ignores_garbage() {
        assert!(parse_resolv_conf("nameserver\nnameserver not-an-ip\n").is_empty());
    }
}
