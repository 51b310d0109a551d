//! Hostname rule table: the immutable disposition map consulted per query.
//!
//! Built once at engine start from hosts-file sources and user overrides;
//! a configuration change requires an engine restart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the filter decides for a hostname.
///
/// `Ignore` entries contribute nothing; `Deny` dominates `Allow`, `Allow`
/// dominates `Ignore`, and within equal priority the last write wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Disposition {
    Ignore,
    Allow,
    Deny,
}

impl Disposition {
    fn priority(self) -> u8 {
        match self {
            Disposition::Ignore => 0,
            Disposition::Allow => 1,
            Disposition::Deny => 2,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Ignore => write!(f, "IGNORE"),
            Disposition::Allow => write!(f, "ALLOW"),
            Disposition::Deny => write!(f, "DENY"),
        }
    }
}

/// Immutable hostname -> disposition map.
///
/// Lookups are exact: the queried name is lowercased and a single trailing
/// dot is stripped, but there is no suffix or wildcard matching. Names
/// absent from the table map to `Ignore`.
pub struct RuleTable {
    entries: HashMap<String, Disposition>,
}

impl RuleTable {
    pub fn builder() -> RuleTableBuilder {
        RuleTableBuilder {
            entries: HashMap::new(),
        }
    }

    pub fn lookup(&self, name: &str) -> Disposition {
        match normalize(name) {
            Some(key) => self
                .entries
                .get(key.as_ref())
                .copied()
                .unwrap_or(Disposition::Ignore),
            None => Disposition::Ignore,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct RuleTableBuilder {
    entries: HashMap<String, Disposition>,
}

impl RuleTableBuilder {
    /// Merge one hosts-file source. Sources whose disposition is `Ignore`
    /// contribute no entries at all.
    pub fn add_source<'a>(
        &mut self,
        disposition: Disposition,
        lines: impl IntoIterator<Item = &'a str>,
    ) -> usize {
        if disposition == Disposition::Ignore {
            return 0;
        }
        let mut added = 0;
        for line in lines {
            if let Some(host) = parse_host_line(line) {
                self.insert(host, disposition);
                added += 1;
            }
        }
        added
    }

    /// A single user override, applied with the same precedence rules.
    pub fn add_override(&mut self, host: &str, disposition: Disposition) {
        if disposition == Disposition::Ignore {
            return;
        }
        self.insert(host, disposition);
    }

    fn insert(&mut self, host: &str, disposition: Disposition) {
        let Some(key) = normalize(host) else { return };
        let key = key.into_owned();
        match self.entries.get(&key) {
            Some(existing) if existing.priority() > disposition.priority() => {}
            _ => {
                self.entries.insert(key, disposition);
            }
        }
    }

    pub fn build(self) -> RuleTable {
        RuleTable {
            entries: self.entries,
        }
    }
}

/// Lowercase and strip one trailing dot. Empty names normalize to nothing.
fn normalize(name: &str) -> Option<std::borrow::Cow<'_, str>> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return None;
    }
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        Some(std::borrow::Cow::Owned(name.to_ascii_lowercase()))
    } else {
        Some(std::borrow::Cow::Borrowed(name))
    }
}

/// Extract the hostname from one hosts-file line.
///
/// The hostname is the last whitespace-separated token; `#` starts a
/// comment; lines carrying only loopback/null addresses are skipped.
fn parse_host_line(line: &str) -> Option<&str> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let host = line.split_whitespace().last()?;
    match host {
        "localhost" | "localhost.localdomain" | "0.0.0.0" | "127.0.0.1" | "255.255.255.255"
        | "::1" | "local" | "broadcasthost" => None,
        _ => Some(host),
    }
}
