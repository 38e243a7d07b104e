//! Host-key pin cache consulted by the host-auth server.
//!
//! One entry per line: `<pattern> <b64 wire key> <pinned|once> <expires>`,
//! where `expires` is a unix timestamp or `0` for never.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::errors::PersistError;
use crate::persist::Persister;
use crate::protocol::HostKeyPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// A live entry for this host carries the offered key.
    Match,
    /// The host has live entries, none of them for the offered key.
    Mismatch,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    pub pattern: String,
    pub key: Vec<u8>,
    pub policy: HostKeyPolicy,
    pub expires: Option<i64>,
}

impl KnownHost {
    fn is_live(&self, now: i64) -> bool {
        self.expires.map_or(true, |e| e > now)
    }

    fn to_line(&self) -> String {
        let policy = match self.policy {
            HostKeyPolicy::Pinned => "pinned",
            HostKeyPolicy::TrustedOnce => "once",
        };
        format!(
            "{} {} {} {}",
            self.pattern,
            STANDARD.encode(&self.key),
            policy,
            self.expires.unwrap_or(0)
        )
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let pattern = fields.next()?.to_string();
        let key = STANDARD.decode(fields.next()?).ok()?;
        let policy = match fields.next()? {
            "pinned" => HostKeyPolicy::Pinned,
            "once" => HostKeyPolicy::TrustedOnce,
            _ => return None,
        };
        let expires: i64 = fields.next()?.parse().ok()?;
        Some(Self {
            pattern,
            key,
            policy,
            expires: (expires != 0).then_some(expires),
        })
    }
}

/// `host` for port 22, `[host]:port` otherwise.
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownHosts {
    entries: Vec<KnownHost>,
}

impl KnownHosts {
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| {
                let parsed = KnownHost::parse_line(l);
                if parsed.is_none() {
                    debug!(line = l, "skipping malformed known_hosts line");
                }
                parsed
            })
            .collect();
        Self { entries }
    }

    pub fn load(persister: &dyn Persister) -> Result<Self, PersistError> {
        Ok(persister
            .load_known_hosts()?
            .map(|s| Self::parse(&s))
            .unwrap_or_default())
    }

    pub fn save(&self, persister: &dyn Persister) -> Result<(), PersistError> {
        persister.save_known_hosts(&self.to_string())
    }

    pub fn entries(&self) -> &[KnownHost] {
        &self.entries
    }

    pub fn lookup(&self, host: &str, port: u16, key: &[u8], now: i64) -> HostKeyStatus {
        let pattern = host_pattern(host, port);
        let mut live = self
            .entries
            .iter()
            .filter(|e| e.pattern == pattern && e.is_live(now))
            .peekable();
        if live.peek().is_none() {
            return HostKeyStatus::Unknown;
        }
        if live.any(|e| e.key == key) {
            HostKeyStatus::Match
        } else {
            HostKeyStatus::Mismatch
        }
    }

    /// Record an approved key. Trusted-once entries expire after `ttl`.
    pub fn insert(
        &mut self,
        host: &str,
        port: u16,
        key: &[u8],
        policy: HostKeyPolicy,
        ttl: Duration,
        now: i64,
    ) {
        let pattern = host_pattern(host, port);
        self.entries.retain(|e| !(e.pattern == pattern && e.key == key));
        let expires = match policy {
            HostKeyPolicy::Pinned => None,
            HostKeyPolicy::TrustedOnce => Some(now + ttl.as_secs() as i64),
        };
        self.entries.push(KnownHost {
            pattern,
            key: key.to_vec(),
            policy,
            expires,
        });
    }

    /// Drop expired entries; returns how many were removed.
    pub fn prune(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.is_live(now));
        before - self.entries.len()
    }
}

impl std::fmt::Display for KnownHosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for e in &self.entries {
            writeln!(f, "{}", e.to_line())?;
        }
        Ok(())
    }
}
