//! Upstream proxy rotation with failure-driven health tracking.
//!
//! Selection walks the proxies in load order from a shared cursor and skips
//! unhealthy entries, so with `N` healthy proxies every window of `N`
//! consecutive selections touches each of them exactly once. A proxy turns
//! unhealthy after `failure_threshold` consecutive failures and comes back
//! either when its cool-down expires (checked lazily on selection) or when
//! the health probe calls [`ProxyPool::mark_recovered`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::ProxyPoolConfig;
use crate::error::{CollectorError, Result};

/// Credentials for one upstream proxy.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// `host:port`, safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Identity used to match outcome reports to pool entries.
    fn key(&self) -> (&str, u16, &str) {
        (&self.host, self.port, &self.username)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse `host:port:username:password` entries separated by newlines or
/// commas. Blank entries and `#` comments are ignored; malformed entries are
/// skipped with a warning that never echoes the password.
pub fn parse_proxy_list(raw: &str) -> Vec<ProxyConfig> {
    let mut seen = HashSet::new();
    let mut proxies = Vec::new();

    for (index, entry) in raw.split(['\n', ',']).enumerate() {
        let entry = entry.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = entry.splitn(4, ':').collect();
        let [host, port, username, password] = parts.as_slice() else {
            warn!(entry = index + 1, "skipping proxy entry without four fields");
            continue;
        };
        let host = host.trim();
        if host.is_empty() {
            warn!(entry = index + 1, "skipping proxy entry with empty host");
            continue;
        }
        let Ok(port) = port.trim().parse::<u16>() else {
            warn!(entry = index + 1, host, "skipping proxy entry with invalid port");
            continue;
        };

        let proxy = ProxyConfig::new(host, port, username.trim(), password.trim());
        if !seen.insert((proxy.host.clone(), proxy.port, proxy.username.clone())) {
            warn!(entry = index + 1, proxy = %proxy, "skipping duplicate proxy entry");
            continue;
        }
        proxies.push(proxy);
    }

    proxies
}

/// Result of a proxy selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxySelection {
    Proxy(ProxyConfig),
    /// No proxies are configured; requests go out directly.
    Direct,
}

impl ProxySelection {
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        match self {
            ProxySelection::Proxy(proxy) => Some(proxy),
            ProxySelection::Direct => None,
        }
    }
}

#[derive(Debug)]
struct ProxyEntry {
    config: ProxyConfig,
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    last_used: Option<DateTime<Utc>>,
    healthy: bool,
    unhealthy_since: Option<DateTime<Utc>>,
}

impl ProxyEntry {
    fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_used: None,
            healthy: true,
            unhealthy_since: None,
        }
    }

    fn restore(&mut self) {
        self.healthy = true;
        self.unhealthy_since = None;
        self.consecutive_failures = 0;
    }
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<ProxyEntry>,
    cursor: usize,
}

/// Shared rotation over the configured proxies.
#[derive(Debug)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    state: Mutex<PoolState>,
}

/// Per-proxy counters. Carries the endpoint only, never credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyStats {
    pub endpoint: String,
    pub healthy: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub unhealthy_since: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyPoolStats {
    /// False when the pool has no proxies and requests go direct.
    pub enabled: bool,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Healthy share of the pool, `0.0..=1.0`.
    pub health_rate: f64,
    pub per_proxy: Vec<ProxyStats>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyConfig>, config: ProxyPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                entries: proxies.into_iter().map(ProxyEntry::new).collect(),
                cursor: 0,
            }),
        }
    }

    /// A pool without proxies; every selection is [`ProxySelection::Direct`].
    pub fn direct() -> Self {
        Self::new(Vec::new(), ProxyPoolConfig::default())
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        !self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next healthy proxy in rotation.
    pub fn select(&self) -> Result<ProxySelection> {
        self.select_at(Utc::now())
    }

    fn select_at(&self, now: DateTime<Utc>) -> Result<ProxySelection> {
        let cooldown = self.config.cooldown();
        let mut state = self.lock();
        let total = state.entries.len();
        if total == 0 {
            return Ok(ProxySelection::Direct);
        }

        let start = state.cursor % total;
        for offset in 0..total {
            let index = (start + offset) % total;
            let entry = &mut state.entries[index];

            if !entry.healthy
                && entry.unhealthy_since.is_some_and(|since| since + cooldown <= now)
            {
                entry.restore();
                info!(proxy = %entry.config, "proxy cool-down expired, back in rotation");
            }

            if entry.healthy {
                entry.last_used = Some(now);
                let selected = entry.config.clone();
                state.cursor = index + 1;
                return Ok(ProxySelection::Proxy(selected));
            }
        }

        Err(CollectorError::NoHealthyProxy)
    }

    /// Record the outcome of a request sent through `proxy`. Unknown proxies
    /// are ignored.
    pub fn report_outcome(&self, proxy: &ProxyConfig, success: bool) {
        let threshold = self.config.failure_threshold.max(1);
        let mut state = self.lock();
        let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.config.key() == proxy.key())
        else {
            return;
        };

        if success {
            entry.success_count += 1;
            entry.consecutive_failures = 0;
            return;
        }

        entry.failure_count += 1;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.healthy && entry.consecutive_failures >= threshold {
            entry.healthy = false;
            entry.unhealthy_since = Some(Utc::now());
            warn!(
                proxy = %entry.config,
                failures = entry.consecutive_failures,
                "proxy marked unhealthy"
            );
        }
    }

    /// Put `proxy` back in rotation after a successful health probe.
    pub fn mark_recovered(&self, proxy: &ProxyConfig) {
        let mut state = self.lock();
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.config.key() == proxy.key())
            && !entry.healthy
        {
            entry.restore();
            info!(proxy = %entry.config, "proxy recovered");
        }
    }

    /// Proxies currently out of rotation.
    pub fn unhealthy_proxies(&self) -> Vec<ProxyConfig> {
        self.lock()
            .entries
            .iter()
            .filter(|entry| !entry.healthy)
            .map(|entry| entry.config.clone())
            .collect()
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let state = self.lock();
        let total = state.entries.len();
        let healthy = state.entries.iter().filter(|entry| entry.healthy).count();

        ProxyPoolStats {
            enabled: total > 0,
            total,
            healthy,
            unhealthy: total - healthy,
            health_rate: if total == 0 {
                1.0
            } else {
                healthy as f64 / total as f64
            },
            per_proxy: state
                .entries
                .iter()
                .map(|entry| ProxyStats {
                    endpoint: entry.config.endpoint(),
                    healthy: entry.healthy,
                    success_count: entry.success_count,
                    failure_count: entry.failure_count,
                    consecutive_failures: entry.consecutive_failures,
                    last_used: entry.last_used,
                    unhealthy_since: entry.unhealthy_since,
                })
                .collect(),
        }
    }
}
