use anyhow::Context;
use std::{
    fs,
    path::{Path, PathBuf},
};
use storepulse_core::collection::{ProxyConfig, parse_proxy_list};
use tracing::warn;

use crate::util::{non_empty_var, path_var};

pub const PROXY_LIST_PATH_VAR: &str = "PROXY_LIST_PATH";
pub const PROXY_LIST_VAR: &str = "PROXY_LIST";

/// Where the proxy credentials came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxySource {
    /// Nothing configured; requests go direct.
    #[default]
    None,
    File(PathBuf),
    Env,
}

/// Proxies from `$PROXY_LIST_PATH` when set, otherwise from `$PROXY_LIST`.
/// Entries are `host:port:username:password`, newline or comma separated.
pub fn load_proxies_from_env() -> anyhow::Result<(Vec<ProxyConfig>, ProxySource)> {
    if let Some(path) = path_var(PROXY_LIST_PATH_VAR) {
        let proxies = load_proxies_from_file(&path)?;
        return Ok((proxies, ProxySource::File(path)));
    }

    if let Some(raw) = non_empty_var(PROXY_LIST_VAR) {
        let proxies = parse_proxy_list(&raw);
        if proxies.is_empty() {
            warn!("PROXY_LIST is set but contains no usable entries");
        }
        return Ok((proxies, ProxySource::Env));
    }

    Ok((Vec::new(), ProxySource::None))
}

pub fn load_proxies_from_file(path: &Path) -> anyhow::Result<Vec<ProxyConfig>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read proxy list from {}", path.display()))?;
    let proxies = parse_proxy_list(&raw);
    if proxies.is_empty() {
        warn!(path = %path.display(), "proxy list file contains no usable entries");
    }
    Ok(proxies)
}
