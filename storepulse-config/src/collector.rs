use anyhow::{Context, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
};
use storepulse_core::collection::CollectorConfig;
use url::Url;

use crate::util::{non_empty_var, path_var};

pub const CONFIG_PATH_VAR: &str = "COLLECTOR_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "COLLECTOR_CONFIG_JSON";

/// Source that produced the collector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CollectorConfigSource {
    #[default]
    Default,
    /// Path passed explicitly, e.g. on the command line.
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Load collector tuning. Evaluation order:
/// 1) `explicit` when given,
/// 2) `$COLLECTOR_CONFIG_PATH` (TOML or JSON file),
/// 3) `$COLLECTOR_CONFIG_JSON` (inline JSON),
/// 4) the first default file found under `base_dir`,
/// 5) built-in defaults.
pub fn load_collector_config(
    explicit: Option<&Path>,
    base_dir: &Path,
) -> anyhow::Result<(CollectorConfig, CollectorConfigSource)> {
    if let Some(path) = explicit {
        let config = load_from_file(path)?;
        return Ok((config, CollectorConfigSource::Explicit(path.to_path_buf())));
    }

    if let Some(path) = path_var(CONFIG_PATH_VAR) {
        let config = load_from_file(&path)?;
        return Ok((config, CollectorConfigSource::EnvPath(path)));
    }

    if let Some(raw) = non_empty_var(CONFIG_JSON_VAR) {
        let parsed = parse_json(&raw).context("failed to parse COLLECTOR_CONFIG_JSON")?;
        return Ok((parsed, CollectorConfigSource::EnvInline));
    }

    if let Some(path) = find_default_file(base_dir) {
        let config = load_from_file(&path)?;
        return Ok((config, CollectorConfigSource::File(path)));
    }

    Ok((CollectorConfig::default(), CollectorConfigSource::Default))
}

pub fn load_from_file(path: &Path) -> anyhow::Result<CollectorConfig> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!("failed to read collector config from {}", path.display())
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents)
            .with_context(|| format!("invalid collector config {}", path.display())),
        Some("toml") => toml::from_str(&contents).map_err(|err| {
            anyhow!("invalid collector config {}: {}", path.display(), err)
        }),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Try TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<CollectorConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse collector config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<CollectorConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid collector config json: {err}"))
}

fn find_default_file(base_dir: &Path) -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "collector.toml",
        "collector.json",
        "config/collector.toml",
        "config/collector.json",
    ];

    CANDIDATES
        .iter()
        .map(|candidate| base_dir.join(candidate))
        .find(|path| path.exists())
}

/// Reject settings the pipeline cannot run with.
pub fn validate(config: &CollectorConfig) -> anyhow::Result<()> {
    if config.workers.discovery_workers == 0 && config.workers.update_workers == 0 {
        bail!("at least one discovery or update worker is required");
    }
    if config.queue.lease.lease_ttl_secs <= 0 {
        bail!("queue.lease.lease_ttl_secs must be positive");
    }
    let retry = &config.queue.retry;
    if retry.backoff_max_ms < retry.backoff_base_ms {
        bail!(
            "queue.retry.backoff_max_ms ({}) is below backoff_base_ms ({})",
            retry.backoff_max_ms,
            retry.backoff_base_ms
        );
    }
    if !(0.0..=1.0).contains(&retry.jitter_ratio) {
        bail!("queue.retry.jitter_ratio must be within 0.0..=1.0");
    }
    if config.scheduler.max_jobs_per_run == 0 {
        bail!("scheduler.max_jobs_per_run must be positive");
    }
    Url::parse(&config.scraper.base_url)
        .with_context(|| format!("invalid scraper.base_url {}", config.scraper.base_url))?;
    if config.proxy.probe_interval().is_some() {
        Url::parse(&config.proxy.probe_url)
            .with_context(|| format!("invalid proxy.probe_url {}", config.proxy.probe_url))?;
    }
    Ok(())
}
