use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use storepulse_core::collection::{CollectorConfig, ProxyConfig};
use tracing::{debug, info};

use crate::collector::{CollectorConfigSource, load_collector_config, validate};
use crate::proxies::{ProxySource, load_proxies_from_env};
use crate::util::non_empty_var;

pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Fully resolved collector configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub collector: CollectorConfig,
    pub database_url: Option<String>,
    pub proxies: Vec<ProxyConfig>,
    pub metadata: ConfigMetadata,
}

impl AppConfig {
    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            anyhow!("{DATABASE_URL_VAR} must be set unless running in memory")
        })
    }
}

/// Where each part of the configuration was resolved from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub env_file_loaded: Option<PathBuf>,
    pub collector_source: CollectorConfigSource,
    pub proxy_source: ProxySource,
}

/// Resolves configuration from an optional `.env`, the process environment
/// and an optional collector config file.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    base_dir: PathBuf,
    load_dotenv: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            config_path: None,
            base_dir: PathBuf::from("."),
            load_dotenv: true,
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Directory searched for default config files.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_dotenv(mut self, enabled: bool) -> Self {
        self.load_dotenv = enabled;
        self
    }

    pub fn load(&self) -> anyhow::Result<AppConfig> {
        let env_file_loaded = if self.load_dotenv {
            load_env_file(&self.base_dir)
        } else {
            None
        };

        let (collector, collector_source) =
            load_collector_config(self.config_path.as_deref(), &self.base_dir)?;
        validate(&collector).context("collector configuration is invalid")?;

        let (proxies, proxy_source) = load_proxies_from_env()?;
        let database_url = non_empty_var(DATABASE_URL_VAR);

        info!(
            source = ?collector_source,
            proxies = proxies.len(),
            database = database_url.is_some(),
            "configuration loaded"
        );

        Ok(AppConfig {
            collector,
            database_url,
            proxies,
            metadata: ConfigMetadata {
                env_file_loaded,
                collector_source,
                proxy_source,
            },
        })
    }
}

fn load_env_file(base_dir: &Path) -> Option<PathBuf> {
    let candidate = base_dir.join(".env");
    if !candidate.exists() {
        return None;
    }
    match dotenvy::from_path(&candidate) {
        Ok(()) => Some(candidate),
        Err(err) => {
            debug!(path = %candidate.display(), error = %err, "skipping unreadable .env");
            None
        }
    }
}
