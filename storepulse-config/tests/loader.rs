use once_cell::sync::Lazy;
use std::fs;
use storepulse_config::{CollectorConfigSource, ConfigLoader, ProxySource};
use tempfile::TempDir;
use tokio::sync::Mutex;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const VARS: &[&str] = &[
    "COLLECTOR_CONFIG_PATH",
    "COLLECTOR_CONFIG_JSON",
    "PROXY_LIST_PATH",
    "PROXY_LIST",
    "DATABASE_URL",
];

fn clear_env() {
    for var in VARS {
        unsafe {
            std::env::remove_var(var);
        }
    }
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::new()
        .with_base_dir(dir.path())
        .with_dotenv(false)
}

#[tokio::test]
async fn defaults_apply_without_any_source() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let dir = TempDir::new().unwrap();

    let config = loader(&dir).load().unwrap();

    assert_eq!(
        config.metadata.collector_source,
        CollectorConfigSource::Default
    );
    assert_eq!(config.metadata.proxy_source, ProxySource::None);
    assert!(config.proxies.is_empty());
    assert!(config.require_database_url().is_err());
}

#[tokio::test]
async fn default_file_is_discovered_in_base_dir() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("config")).unwrap();
    let path = dir.path().join("config/collector.toml");
    fs::write(&path, "[workers]\nupdate_workers = 6\n").unwrap();

    let config = loader(&dir).load().unwrap();

    assert_eq!(config.collector.workers.update_workers, 6);
    assert_eq!(
        config.metadata.collector_source,
        CollectorConfigSource::File(path)
    );
}

#[tokio::test]
async fn env_sources_take_precedence_over_default_files() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("collector.toml"), "[workers]\nupdate_workers = 6\n").unwrap();

    unsafe {
        std::env::set_var(
            "COLLECTOR_CONFIG_JSON",
            r#"{ "workers": { "update_workers": 2 } }"#,
        );
        std::env::set_var("DATABASE_URL", "postgres://localhost/storepulse");
    }
    let config = loader(&dir).load().unwrap();
    assert_eq!(config.collector.workers.update_workers, 2);
    assert_eq!(
        config.metadata.collector_source,
        CollectorConfigSource::EnvInline
    );
    assert_eq!(
        config.require_database_url().unwrap(),
        "postgres://localhost/storepulse"
    );

    let explicit = dir.path().join("tuned.json");
    fs::write(&explicit, r#"{ "workers": { "update_workers": 11 } }"#).unwrap();
    let config = loader(&dir).with_config_path(&explicit).load().unwrap();
    assert_eq!(config.collector.workers.update_workers, 11);
    assert_eq!(
        config.metadata.collector_source,
        CollectorConfigSource::Explicit(explicit)
    );

    clear_env();
}

#[tokio::test]
async fn proxy_file_wins_over_inline_list() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let dir = TempDir::new().unwrap();
    let list = dir.path().join("proxies.txt");
    fs::write(
        &list,
        "# residential pool\n10.0.0.1:3128:alice:secret\n10.0.0.2:3128:bob:hunter2\nbroken-entry\n",
    )
    .unwrap();

    unsafe {
        std::env::set_var("PROXY_LIST", "10.9.9.9:8080:carol:pw");
    }
    let config = loader(&dir).load().unwrap();
    assert_eq!(config.metadata.proxy_source, ProxySource::Env);
    assert_eq!(config.proxies.len(), 1);

    unsafe {
        std::env::set_var("PROXY_LIST_PATH", &list);
    }
    let config = loader(&dir).load().unwrap();
    assert_eq!(config.metadata.proxy_source, ProxySource::File(list));
    assert_eq!(config.proxies.len(), 2);
    assert_eq!(config.proxies[1].host, "10.0.0.2");

    clear_env();
}

#[tokio::test]
async fn invalid_collector_file_is_reported() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("collector.toml"),
        "[queue.retry]\nbackoff_base_ms = 5000\nbackoff_max_ms = 10\n",
    )
    .unwrap();

    let err = loader(&dir).load().unwrap_err();
    assert!(format!("{err:#}").contains("backoff_max_ms"));
}
