//! Configuration loading for the storepulse collector.
//!
//! Layers `.env`, process environment and an optional TOML/JSON collector
//! file into a single [`AppConfig`].

#![allow(missing_docs)]

pub mod collector;
pub mod loader;
pub mod proxies;
pub mod util;

pub use collector::{CollectorConfigSource, load_collector_config};
pub use loader::{AppConfig, ConfigLoader, ConfigMetadata};
pub use proxies::{ProxySource, load_proxies_from_env, load_proxies_from_file};
