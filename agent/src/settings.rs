//! Collector settings: a JSON config file, or environment variables.
//!
//! The environment layout matches existing deployments that configure the
//! collector with a `.env` file (`DEVICE_HOST`, `TSDB_URL`, ...).

use std::path::{Path, PathBuf};

use anyhow::Context;
use flowtap_core::config::{CollectorConfig, DeviceConfig, StoreConfig, TimezoneConfig};
use tracing::debug;

/// Load, expand and validate the collector configuration.
///
/// Uses `path` if given, else `flowtap/config.json` in the user config
/// directory if it exists, else the environment.
pub fn load(path: Option<&Path>) -> anyhow::Result<CollectorConfig> {
    let config = match path.map(Path::to_path_buf).or_else(default_config_file) {
        Some(path) => load_file(&path)?,
        None => {
            debug!("No config file, reading settings from the environment");
            from_env(|key| std::env::var(key).ok())?
        }
    };
    let config = config.expand();
    config.validate()?;
    Ok(config)
}

fn load_file(path: &Path) -> anyhow::Result<CollectorConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a configuration from environment-style `lookup`.
///
/// Unset variables keep the config defaults; validation happens in [`load`].
pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<CollectorConfig> {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let defaults = DeviceConfig::default();
    let device = DeviceConfig {
        host: get("DEVICE_HOST").unwrap_or_default(),
        port: parse_var(&get, "DEVICE_PORT")?.unwrap_or(defaults.port),
        username: get("DEVICE_USERNAME").unwrap_or_default(),
        auth_method: if get("DEVICE_KEY_PATH").is_some() {
            "key".to_string()
        } else {
            defaults.auth_method.clone()
        },
        password: get("DEVICE_PASSWORD"),
        key_path: get("DEVICE_KEY_PATH"),
        device_type: get("DEVICE_TYPE").unwrap_or(defaults.device_type.clone()),
        ..defaults
    };

    let monitors: Vec<String> = match get("FLOW_MONITORS") {
        Some(list) => list.split(',').map(|m| m.trim().to_string()).collect(),
        None => ["MAIN_MONITOR", "FLAG_MONITOR"]
            .iter()
            .filter_map(|key| get(*key))
            .collect(),
    };

    let tz_defaults = TimezoneConfig::default();
    let timezones = TimezoneConfig {
        device: get("DEVICE_TZ").unwrap_or(tz_defaults.device),
        reference: get("REFERENCE_TZ"),
        canonical: get("CANONICAL_TZ").unwrap_or(tz_defaults.canonical),
    };

    let store_defaults = StoreConfig::default();
    let store = StoreConfig {
        url: get("TSDB_URL").unwrap_or_default(),
        table: get("FLOW_TABLE").unwrap_or(store_defaults.table.clone()),
        ..store_defaults
    };

    // Round-trip through serde so the `#[serde(default)]` functions fill the rest.
    let mut config: CollectorConfig = serde_json::from_value(serde_json::json!({
        "device": device,
        "monitors": monitors,
        "timezones": timezones,
        "store": store,
    }))?;

    if let Some(secs) = parse_var(&get, "POLL_INTERVAL_SECS")? {
        config.poll_interval_secs = secs;
    }
    if let Some(workers) = parse_var(&get, "POLL_WORKERS")? {
        config.workers = workers;
    }
    if let Some(log) = get("FALLBACK_LOG") {
        config.fallback_log = log;
    }
    Ok(config)
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|v| v.parse::<T>().with_context(|| format!("Invalid {key}: {v}")))
        .transpose()
}

/// `~/.config/flowtap/config.json` (or the XDG / macOS equivalent), if it exists.
fn default_config_file() -> Option<PathBuf> {
    let path = config_dir()?.join("config.json");
    path.exists().then_some(path)
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("flowtap"));
    }
    let home = PathBuf::from(std::env::var("HOME").ok()?);
    #[cfg(target_os = "macos")]
    return Some(home.join("Library").join("Application Support").join("flowtap"));
    #[cfg(not(target_os = "macos"))]
    return Some(home.join(".config").join("flowtap"));
}
