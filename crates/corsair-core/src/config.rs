//! Configuration resolution for Corsair.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/corsair/client.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Complete operator client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Connection settings for the teamserver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// gRPC endpoint, e.g. `http://127.0.0.1:5004`.
    pub addr: String,
    /// Operator bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub connect_timeout_secs: u64,
    /// Deadline applied to every unary RPC.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:5004".to_string(),
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Task dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Upper bound for a blocking wait on task completion.
    pub wait_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 300,
        }
    }
}

impl TaskConfig {
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

/// Configuration source priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    Global = 1,
    File = 2,
    Environment = 3,
    Cli = 4,
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is an additional file layered on top of the global one; unlike
/// the global file it must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    resolve_config(explicit, |key| std::env::var(key).ok()).map(|(config, _)| config)
}

/// Like [`load_config`], also reporting the highest layer that contributed.
pub fn resolve_config(
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(Config, ConfigSource)> {
    let mut merged = serde_json::to_value(Config::default())?;
    let mut source = ConfigSource::Default;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_json(&mut merged, load_config_value(&global_path)?);
        debug!(path = %global_path.display(), "Loaded global config");
        source = ConfigSource::Global;
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, load_config_value(path)?);
        debug!(path = %path.display(), "Loaded config file");
        source = ConfigSource::File;
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    if apply_env_overrides(&mut config, lookup) {
        source = ConfigSource::Environment;
    }

    Ok((config, source))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("corsair").join("client.json"))
}

fn load_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge per key, anything else
/// replaces the base value.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `CORSAIR_*` overrides and report whether any took effect. `lookup`
/// abstracts the environment so the resolution can be exercised without
/// mutating process state.
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> bool {
    let mut applied = false;
    if let Some(val) = lookup("CORSAIR_SERVER") {
        config.server.addr = val;
        applied = true;
    }
    if let Some(val) = lookup("CORSAIR_TOKEN") {
        config.server.token = Some(val);
        applied = true;
    }
    if let Some(n) = parse_secs(&lookup, "CORSAIR_REQUEST_TIMEOUT") {
        config.server.request_timeout_secs = n;
        applied = true;
    }
    if let Some(n) = parse_secs(&lookup, "CORSAIR_WAIT_TIMEOUT") {
        config.tasks.wait_timeout_secs = n;
        applied = true;
    }
    if let Some(val) = lookup("CORSAIR_LOG_LEVEL") {
        config.log.level = val;
        applied = true;
    }
    applied
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring unparseable timeout override");
            None
        }
    }
}
