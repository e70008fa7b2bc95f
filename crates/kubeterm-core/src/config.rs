//! Configuration resolution for kubeterm.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/kubeterm/settings.json`)
//! 3. Project config (`.kubeterm/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Service account token mounted into every pod by the cluster.
pub const IN_CLUSTER_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Complete kubeterm configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to reach the cluster API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Base URL of the API server (e.g. `https://10.0.0.1:6443`).
    pub api_server: String,
    /// Bearer token sent with every request. Takes precedence over `token_path`.
    pub token: Option<String>,
    /// File holding the bearer token (re-read on every open).
    pub token_path: Option<PathBuf>,
    /// PEM bundle of the cluster CA.
    pub ca_cert_path: Option<PathBuf>,
    /// Namespace used when the caller does not name one.
    pub default_namespace: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            token: None,
            token_path: None,
            ca_cert_path: None,
            default_namespace: "default".to_string(),
        }
    }
}

/// Session relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Cap on retained history per session, in bytes.
    pub history_max_bytes: usize,
    /// Command used for interactive sessions when the UI names none.
    pub default_shell: Vec<String>,
    /// Pause between the two resize frames of a forced redraw.
    pub redraw_delay_ms: u64,
    /// Per-channel buffer depth between the demultiplexer and reader tasks.
    pub channel_capacity: usize,
    /// How long `close` waits for transport pumps and readers to wind down.
    pub close_timeout_ms: u64,
    /// Close sessions that had no viewer for this long. `None` disables the reaper.
    pub idle_timeout_secs: Option<u64>,
    /// How often the idle reaper sweeps the registry.
    pub reaper_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_max_bytes: 256 * 1024,
            default_shell: vec!["/bin/bash".to_string()],
            redraw_delay_ms: 50,
            channel_capacity: 256,
            close_timeout_ms: 2000,
            idle_timeout_secs: None,
            reaper_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    pub const fn redraw_delay(&self) -> Duration {
        Duration::from_millis(self.redraw_delay_ms)
    }

    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

/// Logging output options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// Each file overrides only the keys it sets; everything else keeps the
/// value from the layer below.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_config(&mut config, read_layer(&global_path)?)?;
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".kubeterm").join("settings.json");
        if project_path.exists() {
            merge_config(&mut config, read_layer(&project_path)?)?;
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("kubeterm").join("settings.json"))
}

/// Load a single config file on top of the built-in defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut config = Config::default();
    merge_config(&mut config, read_layer(path)?)?;
    Ok(config)
}

fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    let layer: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !layer.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must hold a JSON object",
            path.display()
        )));
    }
    debug!(path = %path.display(), "Loaded config file");
    Ok(layer)
}

fn merge_config(base: &mut Config, layer: Value) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_values(&mut merged, layer);
    *base = serde_json::from_value(merged)?;
    Ok(())
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `KUBETERM_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("KUBETERM_API_SERVER") {
        config.cluster.api_server = val;
    }
    if let Some(val) = lookup("KUBETERM_TOKEN") {
        config.cluster.token = Some(val);
    }
    if let Some(val) = lookup("KUBETERM_NAMESPACE") {
        config.cluster.default_namespace = val;
    }
    if let Some(val) = lookup("KUBETERM_HISTORY_BYTES")
        && let Ok(n) = val.parse()
    {
        config.relay.history_max_bytes = n;
    }
    if let Some(val) = lookup("KUBETERM_IDLE_TIMEOUT_SECS")
        && let Ok(n) = val.parse()
    {
        config.relay.idle_timeout_secs = Some(n);
    }
    if let Some(val) = lookup("KUBETERM_LOG_LEVEL") {
        config.logging.level = val;
    }
}
