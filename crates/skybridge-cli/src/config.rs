//! Bridge configuration – reads/writes `~/.skybridge/config.toml`.

use serde::{Deserialize, Serialize};
use skybridge_types::BridgeError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted bridge configuration stored in `~/.skybridge/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Ground-station WebSocket URL.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Serial path of the autopilot, or any MAVLink connection address
    /// (`tcpout:127.0.0.1:5760`, `udpin:0.0.0.0:14550`) for simulators.
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// MAVLink system id the bridge identifies itself with.
    #[serde(default = "default_source_system")]
    pub source_system: u8,

    /// Acknowledgement timeout applied to commands that don't carry one.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: f64,

    /// Rate requested for every classic data stream.
    #[serde(default = "default_stream_rate")]
    pub stream_rate_hz: u16,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}
fn default_device() -> String {
    "/dev/ttyACM0".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_source_system() -> u8 {
    255
}
fn default_command_timeout() -> f64 {
    3.0
}
fn default_stream_rate() -> u16 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            device: default_device(),
            baud: default_baud(),
            source_system: default_source_system(),
            command_timeout_secs: default_command_timeout(),
            stream_rate_hz: default_stream_rate(),
        }
    }
}

impl Config {
    /// [`Self::command_timeout_secs`] as a `Duration`, falling back to the
    /// default for non-positive or non-finite values.
    pub fn command_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.command_timeout_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_command_timeout()))
    }
}

/// Return the path to `~/.skybridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".skybridge").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, BridgeError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SKYBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SKYBRIDGE_SERVER_URL` | `server_url` |
/// | `SKYBRIDGE_DEVICE` | `device` |
/// | `SKYBRIDGE_BAUD` | `baud` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SKYBRIDGE_SERVER_URL") {
        cfg.server_url = v;
    }
    if let Ok(v) = std::env::var("SKYBRIDGE_DEVICE") {
        cfg.device = v;
    }
    if let Ok(baud) = std::env::var("SKYBRIDGE_BAUD").map(|v| v.parse::<u32>()) {
        match baud {
            Ok(baud) => cfg.baud = baud,
            Err(e) => tracing::warn!(error = %e, "Ignoring invalid SKYBRIDGE_BAUD"),
        }
    }
}

/// Save the config to disk, creating `~/.skybridge/` if necessary.
pub fn save(cfg: &Config) -> Result<(), BridgeError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BridgeError::Config(format!("failed to create config directory: {e}")))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        BridgeError::Config(format!("failed to write {}: {e}", path.display()))
    })
}
