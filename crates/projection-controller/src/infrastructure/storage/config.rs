//! TOML-based configuration persistence for the controller.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\Projection\config.toml`
//! - Linux:    `~/.config/projection/config.toml`
//! - macOS:    `~/Library/Application Support/Projection/config.toml`
//!
//! Example file:
//!
//! ```toml
//! [controller]
//! log_level = "debug"
//!
//! [network]
//! control_remote_port = 2013
//! dial_timeout_ms = 3000
//!
//! [network.helper_readiness]
//! mode = "poll"
//! interval_ms = 100
//! timeout_ms = 3000
//!
//! [[devices]]
//! id = "R58M1234ABC"
//! image_quality = 60
//! zoom_rate = 0.5
//! ```
//!
//! Every field has a `#[serde(default = "...")]`, so a missing file, a
//! missing section, or an older file lacking newer keys all load cleanly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Per-device image settings.
    #[serde(default)]
    pub devices: Vec<DeviceSettings>,
}

/// General controller behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound on concurrently running background dials.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

/// Ports, timeouts and framing limits for device channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// TCP port of the agent's control service on the device.
    #[serde(default = "default_control_remote_port")]
    pub control_remote_port: u16,
    /// TCP port of the streaming helper when reached over wireless.
    #[serde(default = "default_image_remote_port")]
    pub image_remote_port: u16,
    /// Abstract socket the streaming helper listens on, used for USB forwards.
    #[serde(default = "default_image_socket_name")]
    pub image_socket_name: String,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// How long the `create-session` handshake may take.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Seconds of read silence after which a control session closes itself.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Largest image frame accepted from the streaming helper.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub helper_readiness: HelperReadiness,
}

/// How `connect` waits for the agent after starting it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HelperReadiness {
    /// Sleep for a fixed grace period.
    FixedDelay { delay_ms: u64 },
    /// Dial the control endpoint every `interval_ms` until it accepts, for at
    /// most `timeout_ms`.
    Poll { interval_ms: u64, timeout_ms: u64 },
}

impl Default for HelperReadiness {
    fn default() -> Self {
        HelperReadiness::FixedDelay {
            delay_ms: DEFAULT_HELPER_GRACE_MS,
        }
    }
}

/// Image settings for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    pub id: String,
    /// JPEG quality, 0–100.
    #[serde(default = "default_image_quality")]
    pub image_quality: i32,
    #[serde(default = "default_zoom_rate")]
    pub zoom_rate: f32,
    /// User-assigned display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl NetworkConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

const DEFAULT_HELPER_GRACE_MS: u64 = 800;

pub(crate) const DEFAULT_IMAGE_QUALITY: i32 = 80;
pub(crate) const DEFAULT_ZOOM_RATE: f32 = 0.5;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_worker_pool_size() -> usize {
    8
}
fn default_control_remote_port() -> u16 {
    2013
}
fn default_image_remote_port() -> u16 {
    2014
}
fn default_image_socket_name() -> String {
    "minicap".to_string()
}
fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_idle_timeout_secs() -> u64 {
    15
}
fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_image_quality() -> i32 {
    DEFAULT_IMAGE_QUALITY
}
fn default_zoom_rate() -> f32 {
    DEFAULT_ZOOM_RATE
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control_remote_port: default_control_remote_port(),
            image_remote_port: default_image_remote_port(),
            image_socket_name: default_image_socket_name(),
            dial_timeout_ms: default_dial_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            helper_readiness: HelperReadiness::default(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(platform_config_dir()
        .ok_or(ConfigError::NoPlatformConfigDir)?
        .join("config.toml"))
}

/// Loads `AppConfig` from the platform config file, returning defaults if it
/// does not exist yet.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` when the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory including the `Projection`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Projection"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("projection"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Projection")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("projection-config-{tag}-{}", std::process::id()))
            .join("config.toml")
    }

    #[test]
    fn test_default_config_uses_expected_timeouts() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.network.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.network.idle_timeout(), Duration::from_secs(15));
        assert_eq!(
            cfg.network.helper_readiness,
            HelperReadiness::FixedDelay { delay_ms: 800 }
        );
        assert_eq!(cfg.controller.log_level, "info");
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_network_section_keeps_other_defaults() {
        // Arrange
        let toml_str = r#"
[network]
control_remote_port = 9100
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.network.control_remote_port, 9100);
        assert_eq!(cfg.network.image_socket_name, "minicap");
    }

    #[test]
    fn test_poll_readiness_parses_from_tagged_table() {
        let toml_str = r#"
[network.helper_readiness]
mode = "poll"
interval_ms = 50
timeout_ms = 2000
"#;
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize poll");
        assert_eq!(
            cfg.network.helper_readiness,
            HelperReadiness::Poll {
                interval_ms: 50,
                timeout_ms: 2000
            }
        );
    }

    #[test]
    fn test_device_entry_without_settings_uses_image_defaults() {
        let toml_str = r#"
[[devices]]
id = "emulator-5554"
"#;
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize devices");
        assert_eq!(cfg.devices[0].image_quality, DEFAULT_IMAGE_QUALITY);
        assert!((cfg.devices[0].zoom_rate - DEFAULT_ZOOM_RATE).abs() < f32::EPSILON);
        assert!(cfg.devices[0].name.is_none());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let path = temp_config_path("invalid");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/config.toml");
        assert_eq!(load_config_from(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_device_settings() {
        // Arrange
        let path = temp_config_path("save");
        let mut cfg = AppConfig::default();
        cfg.network.dial_timeout_ms = 1234;
        cfg.devices.push(DeviceSettings {
            id: "R58M1234ABC".to_string(),
            image_quality: 40,
            zoom_rate: 0.75,
            name: Some("bench phone".to_string()),
        });

        // Act
        save_config_to(&cfg, &path).expect("save");
        let restored = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
