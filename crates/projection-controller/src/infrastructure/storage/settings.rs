//! Per-device image settings as seen by connections.
//!
//! Connections read the image quality and zoom rate when they send the
//! `create-session` handshake.  [`ConfigSettingsStore`] serves them from the
//! `[[devices]]` table of the loaded [`AppConfig`] and falls back to the
//! defaults for devices that have no entry.

use std::collections::HashMap;
use std::sync::RwLock;

use super::config::{AppConfig, DeviceSettings, DEFAULT_IMAGE_QUALITY, DEFAULT_ZOOM_RATE};

/// Read/write access to per-device image settings.
#[cfg_attr(test, mockall::automock)]
pub trait SettingsStore: Send + Sync {
    /// JPEG quality for `device_id`, 0–100.
    fn image_quality(&self, device_id: &str) -> i32;

    fn zoom_rate(&self, device_id: &str) -> f32;

    fn set_image_settings(&self, device_id: &str, image_quality: i32, zoom_rate: f32);
}

/// [`SettingsStore`] backed by the config file's device table.
#[derive(Debug, Default)]
pub struct ConfigSettingsStore {
    devices: RwLock<HashMap<String, DeviceSettings>>,
}

impl ConfigSettingsStore {
    pub fn from_config(config: &AppConfig) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect();
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Current settings, sorted by device id, for writing back to the config.
    pub fn snapshot(&self) -> Vec<DeviceSettings> {
        let mut out: Vec<DeviceSettings> = self.read().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeviceSettings>> {
        self.devices.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl SettingsStore for ConfigSettingsStore {
    fn image_quality(&self, device_id: &str) -> i32 {
        self.read()
            .get(device_id)
            .map_or(DEFAULT_IMAGE_QUALITY, |d| d.image_quality)
    }

    fn zoom_rate(&self, device_id: &str) -> f32 {
        self.read()
            .get(device_id)
            .map_or(DEFAULT_ZOOM_RATE, |d| d.zoom_rate)
    }

    fn set_image_settings(&self, device_id: &str, image_quality: i32, zoom_rate: f32) {
        let mut devices = self.devices.write().unwrap_or_else(|p| p.into_inner());
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceSettings {
                id: device_id.to_string(),
                image_quality,
                zoom_rate,
                name: None,
            });
        entry.image_quality = image_quality.clamp(0, 100);
        entry.zoom_rate = zoom_rate;
    }
}
