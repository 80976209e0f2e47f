//! Storage infrastructure for the controller.
//!
//! - **`config`** – TOML persistence of [`config::AppConfig`], including the
//!   per-device image settings.
//! - **`settings`** – The [`settings::SettingsStore`] view connections read
//!   their image quality and zoom rate from.

pub mod config;
pub mod settings;
