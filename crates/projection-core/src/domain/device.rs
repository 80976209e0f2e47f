//! Device identity, metadata, and transport handles.
//!
//! A physical device may be reachable through up to two transports at the
//! same time: a USB connection (through a local port forward) and a wireless
//! link (directly by IP).  Each transport is represented by a
//! [`TransportHandle`]; the handle's serial is whatever the device bridge uses
//! to address that transport (a USB serial number, or `ip:port` for wireless).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a physical device.
///
/// The same device keeps the same id whether it is reached over USB or
/// wireless, which is what lets one connection own both transports.
pub type DeviceId = String;

/// The transport a [`TransportHandle`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Reached through the USB bridge; channels go through local port forwards.
    Usb,
    /// Reached directly over the network by IP.
    Wireless,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "usb"),
            TransportKind::Wireless => write!(f, "wireless"),
        }
    }
}

/// A handle to one transport of a device, as reported by the device bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportHandle {
    /// Bridge-level serial used to address the transport.
    pub serial: String,
    /// Whether this handle is a USB or a wireless transport.
    pub kind: TransportKind,
}

impl TransportHandle {
    /// Creates a USB transport handle.
    pub fn usb(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: TransportKind::Usb,
        }
    }

    /// Creates a wireless transport handle.
    pub fn wireless(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: TransportKind::Wireless,
        }
    }

    pub fn is_wireless(&self) -> bool {
        self.kind == TransportKind::Wireless
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.serial)
    }
}

/// The two logical channels a device exposes.
///
/// Also used as the key kind for local port forwards, since each channel
/// needs its own forward on the USB transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Request/response protocol plus notifications.
    Control,
    /// Continuous binary frame stream.
    Image,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Control => write!(f, "control"),
            ChannelKind::Image => write!(f, "image"),
        }
    }
}

/// Descriptive metadata about a device.
///
/// Populated in three stages: bridge properties when the connection is
/// created, the `create-session` handshake response, and later
/// reconfiguration (zoom rate, rotation, name).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub id: DeviceId,
    pub phone: Option<String>,
    pub device_name: Option<String>,
    pub manufacturer: Option<String>,
    pub cpu_abi: Option<String>,
    pub api_level: Option<String>,
    pub model: Option<String>,
    /// IP the device reported (or the bridge resolved) for wireless access.
    pub ip: Option<String>,
    /// Name of the network the device is attached to, if reported.
    pub network: Option<String>,
    pub network_available: bool,
    /// Port of the on-device video service, if reported.
    pub video_port: u16,
    pub screen_width: u32,
    pub screen_height: u32,
    pub zoom_rate: f64,
    /// Screen rotation in quarter turns as reported by the helper.
    pub rotation: i16,
    /// Version name of the on-device helper.
    pub agent_version: Option<String>,
    pub agent_version_code: i32,
}

impl DeviceMeta {
    /// Creates empty metadata for `id`.
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            zoom_rate: 1.0,
            ..Default::default()
        }
    }

    /// Display name: the user-assigned name when set, else the model, else the id.
    pub fn display_name(&self) -> &str {
        self.device_name
            .as_deref()
            .or(self.model.as_deref())
            .unwrap_or(&self.id)
    }
}
