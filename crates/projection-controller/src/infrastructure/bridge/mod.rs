//! Interfaces to the device bridge and the on-device agent.
//!
//! The controller never talks to the USB bridge tooling or to the device's
//! package manager itself.  Both are external collaborators consumed through
//! the traits in this module:
//!
//! - [`DeviceBridge`] – enumerates devices, reads properties, and manages the
//!   OS-level port forwards that tunnel loopback ports to the device.
//! - [`AgentLifecycle`] – starts the on-device agent and the streaming helper,
//!   and installs the helper when it is missing.
//!
//! # Testability
//!
//! [`mock::MockDeviceBridge`] and [`mock::MockAgentLifecycle`] record every
//! call so tests can assert on what the controller asked for without a device
//! attached.  [`direct::DirectBridge`] serves devices reached purely by IP.

use std::fmt;

use async_trait::async_trait;
use projection_core::TransportHandle;
use thiserror::Error;

pub mod direct;
pub mod mock;

/// Device property names read when a connection is created.
pub mod properties {
    pub const MANUFACTURER: &str = "ro.product.manufacturer";
    pub const CPU_ABI: &str = "ro.product.cpu.abi";
    pub const API_LEVEL: &str = "ro.build.version.sdk";
    pub const MODEL: &str = "ro.product.model";
    /// Stable hardware serial; identifies a device across transports.
    pub const SERIAL: &str = "ro.serialno";
}

/// Error type for bridge and agent operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The transport is not (or no longer) attached.
    #[error("device not attached: {0}")]
    DeviceNotFound(TransportHandle),

    /// A bridge command ran but reported failure.
    #[error("bridge command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The operation does not apply to this kind of transport.
    #[error("operation `{operation}` not supported for {handle}")]
    Unsupported {
        operation: &'static str,
        handle: TransportHandle,
    },

    /// Talking to the bridge itself failed.
    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a local port forward points on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForwardTarget {
    /// A TCP port on the device.
    Tcp(u16),
    /// A named abstract-namespace Unix socket on the device.
    LocalAbstract(String),
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardTarget::Tcp(port) => write!(f, "tcp:{port}"),
            ForwardTarget::LocalAbstract(name) => write!(f, "localabstract:{name}"),
        }
    }
}

/// Input method the agent can switch the device to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMethod {
    /// The agent's own input method, which accepts injected touch events.
    Touch,
    /// The device's regular keyboard.
    System,
}

/// Device enumeration, properties, and port forwarding.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Lists the transports currently attached.
    async fn list_devices(&self) -> Result<Vec<TransportHandle>, BridgeError>;

    /// Reads a device property.  `Ok(None)` when the property is unset.
    async fn read_property(
        &self,
        handle: &TransportHandle,
        name: &str,
    ) -> Result<Option<String>, BridgeError>;

    /// Tunnels `127.0.0.1:local_port` to `target` on the device.
    async fn create_forward(
        &self,
        handle: &TransportHandle,
        local_port: u16,
        target: &ForwardTarget,
    ) -> Result<(), BridgeError>;

    /// Removes a forward created by [`DeviceBridge::create_forward`].
    async fn remove_forward(
        &self,
        handle: &TransportHandle,
        local_port: u16,
        target: &ForwardTarget,
    ) -> Result<(), BridgeError>;

    /// Whether the transport is a wireless link.
    fn is_wireless_device(&self, handle: &TransportHandle) -> bool {
        handle.is_wireless()
    }

    /// The device's IP on its current network, if known.
    async fn resolve_device_ip(
        &self,
        handle: &TransportHandle,
    ) -> Result<Option<String>, BridgeError>;
}

/// Lifecycle of the on-device agent and streaming helper.
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    /// Starts the agent's control service unless it is already running.
    async fn ensure_agent_running(&self, handle: &TransportHandle) -> Result<(), BridgeError>;

    /// Whether the streaming helper binary is present on the device.
    async fn check_helper_installed(&self, handle: &TransportHandle) -> Result<bool, BridgeError>;

    async fn install_helper(&self, handle: &TransportHandle) -> Result<(), BridgeError>;

    /// (Re)starts the streaming helper at the given zoom rate.
    async fn start_streaming_helper(
        &self,
        handle: &TransportHandle,
        zoom_rate: f64,
    ) -> Result<(), BridgeError>;

    async fn switch_input_method(
        &self,
        handle: &TransportHandle,
        method: InputMethod,
    ) -> Result<(), BridgeError>;
}
