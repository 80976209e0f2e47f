//! Bridge for devices reached directly over the network.
//!
//! Used by the headless binary when no USB bridge tooling is available.  The
//! device list is fixed at start-up from the command line and configuration;
//! every device is wireless, so forwards are never needed and the agent is
//! assumed to be started on the device by other means.

use async_trait::async_trait;
use projection_core::TransportHandle;
use tracing::debug;

use super::{AgentLifecycle, BridgeError, DeviceBridge, ForwardTarget, InputMethod};

/// A device known only by its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectDevice {
    pub handle: TransportHandle,
    pub ip: String,
}

impl DirectDevice {
    /// A wireless device with serial `ip:5555`, the bridge's usual wireless
    /// serial format.
    pub fn new(ip: impl Into<String>) -> Self {
        let ip = ip.into();
        Self {
            handle: TransportHandle::wireless(format!("{ip}:5555")),
            ip,
        }
    }
}

/// [`DeviceBridge`] over a fixed list of wireless devices.
#[derive(Debug, Default)]
pub struct DirectBridge {
    devices: Vec<DirectDevice>,
}

impl DirectBridge {
    pub fn new(devices: Vec<DirectDevice>) -> Self {
        Self { devices }
    }

    fn find(&self, handle: &TransportHandle) -> Result<&DirectDevice, BridgeError> {
        self.devices
            .iter()
            .find(|d| d.handle == *handle)
            .ok_or_else(|| BridgeError::DeviceNotFound(handle.clone()))
    }
}

#[async_trait]
impl DeviceBridge for DirectBridge {
    async fn list_devices(&self) -> Result<Vec<TransportHandle>, BridgeError> {
        Ok(self.devices.iter().map(|d| d.handle.clone()).collect())
    }

    async fn read_property(
        &self,
        handle: &TransportHandle,
        _name: &str,
    ) -> Result<Option<String>, BridgeError> {
        self.find(handle)?;
        Ok(None)
    }

    async fn create_forward(
        &self,
        handle: &TransportHandle,
        _local_port: u16,
        _target: &ForwardTarget,
    ) -> Result<(), BridgeError> {
        Err(BridgeError::Unsupported {
            operation: "create_forward",
            handle: handle.clone(),
        })
    }

    async fn remove_forward(
        &self,
        _handle: &TransportHandle,
        _local_port: u16,
        _target: &ForwardTarget,
    ) -> Result<(), BridgeError> {
        // Nothing was ever forwarded.
        Ok(())
    }

    async fn resolve_device_ip(
        &self,
        handle: &TransportHandle,
    ) -> Result<Option<String>, BridgeError> {
        Ok(Some(self.find(handle)?.ip.clone()))
    }
}

/// [`AgentLifecycle`] for devices whose agent and helper are managed
/// on-device.  Every step succeeds without doing anything.
#[derive(Debug, Default)]
pub struct PreinstalledAgent;

#[async_trait]
impl AgentLifecycle for PreinstalledAgent {
    async fn ensure_agent_running(&self, handle: &TransportHandle) -> Result<(), BridgeError> {
        debug!(%handle, "agent assumed running");
        Ok(())
    }

    async fn check_helper_installed(&self, _handle: &TransportHandle) -> Result<bool, BridgeError> {
        Ok(true)
    }

    async fn install_helper(&self, _handle: &TransportHandle) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn start_streaming_helper(
        &self,
        handle: &TransportHandle,
        zoom_rate: f64,
    ) -> Result<(), BridgeError> {
        debug!(%handle, zoom_rate, "streaming helper assumed running");
        Ok(())
    }

    async fn switch_input_method(
        &self,
        _handle: &TransportHandle,
        _method: InputMethod,
    ) -> Result<(), BridgeError> {
        Ok(())
    }
}
