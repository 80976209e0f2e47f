//! Recording bridge and agent doubles for tests.
//!
//! Both doubles keep every call in order so a test can assert on exactly
//! which forwards were created or which helper steps ran.  Failures can be
//! switched on per operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use projection_core::TransportHandle;
use tokio::sync::Semaphore;

use super::{AgentLifecycle, BridgeError, DeviceBridge, ForwardTarget, InputMethod};

/// A forward as seen by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedForward {
    pub handle: TransportHandle,
    pub local_port: u16,
    pub target: ForwardTarget,
}

#[derive(Default)]
struct BridgeState {
    devices: Vec<TransportHandle>,
    properties: HashMap<(String, String), String>,
    ips: HashMap<String, String>,
    created: Vec<RecordedForward>,
    removed: Vec<RecordedForward>,
    fail_create_forward: bool,
    fail_remove_forward: bool,
}

/// In-memory [`DeviceBridge`] that records forwards.
#[derive(Default)]
pub struct MockDeviceBridge {
    state: Mutex<BridgeState>,
}

impl MockDeviceBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, handle: TransportHandle) {
        self.lock().devices.push(handle);
    }

    pub fn set_property(&self, handle: &TransportHandle, name: &str, value: &str) {
        self.lock()
            .properties
            .insert((handle.serial.clone(), name.to_string()), value.to_string());
    }

    /// Sets the IP returned by `resolve_device_ip` for `handle`.
    pub fn set_ip(&self, handle: &TransportHandle, ip: &str) {
        self.lock().ips.insert(handle.serial.clone(), ip.to_string());
    }

    pub fn fail_create_forward(&self, fail: bool) {
        self.lock().fail_create_forward = fail;
    }

    pub fn fail_remove_forward(&self, fail: bool) {
        self.lock().fail_remove_forward = fail;
    }

    pub fn created_forwards(&self) -> Vec<RecordedForward> {
        self.lock().created.clone()
    }

    pub fn removed_forwards(&self) -> Vec<RecordedForward> {
        self.lock().removed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl DeviceBridge for MockDeviceBridge {
    async fn list_devices(&self) -> Result<Vec<TransportHandle>, BridgeError> {
        Ok(self.lock().devices.clone())
    }

    async fn read_property(
        &self,
        handle: &TransportHandle,
        name: &str,
    ) -> Result<Option<String>, BridgeError> {
        Ok(self
            .lock()
            .properties
            .get(&(handle.serial.clone(), name.to_string()))
            .cloned())
    }

    async fn create_forward(
        &self,
        handle: &TransportHandle,
        local_port: u16,
        target: &ForwardTarget,
    ) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if state.fail_create_forward {
            return Err(BridgeError::CommandFailed {
                command: format!("forward tcp:{local_port} {target}"),
                message: "injected failure".to_string(),
            });
        }
        state.created.push(RecordedForward {
            handle: handle.clone(),
            local_port,
            target: target.clone(),
        });
        Ok(())
    }

    async fn remove_forward(
        &self,
        handle: &TransportHandle,
        local_port: u16,
        target: &ForwardTarget,
    ) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if state.fail_remove_forward {
            return Err(BridgeError::CommandFailed {
                command: format!("forward --remove tcp:{local_port}"),
                message: "injected failure".to_string(),
            });
        }
        state.removed.push(RecordedForward {
            handle: handle.clone(),
            local_port,
            target: target.clone(),
        });
        Ok(())
    }

    async fn resolve_device_ip(
        &self,
        handle: &TransportHandle,
    ) -> Result<Option<String>, BridgeError> {
        Ok(self.lock().ips.get(&handle.serial).cloned())
    }
}

/// One call observed by [`MockAgentLifecycle`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    EnsureAgentRunning(TransportHandle),
    CheckHelperInstalled(TransportHandle),
    InstallHelper(TransportHandle),
    StartStreamingHelper(TransportHandle, f64),
    SwitchInputMethod(TransportHandle, InputMethod),
}

struct AgentState {
    calls: Vec<AgentCall>,
    helper_installed: bool,
    fail_ensure_agent: bool,
    fail_start_streaming: bool,
    streaming_gate: Option<Arc<Semaphore>>,
}

/// [`AgentLifecycle`] double recording every call.
pub struct MockAgentLifecycle {
    state: Mutex<AgentState>,
}

impl MockAgentLifecycle {
    /// Creates a double whose helper is already installed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AgentState {
                calls: Vec::new(),
                helper_installed: true,
                fail_ensure_agent: false,
                fail_start_streaming: false,
                streaming_gate: None,
            }),
        }
    }

    pub fn set_helper_installed(&self, installed: bool) {
        self.lock().helper_installed = installed;
    }

    pub fn fail_ensure_agent(&self, fail: bool) {
        self.lock().fail_ensure_agent = fail;
    }

    pub fn fail_start_streaming(&self, fail: bool) {
        self.lock().fail_start_streaming = fail;
    }

    /// Makes `start_streaming_helper` wait until the returned gate gets a
    /// permit.
    pub fn hold_start_streaming(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().streaming_gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentState> {
        self.state.lock().expect("lock poisoned")
    }
}

impl Default for MockAgentLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(command: &str) -> BridgeError {
    BridgeError::CommandFailed {
        command: command.to_string(),
        message: "injected failure".to_string(),
    }
}

#[async_trait]
impl AgentLifecycle for MockAgentLifecycle {
    async fn ensure_agent_running(&self, handle: &TransportHandle) -> Result<(), BridgeError> {
        let mut state = self.lock();
        state.calls.push(AgentCall::EnsureAgentRunning(handle.clone()));
        if state.fail_ensure_agent {
            return Err(injected("start agent"));
        }
        Ok(())
    }

    async fn check_helper_installed(&self, handle: &TransportHandle) -> Result<bool, BridgeError> {
        let mut state = self.lock();
        state.calls.push(AgentCall::CheckHelperInstalled(handle.clone()));
        Ok(state.helper_installed)
    }

    async fn install_helper(&self, handle: &TransportHandle) -> Result<(), BridgeError> {
        let mut state = self.lock();
        state.calls.push(AgentCall::InstallHelper(handle.clone()));
        state.helper_installed = true;
        Ok(())
    }

    async fn start_streaming_helper(
        &self,
        handle: &TransportHandle,
        zoom_rate: f64,
    ) -> Result<(), BridgeError> {
        let gate = {
            let mut state = self.lock();
            state
                .calls
                .push(AgentCall::StartStreamingHelper(handle.clone(), zoom_rate));
            if state.fail_start_streaming {
                return Err(injected("start streaming helper"));
            }
            state.streaming_gate.clone()
        };
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        Ok(())
    }

    async fn switch_input_method(
        &self,
        handle: &TransportHandle,
        method: InputMethod,
    ) -> Result<(), BridgeError> {
        self.lock()
            .calls
            .push(AgentCall::SwitchInputMethod(handle.clone(), method));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_bridge_records_created_and_removed_forwards() {
        // Arrange
        let bridge = MockDeviceBridge::new();
        let handle = TransportHandle::usb("R58M12");
        let target = ForwardTarget::Tcp(2013);

        // Act
        bridge.create_forward(&handle, 40001, &target).await.unwrap();
        bridge.remove_forward(&handle, 40001, &target).await.unwrap();

        // Assert
        let expected = RecordedForward {
            handle,
            local_port: 40001,
            target,
        };
        assert_eq!(bridge.created_forwards(), vec![expected.clone()]);
        assert_eq!(bridge.removed_forwards(), vec![expected]);
    }

    #[tokio::test]
    async fn test_mock_bridge_injected_failure_is_reported() {
        let bridge = MockDeviceBridge::new();
        bridge.fail_create_forward(true);
        let result = bridge
            .create_forward(&TransportHandle::usb("x"), 1, &ForwardTarget::Tcp(2))
            .await;
        assert!(matches!(result, Err(BridgeError::CommandFailed { .. })));
        assert!(bridge.created_forwards().is_empty());
    }

    #[tokio::test]
    async fn test_mock_bridge_returns_configured_property_and_ip() {
        let bridge = MockDeviceBridge::new();
        let handle = TransportHandle::usb("x");
        bridge.set_property(&handle, crate::infrastructure::bridge::properties::MODEL, "Pixel 7");
        bridge.set_ip(&handle, "10.0.0.9");

        assert_eq!(
            bridge
                .read_property(&handle, crate::infrastructure::bridge::properties::MODEL)
                .await
                .unwrap()
                .as_deref(),
            Some("Pixel 7")
        );
        assert_eq!(
            bridge.resolve_device_ip(&handle).await.unwrap().as_deref(),
            Some("10.0.0.9")
        );
    }

    #[tokio::test]
    async fn test_mock_agent_install_marks_helper_present() {
        let agent = MockAgentLifecycle::new();
        let handle = TransportHandle::usb("x");
        agent.set_helper_installed(false);

        assert!(!agent.check_helper_installed(&handle).await.unwrap());
        agent.install_helper(&handle).await.unwrap();
        assert!(agent.check_helper_installed(&handle).await.unwrap());
        assert_eq!(agent.calls().len(), 3);
    }
}
