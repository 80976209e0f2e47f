//! Local port-forward bookkeeping for USB transports.
//!
//! Over USB the device is reachable only through OS-level forwards set up by
//! the device bridge: `127.0.0.1:<local_port>` on the desktop tunnels to a TCP
//! port or an abstract socket on the device.  Each device needs one forward
//! per channel kind, and the local port must stay stable for as long as the
//! connection lives so reconnects reuse it.
//!
//! The registry is a sharded map keyed by `(device_id, kind)`.  Mutations of
//! one key are serialized by the shard lock; unrelated devices proceed
//! concurrently.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use projection_core::{ChannelKind, DeviceId, TransportHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infrastructure::bridge::{BridgeError, DeviceBridge, ForwardTarget};
use crate::infrastructure::storage::config::NetworkConfig;

/// Error type for forward allocation.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No free local port could be reserved.
    #[error("could not allocate a local port for {device_id}/{kind}: {source}")]
    Allocation {
        device_id: DeviceId,
        kind: ChannelKind,
        #[source]
        source: std::io::Error,
    },

    /// The bridge refused to create the OS-level forward.
    #[error("bridge could not forward port {local_port} to {target}: {source}")]
    Bridge {
        local_port: u16,
        target: ForwardTarget,
        #[source]
        source: BridgeError,
    },
}

/// One allocated forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub local_port: u16,
    pub target: ForwardTarget,
    /// Transport the OS forward was last created through, if any.
    pub handle: Option<TransportHandle>,
}

/// Shared registry of `(device_id, kind) → local port` forwards.
pub struct PortForwardRegistry {
    forwards: DashMap<(DeviceId, ChannelKind), PortForward>,
    bridge: Arc<dyn DeviceBridge>,
    control_target: ForwardTarget,
    image_target: ForwardTarget,
}

impl PortForwardRegistry {
    pub fn new(bridge: Arc<dyn DeviceBridge>, network: &NetworkConfig) -> Self {
        Self {
            forwards: DashMap::new(),
            bridge,
            control_target: ForwardTarget::Tcp(network.control_remote_port),
            image_target: ForwardTarget::LocalAbstract(network.image_socket_name.clone()),
        }
    }

    /// Device-side endpoint for forwards of `kind`.
    pub fn target_for(&self, kind: ChannelKind) -> ForwardTarget {
        match kind {
            ChannelKind::Control => self.control_target.clone(),
            ChannelKind::Image => self.image_target.clone(),
        }
    }

    /// Returns the local port for `(device_id, kind)`, reserving one on first
    /// use.  Later calls return the same port.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Allocation`] when the OS has no free port.
    pub fn ensure_forward(&self, device_id: &str, kind: ChannelKind) -> Result<u16, ForwardError> {
        match self.forwards.entry((device_id.to_string(), kind)) {
            Entry::Occupied(e) => Ok(e.get().local_port),
            Entry::Vacant(e) => {
                let local_port = probe_free_port().map_err(|source| ForwardError::Allocation {
                    device_id: device_id.to_string(),
                    kind,
                    source,
                })?;
                debug!(device = device_id, %kind, local_port, "reserved local port");
                e.insert(PortForward {
                    local_port,
                    target: self.target_for(kind),
                    handle: None,
                });
                Ok(local_port)
            }
        }
    }

    /// Ensures the port and asks the bridge to (re)create the OS forward
    /// through `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError`] when allocation or the bridge call fails.
    pub async fn forward(
        &self,
        device_id: &str,
        handle: &TransportHandle,
        kind: ChannelKind,
    ) -> Result<u16, ForwardError> {
        let local_port = self.ensure_forward(device_id, kind)?;
        let target = self.target_for(kind);
        self.bridge
            .create_forward(handle, local_port, &target)
            .await
            .map_err(|source| ForwardError::Bridge {
                local_port,
                target: target.clone(),
                source,
            })?;

        if let Some(mut entry) = self.forwards.get_mut(&(device_id.to_string(), kind)) {
            entry.handle = Some(handle.clone());
        }
        info!(device = device_id, %kind, local_port, %target, "forward created");
        Ok(local_port)
    }

    /// Drops the forward for `(device_id, kind)` and asks the bridge to tear
    /// it down.  Teardown errors are logged only.
    pub async fn release(&self, device_id: &str, kind: ChannelKind) {
        let Some((_, fwd)) = self.forwards.remove(&(device_id.to_string(), kind)) else {
            return;
        };
        let Some(handle) = fwd.handle else {
            debug!(device = device_id, %kind, "released unforwarded port reservation");
            return;
        };
        match self
            .bridge
            .remove_forward(&handle, fwd.local_port, &fwd.target)
            .await
        {
            Ok(()) => info!(device = device_id, %kind, port = fwd.local_port, "forward removed"),
            Err(e) => warn!(
                device = device_id,
                %kind,
                port = fwd.local_port,
                "removing forward failed: {e}"
            ),
        }
    }

    /// Releases both forward kinds of `device_id`.
    pub async fn release_all(&self, device_id: &str) {
        self.release(device_id, ChannelKind::Control).await;
        self.release(device_id, ChannelKind::Image).await;
    }

    pub fn get(&self, device_id: &str, kind: ChannelKind) -> Option<PortForward> {
        self.forwards
            .get(&(device_id.to_string(), kind))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }
}

/// Asks the OS for a free loopback port by binding port 0.
///
/// The probe socket is closed before the bridge binds the port, so another
/// process could take it in between; the bridge then reports the failure on
/// `create_forward`.
fn probe_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bridge::mock::MockDeviceBridge;

    fn make_registry() -> (PortForwardRegistry, Arc<MockDeviceBridge>) {
        let bridge = Arc::new(MockDeviceBridge::new());
        let registry = PortForwardRegistry::new(bridge.clone(), &NetworkConfig::default());
        (registry, bridge)
    }

    #[test]
    fn test_ensure_forward_is_idempotent_per_key() {
        // Arrange
        let (registry, _bridge) = make_registry();

        // Act
        let first = registry.ensure_forward("dev-1", ChannelKind::Control).unwrap();
        let second = registry.ensure_forward("dev-1", ChannelKind::Control).unwrap();

        // Assert
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_control_and_image_forwards_get_distinct_ports() {
        let (registry, _bridge) = make_registry();

        let control = registry.ensure_forward("dev-1", ChannelKind::Control).unwrap();
        let image = registry.ensure_forward("dev-1", ChannelKind::Image).unwrap();

        assert_ne!(control, image);
        assert_eq!(
            registry.get("dev-1", ChannelKind::Image).unwrap().target,
            ForwardTarget::LocalAbstract("minicap".to_string())
        );
    }

    #[test]
    fn test_concurrent_ensure_forward_allocates_once() {
        let (registry, _bridge) = make_registry();
        let registry = Arc::new(registry);

        let ports: Vec<u16> = (0..8)
            .map(|_| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || r.ensure_forward("dev-1", ChannelKind::Control).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert!(ports.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_creates_os_forward_with_control_target() {
        let (registry, bridge) = make_registry();
        let handle = TransportHandle::usb("R58M12");

        let port = registry
            .forward("dev-1", &handle, ChannelKind::Control)
            .await
            .unwrap();

        let created = bridge.created_forwards();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].local_port, port);
        assert_eq!(created[0].target, ForwardTarget::Tcp(2013));
        assert_eq!(
            registry.get("dev-1", ChannelKind::Control).unwrap().handle,
            Some(handle)
        );
    }

    #[tokio::test]
    async fn test_forward_reports_bridge_failure() {
        let (registry, bridge) = make_registry();
        bridge.fail_create_forward(true);

        let result = registry
            .forward("dev-1", &TransportHandle::usb("x"), ChannelKind::Image)
            .await;

        assert!(matches!(result, Err(ForwardError::Bridge { .. })));
    }

    #[tokio::test]
    async fn test_release_removes_bookkeeping_even_when_bridge_fails() {
        // Arrange
        let (registry, bridge) = make_registry();
        let handle = TransportHandle::usb("R58M12");
        registry
            .forward("dev-1", &handle, ChannelKind::Control)
            .await
            .unwrap();
        bridge.fail_remove_forward(true);

        // Act
        registry.release("dev-1", ChannelKind::Control).await;

        // Assert
        assert!(registry.get("dev-1", ChannelKind::Control).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_all_tears_down_both_kinds_through_recorded_handle() {
        let (registry, bridge) = make_registry();
        let handle = TransportHandle::usb("R58M12");
        registry.forward("dev-1", &handle, ChannelKind::Control).await.unwrap();
        registry.forward("dev-1", &handle, ChannelKind::Image).await.unwrap();
        registry.ensure_forward("dev-2", ChannelKind::Control).unwrap();

        registry.release_all("dev-1").await;

        let removed = bridge.removed_forwards();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|f| f.handle == handle));
        assert_eq!(registry.len(), 1, "unrelated device keeps its reservation");
    }

    #[tokio::test]
    async fn test_release_of_unknown_key_is_a_no_op() {
        let (registry, bridge) = make_registry();
        registry.release("nobody", ChannelKind::Image).await;
        assert!(bridge.removed_forwards().is_empty());
    }
}
