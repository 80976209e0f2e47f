//! Connection lifecycle events and their fan-out to listeners.
//!
//! Every listener gets its own bounded queue.  [`EventBus::emit`] never
//! blocks: the caller is usually on a network path (a reader task or a
//! connect attempt), so a listener that stops draining its queue loses
//! events instead of stalling the device.
//!
//! Events for one device are enqueued in the order its transitions happen.
//! Nothing orders events across devices.

use std::sync::Mutex;

use projection_core::{ChannelKind, DeviceId, TransportHandle};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default per-listener queue depth.
pub const LISTENER_QUEUE_CAPACITY: usize = 64;

/// A lifecycle transition of one device connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A connection object was created for a newly attached device.
    Created { device_id: DeviceId },
    /// A channel finished establishing.
    Connected {
        device_id: DeviceId,
        channel: ChannelKind,
    },
    /// A previously established channel closed.
    ConnectionClosed {
        device_id: DeviceId,
        channel: ChannelKind,
    },
    /// The active transport changed (or was cleared).
    ChannelChanged {
        device_id: DeviceId,
        active: Option<TransportHandle>,
    },
    /// The connection was removed from the registry.
    Removed { device_id: DeviceId },
}

impl ConnectionEvent {
    pub fn device_id(&self) -> &str {
        match self {
            ConnectionEvent::Created { device_id }
            | ConnectionEvent::Connected { device_id, .. }
            | ConnectionEvent::ConnectionClosed { device_id, .. }
            | ConnectionEvent::ChannelChanged { device_id, .. }
            | ConnectionEvent::Removed { device_id } => device_id,
        }
    }
}

/// Fan-out of [`ConnectionEvent`]s to any number of listeners.
#[derive(Debug)]
pub struct EventBus {
    listeners: Mutex<Vec<mpsc::Sender<ConnectionEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(LISTENER_QUEUE_CAPACITY)
    }

    /// Creates a bus whose listener queues hold `capacity` events each.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers a listener.  Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> mpsc::Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().push(tx);
        rx
    }

    /// Delivers `event` to every live listener without waiting.
    ///
    /// A full queue drops the event for that listener only.  Listeners whose
    /// receiver is gone are pruned.
    pub fn emit(&self, event: ConnectionEvent) {
        debug!(?event, "lifecycle event");
        self.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    device = dropped.device_id(),
                    "listener queue full; dropping lifecycle event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<ConnectionEvent>>> {
        // A poisoned list is still structurally valid.
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
