//! ConnectionRegistry: the set of known devices.
//!
//! Transport attach and detach notifications from the bridge land here.  The
//! registry maps each transport to a stable device id, creates the
//! [`DeviceConnection`] on first sight, and disposes it once its last
//! transport is gone.
//!
//! Attach and detach for the same device id run one at a time, so a
//! transport never lands on a connection that is being disposed.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use projection_core::{DeviceId, TransportHandle};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::application::channel_state::ConnectState;
use crate::application::events::ConnectionEvent;
use crate::infrastructure::bridge::properties;
use crate::infrastructure::device::connection::{ConnectionContext, DeviceConnection};

/// Registry of live device connections, keyed by device id.
pub struct ConnectionRegistry {
    connections: DashMap<DeviceId, Arc<DeviceConnection>>,
    /// Serializes attach/detach per device id.
    transitions: DashMap<DeviceId, Arc<Mutex<()>>>,
    ctx: Arc<ConnectionContext>,
    this: Weak<ConnectionRegistry>,
}

impl ConnectionRegistry {
    pub fn new(ctx: Arc<ConnectionContext>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connections: DashMap::new(),
            transitions: DashMap::new(),
            ctx,
            this: this.clone(),
        })
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    /// Subscribes to lifecycle events of every connection.
    pub fn subscribe(&self) -> mpsc::Receiver<ConnectionEvent> {
        self.ctx.events.subscribe()
    }

    /// Handles a transport appearing.
    ///
    /// The transport is added to the device's existing connection, or a new
    /// connection is created (emitting `Created`) and the transport attached
    /// to it.  Nothing is dialed.
    pub async fn device_attached(&self, handle: TransportHandle) -> Arc<DeviceConnection> {
        let id = self.resolve_device_id(&handle).await;
        let transition = self.transition_lock(&id);
        let _serial = transition.lock().await;

        match self.get(&id) {
            Some(existing) if existing.connect_state() != ConnectState::Closed => {
                existing.attach(handle).await;
                return existing;
            }
            Some(disposed) => {
                self.remove_if_same(&disposed);
            }
            None => {}
        }

        let fresh =
            DeviceConnection::create(id.clone(), &handle, Arc::clone(&self.ctx), self.this.clone())
                .await;
        // A concurrent attach for the same device may have won the race.
        let (conn, created) = match self.connections.entry(id.clone()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                e.insert(Arc::clone(&fresh));
                (fresh, true)
            }
        };
        if created {
            info!(device = %id, %handle, "device connection created");
            self.ctx.events.emit(ConnectionEvent::Created { device_id: id });
        }

        conn.attach(handle).await;
        conn
    }

    /// Handles a transport disappearing.
    ///
    /// Disposes the owning connection when no transport remains.  Returns
    /// the affected connection, if any held `handle`.
    pub async fn device_detached(&self, handle: &TransportHandle) -> Option<Arc<DeviceConnection>> {
        let Some(conn) = self.find_by_transport(handle) else {
            warn!(%handle, "detach for unknown transport ignored");
            return None;
        };
        let transition = self.transition_lock(conn.id());
        let _serial = transition.lock().await;

        if !conn.holds_transport(handle) {
            debug!(device = %conn.id(), %handle, "transport already gone");
            return Some(conn);
        }
        if !conn.detach(handle).await {
            conn.dispose().await;
        }
        Some(conn)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        self.connections.get(device_id).map(|e| Arc::clone(e.value()))
    }

    /// Registered device ids, sorted.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Registers `conn`, replacing any connection with the same id.
    ///
    /// The replaced connection is returned untouched; once it notices it is
    /// no longer current it refuses handshakes.
    pub fn insert(&self, conn: Arc<DeviceConnection>) -> Option<Arc<DeviceConnection>> {
        let id = conn.id().to_string();
        let previous = self.connections.insert(id.clone(), conn);
        if previous.is_none() {
            self.ctx.events.emit(ConnectionEvent::Created { device_id: id });
        }
        previous
    }

    /// Whether `conn` is the instance registered for its id.
    pub fn is_current(&self, conn: &DeviceConnection) -> bool {
        self.connections
            .get(conn.id())
            .is_some_and(|e| std::ptr::eq(Arc::as_ptr(e.value()), conn))
    }

    /// Removes `conn` if it is still the registered instance, emitting
    /// `Removed`.
    pub fn remove_if_same(&self, conn: &DeviceConnection) -> bool {
        let removed = self
            .connections
            .remove_if(conn.id(), |_, c| std::ptr::eq(Arc::as_ptr(c), conn))
            .is_some();
        if removed {
            info!(device = %conn.id(), "device connection removed");
            self.ctx.events.emit(ConnectionEvent::Removed {
                device_id: conn.id().to_string(),
            });
        }
        removed
    }

    /// Disposes every connection and stops the worker pool.
    pub async fn shutdown(&self) {
        let all: Vec<_> = self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        info!(count = all.len(), "shutting down device connections");
        for conn in all {
            conn.dispose().await;
        }
        self.ctx.workers.close();
    }

    fn transition_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let entry = self
            .transitions
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    fn find_by_transport(&self, handle: &TransportHandle) -> Option<Arc<DeviceConnection>> {
        self.connections
            .iter()
            .find(|e| e.value().holds_transport(handle))
            .map(|e| Arc::clone(e.value()))
    }

    /// The device's hardware serial, or the transport serial when the device
    /// does not report one.
    async fn resolve_device_id(&self, handle: &TransportHandle) -> DeviceId {
        match self.ctx.bridge.read_property(handle, properties::SERIAL).await {
            Ok(Some(serial)) if !serial.trim().is_empty() => serial.trim().to_string(),
            Ok(_) => handle.serial.clone(),
            Err(e) => {
                warn!(%handle, "could not read device serial: {e}");
                handle.serial.clone()
            }
        }
    }
}
