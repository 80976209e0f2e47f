//! DeviceConnection: one device's control and image channels.
//!
//! A `DeviceConnection` owns everything needed to talk to one physical
//! device: which transports are attached (USB, wireless, or both), the control
//! session, the image channel, and the two guards that keep connect attempts
//! and image dials single-flight.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!            connect()            handshake ok
//!   Idle ───────────────► Connecting ─────────► Connected
//!    ▲                        │                    │
//!    └──── failure ───────────┘                    │ transport switch
//!    ▲                                             ▼
//!    └─────────── close() ◄─────────────── Connecting (forced reconnect)
//!
//!   any ── dispose() ──► Closed
//! ```
//!
//! The image channel has its own `Idle → Connecting → Streaming` cycle and is
//! opened separately, after the control channel is up.
//!
//! # Threading
//!
//! All mutable state sits behind short-lived `std::sync::Mutex`es that are
//! never held across an `.await`.  Long work (non-waiting handshakes, image
//! dials) runs on the shared worker pool and reaches back through a `Weak`
//! self-reference, so a disposed connection is simply not upgraded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use projection_core::protocol::messages::{
    CreateSessionRequest, CreateSessionResponse, ERROR_TYPE_DEVICE_OFFLINE,
};
use projection_core::{
    ChannelKind, ControlMessage, DeviceId, DeviceMeta, Parameters, ProtocolError, TransportHandle,
};
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::channel_state::{
    ChannelSlots, ConnectState, ImageState, OperationGuard, SlotChange,
};
use crate::application::events::{ConnectionEvent, EventBus};
use crate::infrastructure::bridge::{
    properties, AgentLifecycle, BridgeError, DeviceBridge, InputMethod,
};
use crate::infrastructure::device::registry::ConnectionRegistry;
use crate::infrastructure::network::control_session::{ControlError, ControlSession};
use crate::infrastructure::network::dial::{dial, wait_until_accepting, DialError};
use crate::infrastructure::network::image_session::{
    ControllerImageSession, ImageSession, ImageSessionRegistry,
};
use crate::infrastructure::network::image_stream::{drain_frames, StreamEnd};
use crate::infrastructure::network::port_forward::{ForwardError, PortForwardRegistry};
use crate::infrastructure::storage::config::{AppConfig, HelperReadiness, NetworkConfig};
use crate::infrastructure::storage::settings::SettingsStore;
use crate::infrastructure::worker_pool::WorkerPool;

const LOOPBACK: &str = "127.0.0.1";

/// Error type for device connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("device {0} has no attached transport")]
    NoTransport(DeviceId),

    #[error("no IP address known for device {0}")]
    NoDeviceIp(DeviceId),

    #[error("device {0} is not connected")]
    NotConnected(DeviceId),

    #[error("connection to device {0} has been disposed")]
    Disposed(DeviceId),

    #[error("handshake answered by device {actual}, expected {expected}")]
    DeviceIdMismatch { expected: DeviceId, actual: DeviceId },

    /// The connection is no longer the one registered for its device.
    #[error("device {0} is offline")]
    DeviceOffline(DeviceId),

    /// The device answered the handshake with an error.
    #[error("device reported error (type {error_type}): {message}")]
    Remote { error_type: i64, message: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("malformed handshake: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Whether the failure was a dial that did not complete in time.
    pub fn is_dial_timeout(&self) -> bool {
        matches!(self, ConnectionError::Dial(DialError::Timeout { .. }))
    }
}

/// Receives the outcome of an asynchronous image-channel open.
pub trait ImageChannelListener: Send + Sync {
    fn on_success(&self, device_id: &str);
    fn on_failed(&self, device_id: &str, error: &ConnectionError);
}

/// Collaborators and settings shared by every connection.
pub struct ConnectionContext {
    pub bridge: Arc<dyn DeviceBridge>,
    pub agent: Arc<dyn AgentLifecycle>,
    pub forwards: Arc<PortForwardRegistry>,
    pub image_sessions: Arc<ImageSessionRegistry>,
    pub settings: Arc<dyn SettingsStore>,
    pub events: Arc<EventBus>,
    pub workers: WorkerPool,
    pub network: NetworkConfig,
}

impl ConnectionContext {
    /// Builds the shared registries, event bus and worker pool from `config`.
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        agent: Arc<dyn AgentLifecycle>,
        settings: Arc<dyn SettingsStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            forwards: Arc::new(PortForwardRegistry::new(Arc::clone(&bridge), &config.network)),
            image_sessions: Arc::new(ImageSessionRegistry::new()),
            events: Arc::new(EventBus::new()),
            workers: WorkerPool::new(config.controller.worker_pool_size),
            network: config.network.clone(),
            bridge,
            agent,
            settings,
        }
    }
}

/// An open image socket and the task draining it.
struct ImageChannel {
    generation: u64,
    session_id: uuid::Uuid,
    drain: JoinHandle<()>,
    /// Held so the socket stays open; dropped on close.
    _writer: OwnedWriteHalf,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// The live connection to one device.
pub struct DeviceConnection {
    id: DeviceId,
    ctx: Arc<ConnectionContext>,
    registry: Weak<ConnectionRegistry>,
    this: Weak<DeviceConnection>,

    meta: Mutex<DeviceMeta>,
    channels: Mutex<ChannelSlots>,
    control: Mutex<Option<Arc<ControlSession>>>,
    inbound: Mutex<Option<mpsc::Receiver<ControlMessage>>>,
    image: Mutex<Option<ImageChannel>>,
    frame_sink: Mutex<Option<mpsc::Sender<Bytes>>>,

    connect_state: Mutex<ConnectState>,
    image_state: Mutex<ImageState>,
    connect_attempts: AtomicU64,
    image_generation: AtomicU64,
    connect_guard: OperationGuard,
    image_guard: OperationGuard,
}

impl DeviceConnection {
    /// Creates a connection for `id` and reads the device's descriptive
    /// properties through `probe`.
    ///
    /// No transport is attached yet; call [`DeviceConnection::attach`].
    /// Property read failures are logged and leave the field empty.  Pass
    /// `Weak::new()` as `registry` for a connection that no registry owns.
    pub async fn create(
        id: DeviceId,
        probe: &TransportHandle,
        ctx: Arc<ConnectionContext>,
        registry: Weak<ConnectionRegistry>,
    ) -> Arc<Self> {
        let conn = Arc::new_cyclic(|this| Self {
            meta: Mutex::new(DeviceMeta::new(id.clone())),
            id,
            ctx,
            registry,
            this: this.clone(),
            channels: Mutex::new(ChannelSlots::new()),
            control: Mutex::new(None),
            inbound: Mutex::new(None),
            image: Mutex::new(None),
            frame_sink: Mutex::new(None),
            connect_state: Mutex::new(ConnectState::Idle),
            image_state: Mutex::new(ImageState::Idle),
            connect_attempts: AtomicU64::new(0),
            image_generation: AtomicU64::new(0),
            connect_guard: OperationGuard::new(),
            image_guard: OperationGuard::new(),
        });
        conn.load_properties(probe).await;
        conn
    }

    async fn load_properties(&self, handle: &TransportHandle) {
        let mut values = Vec::with_capacity(4);
        for name in [
            properties::MANUFACTURER,
            properties::CPU_ABI,
            properties::API_LEVEL,
            properties::MODEL,
        ] {
            match self.ctx.bridge.read_property(handle, name).await {
                Ok(value) => values.push(value),
                Err(e) => {
                    warn!(device = %self.id, property = name, "property read failed: {e}");
                    values.push(None);
                }
            }
        }
        let mut meta = lock(&self.meta);
        let mut values = values.into_iter();
        meta.manufacturer = values.next().flatten();
        meta.cpu_abi = values.next().flatten();
        meta.api_level = values.next().flatten();
        meta.model = values.next().flatten();
    }

    // ── Transport slots ───────────────────────────────────────────────────────

    /// Records a USB transport.  Never pre-empts an active wireless link.
    pub async fn attach_usb(&self, handle: TransportHandle) {
        info!(device = %self.id, %handle, "usb channel attached");
        let change = lock(&self.channels).attach_usb(handle);
        self.apply_slot_change(change).await;
    }

    /// Records a wireless transport and switches to it, reconnecting if the
    /// control channel was up.
    pub async fn attach_wireless(&self, handle: TransportHandle) {
        info!(device = %self.id, %handle, "wireless channel attached");
        let change = lock(&self.channels).attach_wireless(handle);
        self.apply_slot_change(change).await;
    }

    /// Attaches `handle` to the slot its kind calls for.
    pub async fn attach(&self, handle: TransportHandle) {
        if self.ctx.bridge.is_wireless_device(&handle) {
            self.attach_wireless(handle).await;
        } else {
            self.attach_usb(handle).await;
        }
    }

    /// Removes `handle`.  If it was the active transport and the other one is
    /// present, switches to the other and reconnects.
    ///
    /// Returns whether any transport remains.
    pub async fn detach(&self, handle: &TransportHandle) -> bool {
        info!(device = %self.id, %handle, "channel detached");
        let detached = lock(&self.channels).detach(handle);
        self.apply_slot_change(detached.change).await;
        detached.remaining
    }

    async fn apply_slot_change(&self, change: SlotChange) {
        match change {
            SlotChange::Unchanged => {}
            SlotChange::Activated(handle) => self.emit_channel_changed(Some(handle)),
            SlotChange::Cleared => self.emit_channel_changed(None),
            SlotChange::Switched(handle) => self.reconnect_through(handle).await,
        }
    }

    /// Re-dials established channels after the active transport changed.
    async fn reconnect_through(&self, handle: TransportHandle) {
        info!(device = %self.id, %handle, "active transport switched");
        self.emit_channel_changed(Some(handle));

        if self.connect_state() != ConnectState::Connected {
            return;
        }
        self.close().await;
        if let Err(e) = self.connect(false).await {
            warn!(device = %self.id, "reconnect after transport switch failed: {e}");
        }
    }

    fn emit_channel_changed(&self, active: Option<TransportHandle>) {
        self.emit(ConnectionEvent::ChannelChanged {
            device_id: self.id.clone(),
            active,
        });
    }

    // ── Control channel ───────────────────────────────────────────────────────

    /// Establishes the control channel through the active transport.
    ///
    /// Returns `Ok(())` at once when another connect is already running.
    /// With `wait`, returns after the `create-session` handshake has been
    /// applied; without it, returns once the request is sent and applies the
    /// response in the background.
    ///
    /// # Errors
    ///
    /// Returns the first failure among agent start, endpoint resolution,
    /// dial and (with `wait`) handshake.  Any socket opened by a failed
    /// attempt is closed.
    pub async fn connect(&self, wait: bool) -> Result<(), ConnectionError> {
        let Some(_token) = self.connect_guard.try_acquire() else {
            debug!(device = %self.id, "connect already in progress");
            return Ok(());
        };
        if self.connect_state() == ConnectState::Closed {
            return Err(ConnectionError::Disposed(self.id.clone()));
        }

        self.set_connect_state(ConnectState::Connecting);
        let result = self.establish_control(wait).await;
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = &result {
            warn!(device = %self.id, attempt, "connect failed: {e}");
            self.set_connect_state(ConnectState::Idle);
        }
        result
    }

    async fn establish_control(&self, wait: bool) -> Result<(), ConnectionError> {
        let handle = self
            .active_transport()
            .ok_or_else(|| ConnectionError::NoTransport(self.id.clone()))?;

        self.ctx.agent.ensure_agent_running(&handle).await?;
        let (host, port) = self.control_endpoint(&handle).await?;
        self.await_agent_ready(&host, port).await;

        let stream = dial(&host, port, self.ctx.network.dial_timeout()).await?;
        let (session, inbound) =
            ControlSession::start_with(stream, self.ctx.network.handshake_timeout());
        self.install_control(Arc::clone(&session), inbound);
        info!(device = %self.id, %handle, "control socket open at {host}:{port}");

        let request = self.create_session_request();
        if wait {
            let outcome = self.handshake(&session, request).await;
            if outcome.is_err() {
                self.discard_control(&session).await;
            }
            return outcome;
        }

        let Some(this) = self.this.upgrade() else {
            self.discard_control(&session).await;
            return Err(ConnectionError::Disposed(self.id.clone()));
        };
        self.ctx.workers.spawn(async move {
            if let Err(e) = this.handshake(&session, request).await {
                warn!(device = %this.id, "handshake failed: {e}");
                // A newer connect may own the state by now.
                let current = this.is_current_control(&session);
                this.discard_control(&session).await;
                if current {
                    this.set_connect_state(ConnectState::Idle);
                }
            }
        });
        Ok(())
    }

    fn create_session_request(&self) -> ControlMessage {
        let image_quality = self.ctx.settings.image_quality(&self.id);
        let zoom_rate = self.ctx.settings.zoom_rate(&self.id);
        lock(&self.meta).zoom_rate = f64::from(zoom_rate);
        CreateSessionRequest {
            image_quality,
            zoom_rate,
        }
        .to_message()
    }

    async fn handshake(
        &self,
        session: &ControlSession,
        request: ControlMessage,
    ) -> Result<(), ConnectionError> {
        let response = session
            .request(request, self.ctx.network.handshake_timeout())
            .await?;
        self.apply_handshake(session, &response).await
    }

    /// Applies a `create-session` response received on the current control
    /// session.
    ///
    /// # Errors
    ///
    /// See [`ConnectionError`]: `Remote` for an error response,
    /// `DeviceIdMismatch` when the device answered with another id, and
    /// `DeviceOffline` when this connection is no longer registered (the
    /// device is told so).
    pub async fn prepare_connection(&self, response: &ControlMessage) -> Result<(), ConnectionError> {
        let session = self
            .control_session()
            .ok_or_else(|| ConnectionError::NotConnected(self.id.clone()))?;
        self.apply_handshake(&session, response).await
    }

    async fn apply_handshake(
        &self,
        session: &ControlSession,
        response: &ControlMessage,
    ) -> Result<(), ConnectionError> {
        if let Some(message) = &response.error {
            return Err(ConnectionError::Remote {
                error_type: response.params.get_int("errorType").unwrap_or(0),
                message: message.clone(),
            });
        }

        let parsed = CreateSessionResponse::from_message(response)?;
        if parsed.device_id != self.id {
            return Err(ConnectionError::DeviceIdMismatch {
                expected: self.id.clone(),
                actual: parsed.device_id,
            });
        }

        if !self.is_registered() {
            let mut params = Parameters::new();
            params.set("errorType", ERROR_TYPE_DEVICE_OFFLINE);
            if let Err(e) = session
                .reply(response, params, Some("device is offline".to_string()))
                .await
            {
                debug!(device = %self.id, "could not notify device it is offline: {e}");
            }
            return Err(ConnectionError::DeviceOffline(self.id.clone()));
        }

        if !self.is_current_control(session) {
            return Err(ConnectionError::Control(ControlError::ConnectionClosed));
        }

        {
            let mut meta = lock(&self.meta);
            if parsed.phone.is_some() {
                meta.phone = parsed.phone;
            }
            match parsed.image_host {
                Some(host) => meta.ip = Some(host),
                None => warn!(device = %self.id, "handshake carried no image host"),
            }
            meta.screen_width = parsed.screen_width;
            meta.screen_height = parsed.screen_height;
            meta.rotation = parsed.rotation;
            if parsed.agent_version.is_some() {
                meta.agent_version = parsed.agent_version;
            }
            if let Some(code) = parsed.agent_version_code {
                meta.agent_version_code = code;
            }
        }

        session.arm_idle_timeout(self.ctx.network.idle_timeout());
        if self.set_connect_state(ConnectState::Connected) {
            info!(device = %self.id, "control channel connected");
            self.emit(ConnectionEvent::Connected {
                device_id: self.id.clone(),
                channel: ChannelKind::Control,
            });
        }
        Ok(())
    }

    async fn control_endpoint(
        &self,
        handle: &TransportHandle,
    ) -> Result<(String, u16), ConnectionError> {
        if self.ctx.bridge.is_wireless_device(handle) {
            let ip = self.resolve_ip(handle).await?;
            Ok((ip, self.ctx.network.control_remote_port))
        } else {
            let port = self
                .ctx
                .forwards
                .forward(&self.id, handle, ChannelKind::Control)
                .await?;
            Ok((LOOPBACK.to_string(), port))
        }
    }

    /// Asks the bridge for the device's IP, falling back to the last known one.
    async fn resolve_ip(&self, handle: &TransportHandle) -> Result<String, ConnectionError> {
        match self.ctx.bridge.resolve_device_ip(handle).await? {
            Some(ip) => {
                self.update_ip(&ip);
                Ok(ip)
            }
            None => lock(&self.meta)
                .ip
                .clone()
                .ok_or_else(|| ConnectionError::NoDeviceIp(self.id.clone())),
        }
    }

    async fn await_agent_ready(&self, host: &str, port: u16) {
        match self.ctx.network.helper_readiness {
            HelperReadiness::FixedDelay { delay_ms } => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
            HelperReadiness::Poll {
                interval_ms,
                timeout_ms,
            } => {
                let ready = wait_until_accepting(
                    host,
                    port,
                    Duration::from_millis(interval_ms),
                    Duration::from_millis(timeout_ms),
                )
                .await;
                if !ready {
                    warn!(device = %self.id, "agent not accepting after {timeout_ms}ms; dialing anyway");
                }
            }
        }
    }

    fn install_control(&self, session: Arc<ControlSession>, inbound: mpsc::Receiver<ControlMessage>) {
        let previous = lock(&self.control).replace(Arc::clone(&session));
        *lock(&self.inbound) = Some(inbound);
        if let Some(old) = previous {
            tokio::spawn(async move { old.close().await });
        }

        let weak = self.this.clone();
        tokio::spawn(async move {
            session.closed().await;
            if let Some(conn) = weak.upgrade() {
                conn.on_control_closed(&session);
            }
        });
    }

    fn is_current_control(&self, session: &ControlSession) -> bool {
        lock(&self.control)
            .as_ref()
            .is_some_and(|s| s.id() == session.id())
    }

    /// Removes `session` if it is current and closes it, without an event.
    async fn discard_control(&self, session: &ControlSession) {
        {
            let mut slot = lock(&self.control);
            if slot.as_ref().is_some_and(|s| s.id() == session.id()) {
                slot.take();
            }
        }
        session.close().await;
    }

    /// The session closed on its own (peer EOF, read error, idle timeout).
    fn on_control_closed(&self, session: &ControlSession) {
        let removed = {
            let mut slot = lock(&self.control);
            if slot.as_ref().is_some_and(|s| s.id() == session.id()) {
                slot.take()
            } else {
                None
            }
        };
        if removed.is_none() {
            return;
        }
        info!(device = %self.id, "control session lost");
        self.set_connect_state(ConnectState::Idle);
        self.emit(ConnectionEvent::ConnectionClosed {
            device_id: self.id.clone(),
            channel: ChannelKind::Control,
        });
    }

    // ── Image channel ─────────────────────────────────────────────────────────

    /// Opens the image channel unless it is already streaming.
    ///
    /// Returns `true` when the channel was already open; the listener is told
    /// of success immediately.  Otherwise the dial runs on the worker pool,
    /// the listener hears the outcome later, and `false` is returned.
    pub fn open_image_channel(&self, listener: Option<Arc<dyn ImageChannelListener>>) -> bool {
        if self.is_image_channel_available() {
            if let Some(l) = &listener {
                l.on_success(&self.id);
            }
            return true;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.ctx.workers.spawn(async move {
            this.connect_image(listener).await;
        });
        false
    }

    async fn connect_image(&self, listener: Option<Arc<dyn ImageChannelListener>>) {
        let Some(_token) = self.image_guard.try_acquire() else {
            debug!(device = %self.id, "image dial already in flight; request dropped");
            return;
        };
        if self.is_image_channel_available() {
            if let Some(l) = &listener {
                l.on_success(&self.id);
            }
            return;
        }
        // A channel whose draining task already ended.
        if lock(&self.image).is_some() {
            self.close_image_channel();
        }

        self.set_image_state(ImageState::Connecting);
        let session = Arc::new(ControllerImageSession::new(self.id.clone(), self.frame_sender()));
        let session_id = session.session_id();
        if let Some(old) = self.ctx.image_sessions.add_session(session) {
            old.close();
        }

        match self.dial_image().await {
            Ok(stream) => self.start_image_stream(stream, session_id, listener),
            Err(e) => {
                warn!(device = %self.id, "image channel failed: {e}");
                self.ctx.image_sessions.remove_session(&self.id, session_id);
                self.set_image_state(ImageState::Idle);
                if let Some(l) = &listener {
                    l.on_failed(&self.id, &e);
                }
            }
        }
    }

    async fn dial_image(&self) -> Result<TcpStream, ConnectionError> {
        let handle = self
            .active_transport()
            .ok_or_else(|| ConnectionError::NoTransport(self.id.clone()))?;
        let agent = &self.ctx.agent;

        if !agent.check_helper_installed(&handle).await? {
            info!(device = %self.id, "installing streaming helper");
            agent.install_helper(&handle).await?;
        }
        let zoom_rate = f64::from(self.ctx.settings.zoom_rate(&self.id));
        agent.start_streaming_helper(&handle, zoom_rate).await?;
        agent.switch_input_method(&handle, InputMethod::Touch).await?;

        let (host, port) = if self.ctx.bridge.is_wireless_device(&handle) {
            let known = lock(&self.meta).ip.clone();
            let ip = match known {
                Some(ip) => ip,
                None => self.resolve_ip(&handle).await?,
            };
            (ip, self.ctx.network.image_remote_port)
        } else {
            let port = self
                .ctx
                .forwards
                .forward(&self.id, &handle, ChannelKind::Image)
                .await?;
            (LOOPBACK.to_string(), port)
        };

        Ok(dial(&host, port, self.ctx.network.dial_timeout()).await?)
    }

    fn start_image_stream(
        &self,
        stream: TcpStream,
        session_id: uuid::Uuid,
        listener: Option<Arc<dyn ImageChannelListener>>,
    ) {
        let generation = self.image_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = stream.into_split();

        let weak = self.this.clone();
        let device_id = self.id.clone();
        let sessions = Arc::clone(&self.ctx.image_sessions);
        let max_frame_bytes = self.ctx.network.max_frame_bytes;
        let drain = tokio::spawn(async move {
            let end = drain_frames(read_half, device_id, sessions, max_frame_bytes).await;
            if let Some(conn) = weak.upgrade() {
                conn.on_image_stream_end(generation, end);
            }
        });

        *lock(&self.image) = Some(ImageChannel {
            generation,
            session_id,
            drain,
            _writer: write_half,
        });
        self.set_image_state(ImageState::Streaming);
        info!(device = %self.id, "image channel streaming");

        if let Some(l) = &listener {
            l.on_success(&self.id);
        }
        self.emit(ConnectionEvent::Connected {
            device_id: self.id.clone(),
            channel: ChannelKind::Image,
        });
    }

    fn on_image_stream_end(&self, generation: u64, end: StreamEnd) {
        let current = lock(&self.image).as_ref().map(|c| c.generation);
        if current == Some(generation) {
            info!(device = %self.id, frames = end.frames(), "image stream ended: {end:?}");
            self.close_image_channel();
        }
    }

    /// Tears down the image channel.  A no-op when none is open.
    pub fn close_image_channel(&self) {
        let Some(channel) = lock(&self.image).take() else {
            return;
        };
        self.ctx
            .image_sessions
            .remove_session(&self.id, channel.session_id);
        channel.drain.abort();
        drop(channel);

        self.set_image_state(ImageState::Idle);
        info!(device = %self.id, "image channel closed");
        self.emit(ConnectionEvent::ConnectionClosed {
            device_id: self.id.clone(),
            channel: ChannelKind::Image,
        });
    }

    /// Restarts streaming after the device's image quality or zoom changed.
    ///
    /// The streaming helper is restarted as part of the new dial.
    pub fn reconfigure_image(&self, listener: Option<Arc<dyn ImageChannelListener>>) -> bool {
        lock(&self.meta).zoom_rate = f64::from(self.ctx.settings.zoom_rate(&self.id));
        self.close_image_channel();
        self.open_image_channel(listener)
    }

    /// Routes frames to `sink` for image sessions opened from now on.
    ///
    /// Without a sink, streamed frames are discarded.
    pub fn set_frame_sink(&self, sink: mpsc::Sender<Bytes>) {
        *lock(&self.frame_sink) = Some(sink);
    }

    fn frame_sender(&self) -> mpsc::Sender<Bytes> {
        lock(&self.frame_sink).clone().unwrap_or_else(|| {
            let (tx, _rx) = mpsc::channel(1);
            tx
        })
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Closes the control session and the image channel.  The connection
    /// stays usable; call [`DeviceConnection::connect`] to re-establish.
    pub async fn close(&self) {
        let session = lock(&self.control).take();
        lock(&self.inbound).take();
        self.close_image_channel();

        if let Some(s) = &session {
            s.close().await;
        }
        self.set_connect_state(ConnectState::Idle);

        if session.is_some() {
            info!(device = %self.id, "control channel closed");
            self.emit(ConnectionEvent::ConnectionClosed {
                device_id: self.id.clone(),
                channel: ChannelKind::Control,
            });
        }
    }

    /// Closes everything, releases the port forwards, and removes the
    /// connection from its registry.  Terminal.
    pub async fn dispose(&self) {
        self.close().await;
        self.ctx.forwards.release_all(&self.id).await;
        *lock(&self.connect_state) = ConnectState::Closed;

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_same(self);
        }
        info!(device = %self.id, "connection disposed");
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the device metadata.
    pub fn meta(&self) -> DeviceMeta {
        lock(&self.meta).clone()
    }

    pub fn connect_state(&self) -> ConnectState {
        *lock(&self.connect_state)
    }

    pub fn image_state(&self) -> ImageState {
        *lock(&self.image_state)
    }

    /// Completed connect attempts, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn active_transport(&self) -> Option<TransportHandle> {
        lock(&self.channels).active().cloned()
    }

    pub fn has_usb_channel(&self) -> bool {
        lock(&self.channels).usb().is_some()
    }

    pub fn has_wireless_channel(&self) -> bool {
        lock(&self.channels).wireless().is_some()
    }

    /// Whether `handle` occupies either transport slot.
    pub fn holds_transport(&self, handle: &TransportHandle) -> bool {
        let channels = lock(&self.channels);
        channels.usb() == Some(handle) || channels.wireless() == Some(handle)
    }

    pub fn is_wireless_mode(&self) -> bool {
        lock(&self.channels).is_wireless_mode()
    }

    /// Whether an image socket is open and its draining task still runs.
    pub fn is_image_channel_available(&self) -> bool {
        lock(&self.image)
            .as_ref()
            .is_some_and(|c| !c.drain.is_finished())
    }

    pub fn is_connected(&self) -> bool {
        self.connect_state() == ConnectState::Connected
            && self.control_session().is_some_and(|s| !s.is_closed())
    }

    pub fn control_session(&self) -> Option<Arc<ControlSession>> {
        lock(&self.control).clone()
    }

    /// Takes the receiver for device-initiated control messages of the
    /// current session.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<ControlMessage>> {
        lock(&self.inbound).take()
    }

    pub fn update_ip(&self, ip: &str) {
        let mut meta = lock(&self.meta);
        if meta.ip.as_deref() != Some(ip) {
            info!(device = %self.id, "device ip now {ip}");
            meta.ip = Some(ip.to_string());
        }
    }

    pub fn set_device_name(&self, name: impl Into<String>) {
        lock(&self.meta).device_name = Some(name.into());
    }

    pub fn set_zoom_rate(&self, zoom_rate: f64) {
        lock(&self.meta).zoom_rate = zoom_rate;
    }

    pub fn set_rotation(&self, rotation: i16) {
        lock(&self.meta).rotation = rotation;
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Sets the control state unless the connection is disposed.
    fn set_connect_state(&self, state: ConnectState) -> bool {
        let mut current = lock(&self.connect_state);
        if *current == ConnectState::Closed {
            return false;
        }
        *current = state;
        true
    }

    fn set_image_state(&self, state: ImageState) {
        *lock(&self.image_state) = state;
    }

    /// A connection outside any registry counts as registered.
    fn is_registered(&self) -> bool {
        self.registry
            .upgrade()
            .map_or(true, |registry| registry.is_current(self))
    }

    fn emit(&self, event: ConnectionEvent) {
        self.ctx.events.emit(event);
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("id", &self.id)
            .field("connect_state", &self.connect_state())
            .field("image_state", &self.image_state())
            .field("active", &self.active_transport())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
