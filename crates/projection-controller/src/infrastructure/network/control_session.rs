//! Control-channel session: request/response correlation over one socket.
//!
//! A [`ControlSession`] owns one TCP connection to the device agent.  It
//! splits the stream: the write half sits behind an async mutex so any task
//! can send, and a reader task decodes inbound messages.
//!
//! # Request lifecycle
//!
//! ```text
//! request(msg, timeout)
//!   ├─ assign correlation id, register pending slot
//!   ├─ write ─────────────────────────► deadline passes → RequestTimeout
//!   └─ wait ──► response with same id   → Ok(response)
//!          ├──► deadline passes          → RequestTimeout, slot removed
//!          └──► session closed           → ConnectionClosed
//! ```
//!
//! One deadline covers both the write and the wait.  A write cut off halfway
//! leaves a partial frame on the wire, so it closes the session.  Plain
//! [`ControlSession::send`] writes are bounded by the session's write
//! timeout.
//!
//! Responses that match no pending slot (late, duplicate, or for a request
//! that already timed out) are logged and discarded.  Requests and
//! notifications initiated by the device go to the inbound channel returned
//! by [`ControlSession::start`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use projection_core::protocol::{
    codec::payload_len_from_header, messages::HEADER_SIZE, CorrelationIdGenerator,
};
use projection_core::{
    decode_message, encode_message, ControlMessage, MessageKind, Parameters, ProtocolError,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Capacity of the inbound request/notification channel.
const INBOUND_CAPACITY: usize = 64;

/// Write bound used by [`ControlSession::start`].
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for control-session operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// No response arrived within the request's timeout.
    #[error("request `{command}` timed out after {timeout:?}")]
    RequestTimeout { command: String, timeout: Duration },

    /// The session closed before or while the operation ran.
    #[error("control session closed")]
    ConnectionClosed,

    /// The peer stopped reading and a write could not finish in time.
    #[error("control write stalled for {0:?}")]
    WriteStalled(Duration),

    #[error("control protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("control channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<ControlMessage, ControlError>>>;

/// State shared between the session handle and its background tasks.
struct Shared {
    session_id: Uuid,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    write_timeout: Duration,
    pending: Mutex<PendingMap>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last successful read.
    last_read_ms: AtomicU64,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_read_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Marks the session closed and fails every pending request.  Idempotent.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!(session = %self.session_id, count = drained.len(), "failing pending requests");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(ControlError::ConnectionClosed));
        }
        self.closed_tx.send_replace(true);
        true
    }

    /// Drops the write half unless a writer holds it.  That writer sees the
    /// shutdown and drops the half itself.
    fn drop_writer(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Removes a pending slot when the waiting request ends for any reason,
/// including the request future being dropped.
struct PendingEntry<'a> {
    shared: &'a Shared,
    correlation_id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.correlation_id);
    }
}

/// One established control connection.
pub struct ControlSession {
    shared: Arc<Shared>,
    peer: Option<SocketAddr>,
    ids: CorrelationIdGenerator,
    reader: Mutex<Option<JoinHandle<()>>>,
    idle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlSession {
    /// Takes ownership of `stream` and starts the reader task.
    ///
    /// Returns the session and the receiver for device-initiated requests and
    /// notifications.  Dropping the receiver is allowed; those messages are
    /// then discarded.
    pub fn start(stream: TcpStream) -> (Arc<Self>, mpsc::Receiver<ControlMessage>) {
        Self::start_with(stream, DEFAULT_WRITE_TIMEOUT)
    }

    /// Like [`ControlSession::start`], bounding each `send` by
    /// `write_timeout`.
    pub fn start_with(
        stream: TcpStream,
        write_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<ControlMessage>) {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let shared = Arc::new(Shared {
            session_id: Uuid::new_v4(),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            write_timeout,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            closed_tx,
            epoch: Instant::now(),
            last_read_ms: AtomicU64::new(0),
        });

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared), inbound_tx));
        info!(session = %shared.session_id, ?peer, "control session started");

        let session = Arc::new(Self {
            shared,
            peer,
            ids: CorrelationIdGenerator::new(),
            reader: Mutex::new(Some(reader)),
            idle: Mutex::new(None),
        });
        (session, inbound_rx)
    }

    /// Unique id of this session instance.
    pub fn id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Resolves once the session has closed, for whatever reason.
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Writes `msg` without waiting for any response.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ConnectionClosed`] on a closed session,
    /// [`ControlError::WriteStalled`] when the write timeout passes, and
    /// [`ControlError::Io`] when the write fails.  A failed or stalled write
    /// also closes the session.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), ControlError> {
        let deadline = Instant::now() + self.shared.write_timeout;
        self.send_until(msg, deadline).await
    }

    async fn send_until(&self, msg: &ControlMessage, deadline: Instant) -> Result<(), ControlError> {
        if self.is_closed() {
            return Err(ControlError::ConnectionClosed);
        }
        let bytes = encode_message(msg)?;
        let shared = self.shared.as_ref();
        let stalled = || ControlError::WriteStalled(shared.write_timeout);

        // Nothing is on the wire yet, so giving up here keeps the stream intact.
        let mut writer = tokio::select! {
            writer = shared.writer.lock() => writer,
            _ = shared.wait_closed() => return Err(ControlError::ConnectionClosed),
            _ = tokio::time::sleep_until(deadline) => return Err(stalled()),
        };
        if shared.closed.load(Ordering::Acquire) {
            writer.take();
            return Err(ControlError::ConnectionClosed);
        }
        let Some(w) = writer.as_mut() else {
            return Err(ControlError::ConnectionClosed);
        };

        let outcome = tokio::select! {
            written = w.write_all(&bytes) => written.map_err(ControlError::Io),
            _ = shared.wait_closed() => Err(ControlError::ConnectionClosed),
            _ = tokio::time::sleep_until(deadline) => Err(stalled()),
        };
        if let Err(e) = &outcome {
            if !matches!(e, ControlError::ConnectionClosed) {
                warn!(session = %shared.session_id, "control write failed: {e}");
            }
            writer.take();
            drop(writer);
            shared.shutdown();
            return outcome;
        }
        if shared.closed.load(Ordering::Acquire) {
            writer.take();
        }
        trace!(session = %shared.session_id, command = %msg.command, id = msg.correlation_id, "sent");
        Ok(())
    }

    /// Sends `msg` as a request and waits up to `timeout`, write included,
    /// for its response.
    ///
    /// A response carrying an error string is still returned as `Ok`; the
    /// caller decides what the error means.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::RequestTimeout`] when no response arrives in
    /// time, [`ControlError::ConnectionClosed`] when the session closes
    /// first, or the send error.
    pub async fn request(
        &self,
        mut msg: ControlMessage,
        timeout: Duration,
    ) -> Result<ControlMessage, ControlError> {
        msg.kind = MessageKind::Request;
        msg.correlation_id = self.ids.next();

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(msg.correlation_id, tx);
        let _entry = PendingEntry {
            shared: self.shared.as_ref(),
            correlation_id: msg.correlation_id,
        };
        // shutdown() may have drained the map just before the insert.
        if self.is_closed() {
            return Err(ControlError::ConnectionClosed);
        }

        let deadline = Instant::now() + timeout;
        let sent = match self.send_until(&msg, deadline).await {
            Ok(()) => true,
            Err(ControlError::WriteStalled(_)) => false,
            Err(e) => return Err(e),
        };

        let received = if sent {
            tokio::time::timeout_at(deadline, rx).await.ok()
        } else {
            None
        };
        match received {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(ControlError::ConnectionClosed),
            None => {
                warn!(
                    session = %self.id(),
                    command = %msg.command,
                    id = msg.correlation_id,
                    sent,
                    "request timed out after {timeout:?}"
                );
                Err(ControlError::RequestTimeout {
                    command: msg.command,
                    timeout,
                })
            }
        }
    }

    /// Answers a device-initiated message with a response carrying its
    /// correlation id.
    ///
    /// # Errors
    ///
    /// See [`ControlSession::send`].
    pub async fn reply(
        &self,
        original: &ControlMessage,
        params: Parameters,
        error: Option<String>,
    ) -> Result<(), ControlError> {
        let mut response = ControlMessage::response_to(original);
        response.params = params;
        response.error = error;
        self.send(&response).await
    }

    /// Closes the session once nothing has been read for `period`.
    ///
    /// Re-arming replaces the previous timer.  The clock starts now.
    pub fn arm_idle_timeout(&self, period: Duration) {
        self.shared.touch();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                let idle = shared.idle_for();
                if idle >= period {
                    warn!(session = %shared.session_id, "no data for {idle:?}; closing control session");
                    shared.shutdown();
                    shared.drop_writer();
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(period - idle) => {}
                    _ = shared.wait_closed() => return,
                }
            }
        });
        if let Some(previous) = lock(&self.idle).replace(task) {
            previous.abort();
        }
    }

    /// Closes the socket and fails all pending requests.  Idempotent.
    ///
    /// Never waits on a stalled write; the writer gives up as soon as the
    /// session is marked closed.
    pub async fn close(&self) {
        if self.shared.shutdown() {
            info!(session = %self.id(), "control session closed");
        }
        self.shared.drop_writer();
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.idle).take() {
            task.abort();
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.shared.shutdown();
        self.abort_tasks();
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("id", &self.shared.session_id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ── Reader task ───────────────────────────────────────────────────────────────

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    inbound: mpsc::Sender<ControlMessage>,
) {
    let mut header = [0u8; HEADER_SIZE];
    loop {
        if let Err(e) = reader.read_exact(&mut header).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!(session = %shared.session_id, "control channel closed by peer");
            } else {
                warn!(session = %shared.session_id, "control read error: {e}");
            }
            break;
        }

        let payload_len = match payload_len_from_header(&header) {
            Ok(len) => len,
            Err(e) => {
                // The stream cannot be resynchronised after a bad header.
                warn!(session = %shared.session_id, "bad control header: {e}");
                break;
            }
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload_len);
        frame.extend_from_slice(&header);
        frame.resize(HEADER_SIZE + payload_len, 0);
        if let Err(e) = reader.read_exact(&mut frame[HEADER_SIZE..]).await {
            warn!(session = %shared.session_id, "control payload read error: {e}");
            break;
        }
        shared.touch();

        match decode_message(&frame) {
            Ok((msg, _)) => dispatch(&shared, &inbound, msg),
            Err(e) => warn!(session = %shared.session_id, "dropping undecodable control message: {e}"),
        }
    }

    shared.shutdown();
    shared.drop_writer();
}

fn dispatch(shared: &Shared, inbound: &mpsc::Sender<ControlMessage>, msg: ControlMessage) {
    if msg.is_response() {
        let slot = shared.pending().remove(&msg.correlation_id);
        match slot {
            Some(slot) => {
                let _ = slot.send(Ok(msg));
            }
            None => debug!(
                session = %shared.session_id,
                command = %msg.command,
                id = msg.correlation_id,
                "discarding response with no pending request"
            ),
        }
        return;
    }

    match inbound.try_send(msg) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(msg)) => warn!(
            session = %shared.session_id,
            command = %msg.command,
            "inbound queue full; dropping message"
        ),
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use projection_core::protocol::messages::commands;
    use tokio::net::TcpListener;

    /// A connected session plus the raw device-side socket.
    async fn session_pair() -> (Arc<ControlSession>, mpsc::Receiver<ControlMessage>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (session, inbound) = ControlSession::start(client.unwrap());
        (session, inbound, server.unwrap().0)
    }

    async fn read_one(device: &mut TcpStream) -> ControlMessage {
        let mut header = [0u8; HEADER_SIZE];
        device.read_exact(&mut header).await.unwrap();
        let len = payload_len_from_header(&header).unwrap();
        let mut frame = header.to_vec();
        frame.resize(HEADER_SIZE + len, 0);
        device.read_exact(&mut frame[HEADER_SIZE..]).await.unwrap();
        decode_message(&frame).unwrap().0
    }

    async fn write_one(device: &mut TcpStream, msg: &ControlMessage) {
        device.write_all(&encode_message(msg).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stays_pending_until_close() {
        let (session, _inbound, _device) = session_pair().await;
        let mut closed = tokio_test::task::spawn(session.closed());
        tokio_test::assert_pending!(closed.poll());

        session.close().await;

        assert!(closed.is_woken());
        tokio_test::assert_ready!(closed.poll());
    }

    #[tokio::test]
    async fn test_request_resolves_with_matching_response() {
        // Arrange
        let (session, _inbound, mut device) = session_pair().await;

        // Act
        let requester = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .request(ControlMessage::request("ping"), Duration::from_secs(2))
                    .await
            })
        };
        let req = read_one(&mut device).await;
        write_one(&mut device, &ControlMessage::response_to(&req).with_param("ok", true)).await;
        let response = requester.await.unwrap().unwrap();

        // Assert
        assert_eq!(response.correlation_id, req.correlation_id);
        assert_eq!(response.params.get_bool("ok"), Some(true));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out_and_leaves_no_pending_entry() {
        let (session, _inbound, _device) = session_pair().await;
        let started = std::time::Instant::now();

        let result = session
            .request(ControlMessage::request("ping"), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ControlError::RequestTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_discarded() {
        let (session, mut inbound, mut device) = session_pair().await;

        let result = session
            .request(ControlMessage::request("ping"), Duration::from_millis(50))
            .await;
        assert!(result.is_err());
        let req = read_one(&mut device).await;
        write_one(&mut device, &ControlMessage::response_to(&req)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!session.is_closed());
        assert!(inbound.try_recv().is_err(), "responses never reach the inbound channel");
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (session, _inbound, _device) = session_pair().await;
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session
                        .request(ControlMessage::request("slow"), Duration::from_secs(5))
                        .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.close().await;

        for w in waiters {
            assert!(matches!(w.await.unwrap(), Err(ControlError::ConnectionClosed)));
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_eof_closes_session_and_fails_pending() {
        let (session, _inbound, device) = session_pair().await;
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .request(ControlMessage::request("slow"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(device);

        assert!(matches!(waiter.await.unwrap(), Err(ControlError::ConnectionClosed)));
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("session should report closed");
    }

    #[tokio::test]
    async fn test_device_notifications_reach_inbound_channel() {
        let (_session, mut inbound, mut device) = session_pair().await;

        write_one(&mut device, &ControlMessage::notification(commands::HEARTBEAT)).await;

        let msg = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.command, commands::HEARTBEAT);
    }

    #[tokio::test]
    async fn test_reply_echoes_correlation_id() {
        let (session, _inbound, mut device) = session_pair().await;
        let mut original = ControlMessage::request("query");
        original.correlation_id = 99;

        let mut params = Parameters::new();
        params.set("errorType", 1);
        session
            .reply(&original, params, Some("device is offline".to_string()))
            .await
            .unwrap();

        let reply = read_one(&mut device).await;
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.correlation_id, 99);
        assert_eq!(reply.error.as_deref(), Some("device is offline"));
    }

    #[tokio::test]
    async fn test_send_on_closed_session_fails() {
        let (session, _inbound, _device) = session_pair().await;
        session.close().await;
        let result = session.send(&ControlMessage::notification("x")).await;
        assert!(matches!(result, Err(ControlError::ConnectionClosed)));
    }

    /// Sends large notifications until the device's receive buffer and the
    /// local send buffer are both full.
    fn fill_until_blocked(session: &Arc<ControlSession>) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(session);
        let blob = "x".repeat(256 * 1024);
        tokio::spawn(async move {
            let msg = ControlMessage::notification("fill").with_param("blob", blob);
            while session.send(&msg).await.is_ok() {}
        })
    }

    #[tokio::test]
    async fn test_request_and_close_stay_bounded_when_peer_stops_reading() {
        // Arrange: the device accepts the socket and never reads from it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let _device = server.unwrap().0;
        let (session, _inbound) = ControlSession::start_with(client.unwrap(), Duration::from_secs(30));
        let filler = fill_until_blocked(&session);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Act
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            session.request(ControlMessage::request("ping"), Duration::from_millis(100)),
        )
        .await
        .expect("request outlived its own timeout");

        // Assert
        assert!(matches!(result, Err(ControlError::RequestTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.pending_count(), 0);

        tokio::time::timeout(Duration::from_secs(1), session.close())
            .await
            .expect("close waited on the blocked writer");
        assert!(session.is_closed());
        tokio::time::timeout(Duration::from_secs(1), filler)
            .await
            .expect("blocked send was not released by close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_gives_up_after_write_timeout_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let _device = server.unwrap().0;
        let (session, _inbound) =
            ControlSession::start_with(client.unwrap(), Duration::from_millis(200));

        let filler = fill_until_blocked(&session);

        tokio::time::timeout(Duration::from_secs(5), filler)
            .await
            .expect("stalled send never gave up")
            .unwrap();
        assert!(session.is_closed());
        assert!(matches!(
            session.send(&ControlMessage::notification("x")).await,
            Err(ControlError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_silent_session() {
        let (session, _inbound, _device) = session_pair().await;

        session.arm_idle_timeout(Duration::from_millis(100));

        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("idle session should close");
        assert!(session.is_closed());
    }
}
