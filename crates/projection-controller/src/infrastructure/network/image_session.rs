//! Image sessions: where streamed frames for a device are delivered.
//!
//! The frame-draining task does not know who consumes frames.  It looks the
//! device up in the shared [`ImageSessionRegistry`] for every frame and hands
//! the bytes to whichever [`ImageSession`] is registered at that moment.  At
//! most one session is registered per `(kind, device)`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use projection_core::DeviceId;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};
use uuid::Uuid;

/// Consumer role of an image session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSessionKind {
    /// The controller's own viewer.
    Controller,
}

/// Registry key of an image session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageSessionId {
    pub kind: ImageSessionKind,
    pub device_id: DeviceId,
}

impl ImageSessionId {
    pub fn controller(device_id: impl Into<DeviceId>) -> Self {
        Self {
            kind: ImageSessionKind::Controller,
            device_id: device_id.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageSessionError {
    #[error("image session is closed")]
    Closed,
    /// The consumer is behind; this frame was dropped.
    #[error("image sink full; frame dropped")]
    SinkFull,
}

/// A per-device frame consumer.
pub trait ImageSession: Send + Sync {
    fn key(&self) -> &ImageSessionId;

    /// Distinguishes successive sessions registered under the same key.
    fn session_id(&self) -> Uuid;

    /// Delivers one complete frame.
    fn write_image_data(&self, frame: Bytes) -> Result<(), ImageSessionError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Session forwarding frames into a bounded channel read by the viewer.
///
/// When the viewer falls behind, new frames are dropped rather than queued:
/// a stale frame is worth nothing once a newer one exists.
#[derive(Debug)]
pub struct ControllerImageSession {
    key: ImageSessionId,
    session_id: Uuid,
    sink: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ControllerImageSession {
    pub fn new(device_id: impl Into<DeviceId>, sink: mpsc::Sender<Bytes>) -> Self {
        Self {
            key: ImageSessionId::controller(device_id),
            session_id: Uuid::new_v4(),
            sink,
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ImageSession for ControllerImageSession {
    fn key(&self) -> &ImageSessionId {
        &self.key
    }

    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn write_image_data(&self, frame: Bytes) -> Result<(), ImageSessionError> {
        if self.is_closed() {
            return Err(ImageSessionError::Closed);
        }
        match self.sink.try_send(frame) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ImageSessionError::SinkFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ImageSessionError::Closed)
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(
                device = %self.key.device_id,
                delivered = self.frames_delivered(),
                dropped = self.frames_dropped(),
                "image session closed"
            );
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Shared `(kind, device) → session` map.
#[derive(Default)]
pub struct ImageSessionRegistry {
    sessions: DashMap<ImageSessionId, Arc<dyn ImageSession>>,
}

impl ImageSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session`, replacing any session under the same key.
    ///
    /// Returns the replaced session.  Closing it is the caller's business.
    pub fn add_session(&self, session: Arc<dyn ImageSession>) -> Option<Arc<dyn ImageSession>> {
        info!(
            device = %session.key().device_id,
            session = %session.session_id(),
            "image session registered"
        );
        self.sessions.insert(session.key().clone(), session)
    }

    /// Removes and closes the controller session of `device_id`, but only if
    /// it is still the instance identified by `session_id`.
    pub fn remove_session(&self, device_id: &str, session_id: Uuid) -> bool {
        let key = ImageSessionId::controller(device_id);
        match self.sessions.remove_if(&key, |_, s| s.session_id() == session_id) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// The controller session registered for `device_id`.
    pub fn get(&self, device_id: &str) -> Option<Arc<dyn ImageSession>> {
        self.sessions
            .get(&ImageSessionId::controller(device_id))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
