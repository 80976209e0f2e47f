//! # projection-core
//!
//! Shared library for the projection controller containing the device domain
//! types and the control-channel protocol codec.
//!
//! It has zero dependencies on sockets, async runtimes, or OS APIs.  Everything
//! here can be unit tested with plain byte slices.
//!
//! # Architecture overview (for beginners)
//!
//! The controller talks to an on-device helper process over two independent
//! TCP connections:
//!
//! - the **control channel**, a request/response protocol with notifications,
//!   and
//! - the **image channel**, a continuous stream of length-prefixed frames.
//!
//! This crate defines:
//!
//! - **`domain`** – What a device *is*: its metadata, the USB or wireless
//!   transport handles it can be reached through, and the two channel kinds.
//!
//! - **`protocol`** – How control messages travel over the wire.  Messages are
//!   encoded into a compact binary format (16-byte header + payload) and
//!   decoded back into typed Rust structs on the other end.

pub mod domain;
pub mod protocol;

pub use domain::device::{ChannelKind, DeviceId, DeviceMeta, TransportHandle, TransportKind};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::{ControlMessage, MessageKind, ParamValue, Parameters};
