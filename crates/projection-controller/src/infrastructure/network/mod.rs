//! Network infrastructure for the controller.
//!
//! # Sub-modules
//!
//! - **`port_forward`** – Reserves one loopback port per device and channel
//!   kind and asks the bridge to tunnel it to the device over USB.
//!
//! - **`dial`** – TCP connects with a hard timeout, plus a readiness probe
//!   used while the on-device agent starts.
//!
//! - **`control_session`** – The control channel: correlated
//!   request/response over one socket, device-initiated messages, idle
//!   timeout.
//!
//! - **`image_session`** – Per-device frame consumers and the registry the
//!   draining task routes frames through.
//!
//! - **`image_stream`** – The frame-draining task for the image channel.

pub mod control_session;
pub mod dial;
pub mod image_session;
pub mod image_stream;
pub mod port_forward;
