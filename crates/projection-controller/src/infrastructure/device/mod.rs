//! Per-device connections and the registry that owns them.
//!
//! - **`connection`** – [`connection::DeviceConnection`], the control and
//!   image channels of one device plus its USB/wireless fail-over.
//! - **`registry`** – [`registry::ConnectionRegistry`], reacting to
//!   transports appearing and disappearing.

pub mod connection;
pub mod registry;

pub use connection::{ConnectionContext, ConnectionError, DeviceConnection, ImageChannelListener};
pub use registry::ConnectionRegistry;
