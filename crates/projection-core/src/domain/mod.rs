//! Domain layer: pure device types with no I/O.
//!
//! # Sub-modules
//!
//! - **`device`** – Device identity and metadata, transport handles (USB or
//!   wireless), and the channel kinds a device exposes.

pub mod device;
