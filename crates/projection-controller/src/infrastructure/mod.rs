//! Infrastructure layer for the controller.
//!
//! Contains the adapters that touch the outside world: the device bridge
//! interface, sockets and port forwards, per-device connections, the worker
//! pool, and file-system storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `projection_core`, but MUST NOT be imported by the `application` layer.

pub mod bridge;
pub mod device;
pub mod network;
pub mod storage;
pub mod worker_pool;
