//! Application layer for the controller.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure data types in `projection-core`) and the infrastructure (sockets,
//! port forwards, the device bridge).
//!
//! Code in this layer:
//!
//! - **Decides** what should happen (which transport becomes active, whether a
//!   reconnect is needed, whether a connect attempt may start).
//! - **Contains no socket I/O and no file system access**, so every decision
//!   is unit-testable without a device attached.
//!
//! # Sub-modules
//!
//! - **`channel_state`** – The USB/wireless slot bookkeeping and fail-over
//!   rules, the connect and image sub-state machines, and the atomic
//!   single-flight guard used to drop duplicate connect attempts.
//!
//! - **`events`** – Connection lifecycle events and the fan-out bus that
//!   delivers them to listeners off the network path.

pub mod channel_state;
pub mod events;
