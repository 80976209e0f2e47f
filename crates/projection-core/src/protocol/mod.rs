//! Protocol module containing control message types and the binary codec.

pub mod codec;
pub mod correlation;
pub mod messages;

pub use codec::{decode_message, encode_message, payload_len_from_header, ProtocolError};
pub use correlation::CorrelationIdGenerator;
pub use messages::*;
