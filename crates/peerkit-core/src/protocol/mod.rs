//! Protocol module containing the event payloads and the JSON envelope codec.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_event, encode_event, event_name, ProtocolError};
pub use messages::*;
pub use sequence::ProbeNonces;
