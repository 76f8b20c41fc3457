//! PeerCall wire protocol.
//!
//! Defines the call signaling messages exchanged between the two endpoints of
//! a call, the control-channel envelopes spoken with the signaling relay, and
//! the length-prefixed JSON framing used on that channel.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
pub use messages::{CallPayload, CallSignalingMessage, ClientMessage, ServerMessage};
pub use types::*;
