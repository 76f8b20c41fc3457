use peercall_crypto::CryptoError;
use peercall_protocol::{ProtocolError, UserId};
use thiserror::Error;

use crate::events::CallState;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("frame rejected: {0}")]
    FrameAuthentication(#[source] CryptoError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("a call with user {0} is already in progress")]
    SessionExists(UserId),

    #[error("no call with user {0}")]
    NoSession(UserId),

    #[error("cannot {operation} while call with user {user_id} is {state:?}")]
    InvalidState {
        user_id: UserId,
        state: CallState,
        operation: &'static str,
    },

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl From<CryptoError> for CallError {
    fn from(e: CryptoError) -> Self {
        if e.is_frame_rejection() {
            Self::FrameAuthentication(e)
        } else {
            Self::KeyExchange(e.to_string())
        }
    }
}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        Self::Signaling(e.to_string())
    }
}
