use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("random number generator failed")]
    Rng,

    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    #[error("key exchange failed: {0}")]
    KeyExchange(&'static str),

    #[error("frame too short: {len} bytes")]
    FrameTooShort { len: usize },

    #[error("frame authentication failed: invalid key or tampered data")]
    FrameAuthentication,

    #[error("malformed frame metadata")]
    MalformedMetadata,

    #[error("frame bound to session {got:?}, expected {expected:?}")]
    SessionMismatch { expected: String, got: String },

    #[error("frame number {got} does not match IV counter {expected}")]
    SequenceMismatch { expected: u32, got: u32 },

    #[error("stale frame number {got}, expected at least {expected}")]
    StaleFrame { expected: u32, got: u32 },

    #[error("frame timestamp {timestamp_ms} outside replay window (last accepted {last_ms})")]
    OutsideReplayWindow { timestamp_ms: u64, last_ms: u64 },

    #[error("frame counter exhausted, session key must be rotated")]
    CounterExhausted,

    #[error("encryption failed")]
    Seal,

    #[error("metadata encoding failed: {0}")]
    Metadata(#[from] postcard::Error),
}

impl CryptoError {
    /// Whether this error came from checking an inbound frame.
    pub fn is_frame_rejection(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::FrameAuthentication
                | Self::MalformedMetadata
                | Self::SessionMismatch { .. }
                | Self::SequenceMismatch { .. }
                | Self::StaleFrame { .. }
                | Self::OutsideReplayWindow { .. }
        )
    }
}
