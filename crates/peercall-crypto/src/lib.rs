//! PeerCall cryptographic layer: session keys and media frame encryption.
//!
//! This crate provides:
//! - Long-term X25519 identity keys
//! - Per-call 256-bit session keys with short human-verifiable fingerprints
//! - Wrapping of session keys to a recipient's identity key (ECDH + HKDF + AES-256-GCM)
//! - Per-frame AES-256-GCM encryption with sequence and replay-window checks

pub mod error;
pub mod frame;
pub mod identity;
pub mod session_key;
pub mod wrap;

pub use error::CryptoError;
pub use frame::{
    FrameDecryptor, FrameEncryptor, FrameMetadata, FrameTransform, TransformDirection,
    REPLAY_WINDOW_MS,
};
pub use identity::{public_key_from_bytes, IdentityKeyPair, PublicKeyBytes};
pub use session_key::SessionKeyMaterial;
pub use wrap::{unwrap_session_key, wrap_session_key, WrappedSessionKey};
