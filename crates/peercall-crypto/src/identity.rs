//! Identity key generation and serialization.
//!
//! Each PeerCall client holds a long-term X25519 identity key pair. The
//! public half is registered with the relay and fetched by peers to wrap
//! session keys; storing the pair across runs is left to the embedder.

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Raw X25519 public key bytes.
pub type PublicKeyBytes = [u8; PUBLIC_KEY_LEN];

/// A long-term X25519 identity key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(&mut OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from its 32-byte private scalar.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Private scalar, for handing to an external key store.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn public_bytes(&self) -> PublicKeyBytes {
        self.public.to_bytes()
    }

    /// X25519 agreement with a peer's public key.
    ///
    /// Rejects low-order peer keys that would yield an all-zero secret.
    pub(crate) fn agree(&self, their_public: &PublicKeyBytes) -> Result<SharedSecret, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchange("peer public key is low-order"));
        }
        Ok(shared)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Parse a public key received over the wire.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKeyBytes, CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("identity public key must be 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_restore() {
        let pair = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(*pair.secret_bytes());
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn agreement_is_symmetric() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let ab = alice.agree(&bob.public_bytes()).unwrap();
        let ba = bob.agree(&alice.public_bytes()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn low_order_key_rejected() {
        let pair = IdentityKeyPair::generate();
        let result = pair.agree(&[0u8; 32]);
        assert!(matches!(result, Err(CryptoError::KeyExchange(_))));
    }

    #[test]
    fn public_key_length_checked() {
        assert!(public_key_from_bytes(&[1u8; 32]).is_ok());
        assert!(matches!(
            public_key_from_bytes(&[1u8; 31]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let pair = IdentityKeyPair::from_secret_bytes([0x42; 32]);
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains("66, 66, 66"));
    }
}
