//! Wrapping session keys to a peer's identity key.
//!
//! The wrapping key is derived from a static-static X25519 agreement between
//! the sender's and the recipient's identity keys, so a successful unwrap
//! also authenticates the sender. Every wrap uses a fresh salt and nonce and
//! carries both in the payload; no other channel is needed to unwrap.

use hkdf::Hkdf;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, PublicKeyBytes};
use crate::session_key::{SessionKeyMaterial, SESSION_KEY_LEN};

/// HKDF salt size.
pub const WRAP_SALT_LEN: usize = 16;

/// AES-GCM nonce size.
pub const WRAP_NONCE_LEN: usize = 12;

/// Wrapped key size: key plus 16-byte tag.
pub const WRAPPED_KEY_LEN: usize = SESSION_KEY_LEN + 16;

const WRAP_INFO: &[u8] = b"peercall/session-key-wrap/v1";

/// A session key encrypted to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedSessionKey {
    pub salt: [u8; WRAP_SALT_LEN],
    pub nonce: [u8; WRAP_NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl WrappedSessionKey {
    /// Rebuild from wire fields, checking their lengths.
    pub fn from_parts(salt: &[u8], nonce: &[u8], ciphertext: Vec<u8>) -> Result<Self, CryptoError> {
        let salt = salt
            .try_into()
            .map_err(|_| CryptoError::KeyExchange("wrapped key salt must be 16 bytes"))?;
        let nonce = nonce
            .try_into()
            .map_err(|_| CryptoError::KeyExchange("wrapped key nonce must be 12 bytes"))?;
        if ciphertext.len() != WRAPPED_KEY_LEN {
            return Err(CryptoError::KeyExchange("wrapped key has wrong length"));
        }
        Ok(Self {
            salt,
            nonce,
            ciphertext,
        })
    }
}

/// Encrypt `key` to `recipient_public`, bound to `session_id`.
pub fn wrap_session_key(
    own: &IdentityKeyPair,
    recipient_public: &PublicKeyBytes,
    key: &SessionKeyMaterial,
    session_id: &str,
) -> Result<WrappedSessionKey, CryptoError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; WRAP_SALT_LEN];
    rng.fill(&mut salt).map_err(|_| CryptoError::Rng)?;
    let mut nonce = [0u8; WRAP_NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| CryptoError::Rng)?;

    let sender_public = own.public_bytes();
    let aead_key = derive_wrapping_key(own, recipient_public, &salt)?;
    let aad = build_aad(session_id, &sender_public, recipient_public);

    let mut in_out = key.key_bytes().to_vec();
    aead_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(&aad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;

    Ok(WrappedSessionKey {
        salt,
        nonce,
        ciphertext: in_out,
    })
}

/// Recover a session key sent by `sender_public` for `session_id`.
///
/// Fails with [`CryptoError::KeyExchange`] if the payload was not produced by
/// the holder of `sender_public` for this recipient and session.
pub fn unwrap_session_key(
    own: &IdentityKeyPair,
    sender_public: &PublicKeyBytes,
    wrapped: &WrappedSessionKey,
    session_id: &str,
) -> Result<SessionKeyMaterial, CryptoError> {
    if wrapped.ciphertext.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::KeyExchange("wrapped key has wrong length"));
    }

    let recipient_public = own.public_bytes();
    let aead_key = derive_wrapping_key(own, sender_public, &wrapped.salt)?;
    let aad = build_aad(session_id, sender_public, &recipient_public);

    let mut in_out = Zeroizing::new(wrapped.ciphertext.clone());
    let plaintext = aead_key
        .open_in_place(
            Nonce::assume_unique_for_key(wrapped.nonce),
            Aad::from(&aad),
            &mut in_out[..],
        )
        .map_err(|_| CryptoError::KeyExchange("wrapped key failed authentication"))?;

    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(plaintext);
    let material = SessionKeyMaterial::from_key(key);
    zeroize::Zeroize::zeroize(&mut key);
    Ok(material)
}

fn derive_wrapping_key(
    own: &IdentityKeyPair,
    peer_public: &PublicKeyBytes,
    salt: &[u8; WRAP_SALT_LEN],
) -> Result<LessSafeKey, CryptoError> {
    let shared = own.agree(peer_public)?;
    let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_INFO, &mut okm[..])
        .map_err(|_| CryptoError::InvalidKey("HKDF output length"))?;
    let unbound = UnboundKey::new(&AES_256_GCM, &okm[..])
        .map_err(|_| CryptoError::InvalidKey("AES-256-GCM key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// AAD = session id ‖ sender public ‖ recipient public. The direction is part
/// of the binding so a payload cannot be reflected back to its sender.
fn build_aad(session_id: &str, sender: &PublicKeyBytes, recipient: &PublicKeyBytes) -> Vec<u8> {
    let mut aad = Vec::with_capacity(session_id.len() + 64);
    aad.extend_from_slice(session_id.as_bytes());
    aad.extend_from_slice(sender);
    aad.extend_from_slice(recipient);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_recovers_key() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let key = SessionKeyMaterial::generate().unwrap();

        let wrapped = wrap_session_key(&alice, &bob.public_bytes(), &key, "call-1").unwrap();
        assert_eq!(wrapped.ciphertext.len(), WRAPPED_KEY_LEN);

        let unwrapped =
            unwrap_session_key(&bob, &alice.public_bytes(), &wrapped, "call-1").unwrap();
        assert_eq!(unwrapped.key_bytes(), key.key_bytes());
        assert_eq!(unwrapped.fingerprint(), key.fingerprint());
    }

    #[test]
    fn wrong_sender_fails() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let key = SessionKeyMaterial::generate().unwrap();

        let wrapped = wrap_session_key(&mallory, &bob.public_bytes(), &key, "call-1").unwrap();
        let result = unwrap_session_key(&bob, &alice.public_bytes(), &wrapped, "call-1");
        assert!(matches!(result, Err(CryptoError::KeyExchange(_))));
    }

    #[test]
    fn wrong_session_fails() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let key = SessionKeyMaterial::generate().unwrap();

        let wrapped = wrap_session_key(&alice, &bob.public_bytes(), &key, "call-1").unwrap();
        let result = unwrap_session_key(&bob, &alice.public_bytes(), &wrapped, "call-2");
        assert!(result.is_err());
    }

    #[test]
    fn reflected_payload_fails() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let key = SessionKeyMaterial::generate().unwrap();

        // Alice wraps for Bob; Alice must not accept it as if Bob had sent it.
        let wrapped = wrap_session_key(&alice, &bob.public_bytes(), &key, "call-1").unwrap();
        let result = unwrap_session_key(&alice, &bob.public_bytes(), &wrapped, "call-1");
        assert!(result.is_err());
    }

    #[test]
    fn tampered_payload_fails() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let key = SessionKeyMaterial::generate().unwrap();

        let mut wrapped = wrap_session_key(&alice, &bob.public_bytes(), &key, "s").unwrap();
        wrapped.ciphertext[0] ^= 0xFF;
        assert!(unwrap_session_key(&bob, &alice.public_bytes(), &wrapped, "s").is_err());
    }

    #[test]
    fn replayed_payload_yields_same_key() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let key = SessionKeyMaterial::generate().unwrap();

        let wrapped = wrap_session_key(&alice, &bob.public_bytes(), &key, "s").unwrap();
        let first = unwrap_session_key(&bob, &alice.public_bytes(), &wrapped, "s").unwrap();
        let second = unwrap_session_key(&bob, &alice.public_bytes(), &wrapped, "s").unwrap();
        assert_eq!(first.key_bytes(), second.key_bytes());
    }

    #[test]
    fn from_parts_checks_lengths() {
        assert!(WrappedSessionKey::from_parts(&[0; 16], &[0; 12], vec![0; 48]).is_ok());
        assert!(WrappedSessionKey::from_parts(&[0; 15], &[0; 12], vec![0; 48]).is_err());
        assert!(WrappedSessionKey::from_parts(&[0; 16], &[0; 11], vec![0; 48]).is_err());
        assert!(WrappedSessionKey::from_parts(&[0; 16], &[0; 12], vec![0; 32]).is_err());
    }
}
