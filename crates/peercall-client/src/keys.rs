//! Session key exchange on top of the crypto primitives.
//!
//! The initiator generates each key, wraps it to the responder's identity key
//! and sends it as `call_session_key`; the responder unwraps it with the
//! initiator's identity key. Scheduling (first exchange, rotation, watchdog)
//! is driven by the call manager.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use peercall_crypto::{
    unwrap_session_key, wrap_session_key, IdentityKeyPair, PublicKeyBytes, SessionKeyMaterial,
    WrappedSessionKey,
};
use peercall_protocol::{UserId, WrappedKey};
use tracing::debug;

use crate::directory::Directory;
use crate::error::CallError;

/// Await `future`, bounded by `limit` when one is configured.
pub(crate) async fn with_timeout<T, F>(
    limit: Option<Duration>,
    what: &'static str,
    future: F,
) -> Result<T, CallError>
where
    F: Future<Output = Result<T, CallError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| CallError::Timeout(what))?,
        None => future.await,
    }
}

pub struct KeyManager {
    identity: IdentityKeyPair,
    directory: Arc<dyn Directory>,
    public_key_timeout: Option<Duration>,
}

impl KeyManager {
    pub fn new(
        identity: IdentityKeyPair,
        directory: Arc<dyn Directory>,
        public_key_timeout: Option<Duration>,
    ) -> Self {
        Self {
            identity,
            directory,
            public_key_timeout,
        }
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.identity.public_bytes()
    }

    /// Fetch the peer's current identity key.
    pub async fn peer_key(&self, user_id: UserId) -> Result<PublicKeyBytes, CallError> {
        let key = with_timeout(
            self.public_key_timeout,
            "public key fetch",
            self.directory.fetch_public_key(user_id),
        )
        .await?;
        debug!(user_id, "fetched peer identity key");
        Ok(key)
    }

    /// Fresh key for a call or a rotation. Never derived from a previous key.
    pub fn generate(&self) -> Result<SessionKeyMaterial, CallError> {
        Ok(SessionKeyMaterial::generate()?)
    }

    pub fn seal(
        &self,
        peer_key: &PublicKeyBytes,
        key: &SessionKeyMaterial,
        session_id: &str,
    ) -> Result<WrappedKey, CallError> {
        let wrapped = wrap_session_key(&self.identity, peer_key, key, session_id)?;
        Ok(WrappedKey {
            salt: wrapped.salt.to_vec(),
            nonce: wrapped.nonce.to_vec(),
            ciphertext: wrapped.ciphertext,
        })
    }

    /// Unwrap a received key. When the sender attached a fingerprint it must
    /// match the recovered key.
    pub fn open(
        &self,
        peer_key: &PublicKeyBytes,
        payload: &WrappedKey,
        session_id: &str,
        expected_hash: Option<&str>,
    ) -> Result<SessionKeyMaterial, CallError> {
        let wrapped =
            WrappedSessionKey::from_parts(&payload.salt, &payload.nonce, payload.ciphertext.clone())?;
        let key = unwrap_session_key(&self.identity, peer_key, &wrapped, session_id)?;
        if let Some(hash) = expected_hash {
            if !key.matches_hash(hash) {
                return Err(CallError::KeyExchange(format!(
                    "session key fingerprint mismatch: announced {hash}, got {}",
                    key.fingerprint_hex()
                )));
            }
        }
        Ok(key)
    }
}
