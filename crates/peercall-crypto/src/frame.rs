//! Per-frame AES-256-GCM encryption for encoded media frames.
//!
//! Wire format of an encrypted frame:
//! ```text
//! [iv_base: 8] [counter: u32 BE] [AEAD(metadata ‖ payload) + 16-byte tag]
//! ```
//! The metadata (`frame_number`, `timestamp_ms`, `session_id`) sits inside the
//! ciphertext, so it is authenticated together with the payload. Each
//! attachment (one track, one direction) owns its own transform; counters are
//! never shared across tracks.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::CryptoError;
use crate::session_key::SessionKeyMaterial;

/// Random per-attachment IV prefix.
pub const IV_BASE_LEN: usize = 8;

/// Full AES-GCM nonce: IV base plus 32-bit counter.
pub const IV_LEN: usize = 12;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

/// Smallest possible encrypted frame.
pub const MIN_FRAME_LEN: usize = IV_LEN + GCM_TAG_SIZE;

/// Maximum age of a frame relative to the newest accepted one.
pub const REPLAY_WINDOW_MS: u64 = 5_000;

/// Authenticated metadata bound to every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub frame_number: u32,
    pub timestamp_ms: u64,
    pub session_id: String,
}

fn aead_key(key: &SessionKeyMaterial) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.key_bytes())
        .map_err(|_| CryptoError::InvalidKey("AES-256-GCM key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn build_iv(iv_base: &[u8; IV_BASE_LEN], counter: u32) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[..IV_BASE_LEN].copy_from_slice(iv_base);
    iv[IV_BASE_LEN..].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// Sender-side transform: seals outgoing frames.
pub struct FrameEncryptor {
    key: LessSafeKey,
    fingerprint: [u8; 4],
    iv_base: [u8; IV_BASE_LEN],
    counter: u32,
    session_id: String,
}

impl FrameEncryptor {
    /// Create an encryptor with a fresh random IV base and counter 0.
    pub fn new(key: &SessionKeyMaterial, session_id: impl Into<String>) -> Result<Self, CryptoError> {
        let mut iv_base = [0u8; IV_BASE_LEN];
        SystemRandom::new()
            .fill(&mut iv_base)
            .map_err(|_| CryptoError::Rng)?;
        Ok(Self {
            key: aead_key(key)?,
            fingerprint: key.fingerprint(),
            iv_base,
            counter: 0,
            session_id: session_id.into(),
        })
    }

    /// Number of frames sealed so far (also the next frame number).
    pub fn frames_sealed(&self) -> u32 {
        self.counter
    }

    pub fn key_fingerprint(&self) -> [u8; 4] {
        self.fingerprint
    }

    /// Seal one encoded frame.
    ///
    /// The counter advances even if sealing fails, so an IV is never reused.
    pub fn encrypt(&mut self, payload: &[u8], timestamp_ms: u64) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u32::MAX {
            return Err(CryptoError::CounterExhausted);
        }
        let frame_number = self.counter;
        self.counter += 1;

        let iv = build_iv(&self.iv_base, frame_number);
        let metadata = FrameMetadata {
            frame_number,
            timestamp_ms,
            session_id: self.session_id.clone(),
        };

        let mut in_out = postcard::to_allocvec(&metadata)?;
        in_out.extend_from_slice(payload);
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;

        let mut frame = Vec::with_capacity(IV_LEN + in_out.len());
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&in_out);
        Ok(frame)
    }
}

/// Receiver-side transform: opens incoming frames and enforces ordering.
pub struct FrameDecryptor {
    key: LessSafeKey,
    fingerprint: [u8; 4],
    session_id: String,
    replay_window_ms: u64,
    expected_frame: u32,
    last_timestamp_ms: Option<u64>,
    consecutive_failures: u32,
}

impl FrameDecryptor {
    pub fn new(key: &SessionKeyMaterial, session_id: impl Into<String>) -> Result<Self, CryptoError> {
        Ok(Self {
            key: aead_key(key)?,
            fingerprint: key.fingerprint(),
            session_id: session_id.into(),
            replay_window_ms: REPLAY_WINDOW_MS,
            expected_frame: 0,
            last_timestamp_ms: None,
            consecutive_failures: 0,
        })
    }

    /// Override the replay window (default [`REPLAY_WINDOW_MS`]).
    pub fn with_replay_window(mut self, window_ms: u64) -> Self {
        self.replay_window_ms = window_ms;
        self
    }

    pub fn key_fingerprint(&self) -> [u8; 4] {
        self.fingerprint
    }

    /// Frames rejected since the last accepted one.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Open one encrypted frame and return the encoded payload.
    ///
    /// Any failure rejects the frame; nothing is ever passed through
    /// unverified.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.open(frame) {
            Ok(payload) => {
                self.consecutive_failures = 0;
                Ok(payload)
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                trace!(
                    session_id = %self.session_id,
                    consecutive_failures = self.consecutive_failures,
                    "frame rejected: {e}"
                );
                Err(e)
            }
        }
    }

    fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(CryptoError::FrameTooShort { len: frame.len() });
        }

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&frame[..IV_LEN]);
        let iv_counter = u32::from_be_bytes([iv[8], iv[9], iv[10], iv[11]]);

        let mut in_out = frame[IV_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::FrameAuthentication)?;

        let (metadata, payload): (FrameMetadata, &[u8]) =
            postcard::take_from_bytes(plaintext).map_err(|_| CryptoError::MalformedMetadata)?;

        if metadata.session_id != self.session_id {
            return Err(CryptoError::SessionMismatch {
                expected: self.session_id.clone(),
                got: metadata.session_id,
            });
        }
        if metadata.frame_number != iv_counter {
            return Err(CryptoError::SequenceMismatch {
                expected: iv_counter,
                got: metadata.frame_number,
            });
        }
        // Forward gaps are packet loss; going backwards is a replay.
        if metadata.frame_number < self.expected_frame {
            return Err(CryptoError::StaleFrame {
                expected: self.expected_frame,
                got: metadata.frame_number,
            });
        }
        if let Some(last_ms) = self.last_timestamp_ms {
            if metadata.timestamp_ms.saturating_add(self.replay_window_ms) < last_ms {
                return Err(CryptoError::OutsideReplayWindow {
                    timestamp_ms: metadata.timestamp_ms,
                    last_ms,
                });
            }
        }

        self.expected_frame = metadata.frame_number.saturating_add(1);
        self.last_timestamp_ms = Some(
            self.last_timestamp_ms
                .map_or(metadata.timestamp_ms, |last| last.max(metadata.timestamp_ms)),
        );
        Ok(payload.to_vec())
    }
}

/// Direction of a [`FrameTransform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    Encrypt,
    Decrypt,
}

/// A transform bound to one sender or receiver of the media pipeline.
pub enum FrameTransform {
    Encrypt(FrameEncryptor),
    Decrypt(FrameDecryptor),
}

impl FrameTransform {
    /// Run one frame through the transform. `now_ms` stamps outgoing frames.
    pub fn process(&mut self, frame: &[u8], now_ms: u64) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Encrypt(encryptor) => encryptor.encrypt(frame, now_ms),
            Self::Decrypt(decryptor) => decryptor.decrypt(frame),
        }
    }

    pub fn direction(&self) -> TransformDirection {
        match self {
            Self::Encrypt(_) => TransformDirection::Encrypt,
            Self::Decrypt(_) => TransformDirection::Decrypt,
        }
    }

    pub fn key_fingerprint(&self) -> [u8; 4] {
        match self {
            Self::Encrypt(encryptor) => encryptor.key_fingerprint(),
            Self::Decrypt(decryptor) => decryptor.key_fingerprint(),
        }
    }

    /// Consecutive rejected frames (always 0 for encryptors).
    pub fn consecutive_failures(&self) -> u32 {
        match self {
            Self::Encrypt(_) => 0,
            Self::Decrypt(decryptor) => decryptor.consecutive_failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(session_id: &str) -> (FrameEncryptor, FrameDecryptor) {
        let key = SessionKeyMaterial::generate().unwrap();
        (
            FrameEncryptor::new(&key, session_id).unwrap(),
            FrameDecryptor::new(&key, session_id).unwrap(),
        )
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (mut enc, mut dec) = pair("call-1");
        let plaintext = b"opus frame bytes";

        let sealed = enc.encrypt(plaintext, 1_000).unwrap();
        assert_ne!(&sealed[IV_LEN..], plaintext.as_slice());
        assert!(sealed.len() >= plaintext.len() + MIN_FRAME_LEN);

        assert_eq!(dec.decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn iv_layout_is_base_then_counter() {
        let (mut enc, _) = pair("s");
        let first = enc.encrypt(b"a", 0).unwrap();
        let second = enc.encrypt(b"b", 0).unwrap();
        assert_eq!(first[..IV_BASE_LEN], second[..IV_BASE_LEN]);
        assert_eq!(first[IV_BASE_LEN..IV_LEN], [0, 0, 0, 0]);
        assert_eq!(second[IV_BASE_LEN..IV_LEN], [0, 0, 0, 1]);
        assert_eq!(enc.frames_sealed(), 2);
    }

    #[test]
    fn replayed_frame_rejected() {
        let (mut enc, mut dec) = pair("s");
        let first = enc.encrypt(b"one", 1_000).unwrap();
        let second = enc.encrypt(b"two", 1_020).unwrap();

        dec.decrypt(&first).unwrap();
        dec.decrypt(&second).unwrap();
        let result = dec.decrypt(&first);
        assert!(matches!(result, Err(CryptoError::StaleFrame { expected: 2, got: 0 })));
    }

    #[test]
    fn frame_older_than_window_rejected() {
        let (mut enc, mut dec) = pair("s");
        // Captured early, delivered after newer traffic moved 6 s ahead.
        let mut delayed = FrameEncryptor::new(&SessionKeyMaterial::from_key([1; 32]), "s").unwrap();
        let mut delayed_dec = FrameDecryptor::new(&SessionKeyMaterial::from_key([1; 32]), "s").unwrap();
        let old = delayed.encrypt(b"old", 1_000).unwrap();
        let _skipped = delayed.encrypt(b"skip", 1_020).unwrap();
        let fresh = delayed.encrypt(b"new", 7_000).unwrap();
        delayed_dec.decrypt(&fresh).unwrap();
        assert!(delayed_dec.decrypt(&old).is_err());

        // Same frame number sequence but a timestamp beyond the window.
        let a = enc.encrypt(b"a", 10_000).unwrap();
        let b = enc.encrypt(b"b", 4_000).unwrap();
        dec.decrypt(&a).unwrap();
        assert!(matches!(
            dec.decrypt(&b),
            Err(CryptoError::OutsideReplayWindow { timestamp_ms: 4_000, last_ms: 10_000 })
        ));
    }

    #[test]
    fn frames_within_window_accepted_out_of_clock_order() {
        let (mut enc, mut dec) = pair("s");
        let a = enc.encrypt(b"a", 10_000).unwrap();
        let b = enc.encrypt(b"b", 6_000).unwrap();
        dec.decrypt(&a).unwrap();
        assert_eq!(dec.decrypt(&b).unwrap(), b"b");
    }

    #[test]
    fn lost_frames_do_not_block_later_ones() {
        let (mut enc, mut dec) = pair("s");
        let _lost = enc.encrypt(b"0", 0).unwrap();
        let _lost = enc.encrypt(b"1", 20).unwrap();
        let third = enc.encrypt(b"2", 40).unwrap();
        assert_eq!(dec.decrypt(&third).unwrap(), b"2");
    }

    #[test]
    fn wrong_key_fails() {
        let (mut enc, _) = pair("s");
        let (_, mut other) = pair("s");
        let sealed = enc.encrypt(b"secret", 0).unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(CryptoError::FrameAuthentication)));
        assert_eq!(other.consecutive_failures(), 1);
    }

    #[test]
    fn cross_session_frame_rejected() {
        let key = SessionKeyMaterial::generate().unwrap();
        let mut enc = FrameEncryptor::new(&key, "call-a").unwrap();
        let mut dec = FrameDecryptor::new(&key, "call-b").unwrap();
        let sealed = enc.encrypt(b"x", 0).unwrap();
        assert!(matches!(dec.decrypt(&sealed), Err(CryptoError::SessionMismatch { .. })));
    }

    #[test]
    fn tampered_counter_rejected() {
        let (mut enc, mut dec) = pair("s");
        let mut sealed = enc.encrypt(b"x", 0).unwrap();
        sealed[IV_LEN - 1] ^= 0x01;
        // The nonce changed, so authentication fails before metadata is read.
        assert!(matches!(dec.decrypt(&sealed), Err(CryptoError::FrameAuthentication)));
    }

    #[test]
    fn short_frame_rejected() {
        let (_, mut dec) = pair("s");
        assert!(matches!(
            dec.decrypt(&[0u8; MIN_FRAME_LEN - 1]),
            Err(CryptoError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn success_resets_failure_count() {
        let (mut enc, mut dec) = pair("s");
        assert!(dec.decrypt(&[0u8; 40]).is_err());
        assert!(dec.decrypt(&[0u8; 40]).is_err());
        assert_eq!(dec.consecutive_failures(), 2);
        let sealed = enc.encrypt(b"ok", 0).unwrap();
        dec.decrypt(&sealed).unwrap();
        assert_eq!(dec.consecutive_failures(), 0);
    }

    #[test]
    fn transform_enum_dispatch() {
        let key = SessionKeyMaterial::generate().unwrap();
        let mut tx = FrameTransform::Encrypt(FrameEncryptor::new(&key, "s").unwrap());
        let mut rx = FrameTransform::Decrypt(FrameDecryptor::new(&key, "s").unwrap());
        assert_eq!(tx.direction(), TransformDirection::Encrypt);
        assert_eq!(rx.key_fingerprint(), key.fingerprint());

        let sealed = tx.process(b"frame", 123).unwrap();
        assert_eq!(rx.process(&sealed, 999).unwrap(), b"frame");
    }
}
