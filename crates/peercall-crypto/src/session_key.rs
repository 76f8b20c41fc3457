//! Per-call symmetric session keys.
//!
//! A session key encrypts every media frame of one call. It is generated
//! fresh for each call and on each rotation; a new key is never derived from
//! the previous one.

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Session key size (AES-256).
pub const SESSION_KEY_LEN: usize = 32;

/// Fingerprint size: leading bytes of SHA-256(key).
pub const FINGERPRINT_LEN: usize = 4;

/// Emoji alphabet for rendering fingerprints. Indexed by `byte % 64`.
const FINGERPRINT_EMOJI: [&str; 64] = [
    "🐶", "🐱", "🦁", "🐴", "🦄", "🐷", "🐘", "🐰",
    "🐼", "🐓", "🐧", "🐢", "🐟", "🐙", "🦋", "🌷",
    "🌳", "🌵", "🍄", "🌏", "🌙", "☁️", "🔥", "🍌",
    "🍎", "🍓", "🌽", "🍕", "🎂", "❤️", "😀", "🤖",
    "🎩", "👓", "🔧", "🎅", "👍", "☂️", "⌛", "⏰",
    "🎁", "💡", "📕", "✏️", "📎", "✂️", "🔒", "🔑",
    "🔨", "☎️", "🏁", "🚂", "🚲", "✈️", "🚀", "🏆",
    "⚽", "🎸", "🎺", "🔔", "⚓", "🎧", "📁", "📌",
];

/// A session key together with its short fingerprint.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial {
    key: [u8; SESSION_KEY_LEN],
    #[zeroize(skip)]
    fingerprint: [u8; FINGERPRINT_LEN],
}

impl SessionKeyMaterial {
    /// Generate a fresh random session key.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut key = [0u8; SESSION_KEY_LEN];
        rng.fill(&mut key).map_err(|_| CryptoError::Rng)?;
        let material = Self::from_key(key);
        key.zeroize();
        Ok(material)
    }

    /// Wrap existing key bytes (e.g. just unwrapped from a peer).
    pub fn from_key(key: [u8; SESSION_KEY_LEN]) -> Self {
        Self {
            fingerprint: fingerprint_of(&key),
            key,
        }
    }

    pub fn key_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }

    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        self.fingerprint
    }

    /// Fingerprint as 8 lowercase hex characters (the `sessionKeyHash` field).
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Fingerprint rendered as four emoji for out-of-band comparison.
    pub fn fingerprint_emoji(&self) -> String {
        self.fingerprint
            .iter()
            .map(|b| FINGERPRINT_EMOJI[(*b as usize) % FINGERPRINT_EMOJI.len()])
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether a received `sessionKeyHash` matches this key.
    pub fn matches_hash(&self, hash: &str) -> bool {
        self.fingerprint_hex().eq_ignore_ascii_case(hash.trim())
    }
}

impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("fingerprint", &self.fingerprint_hex())
            .finish_non_exhaustive()
    }
}

fn fingerprint_of(key: &[u8; SESSION_KEY_LEN]) -> [u8; FINGERPRINT_LEN] {
    let digest = Sha256::digest(key);
    let mut fingerprint = [0u8; FINGERPRINT_LEN];
    fingerprint.copy_from_slice(&digest[..FINGERPRINT_LEN]);
    fingerprint
}
