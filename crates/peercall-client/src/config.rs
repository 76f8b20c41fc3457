use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables for call setup, key management and frame protection.
///
/// Loaded from TOML or JSON; every field has a default so partial files work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Delay between receiving `call_accept` and sending the first offer.
    #[serde(default = "default_accept_offer_delay_ms")]
    pub accept_offer_delay_ms: u64,

    /// Session key rotation interval while a call is active (initiator only).
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,

    /// End the call if no key is installed this long after it becomes active.
    /// `None` disables the check.
    #[serde(default = "default_key_exchange_timeout_secs")]
    pub key_exchange_timeout_secs: Option<u64>,

    /// Upper bound on camera/microphone/screen acquisition. `None` waits forever.
    #[serde(default)]
    pub media_timeout_ms: Option<u64>,

    /// Upper bound on fetching a peer's identity key. `None` waits forever.
    #[serde(default)]
    pub public_key_timeout_ms: Option<u64>,

    /// Frames older than this relative to the newest accepted frame are dropped.
    #[serde(default = "default_replay_window_ms")]
    pub replay_window_ms: u64,

    /// Used when the ICE server list cannot be fetched.
    #[serde(default = "default_fallback_stun_url")]
    pub fallback_stun_url: String,

    /// Keep ICE candidates that arrive before their call exists instead of
    /// dropping them.
    #[serde(default)]
    pub buffer_early_candidates: bool,

    /// End the call after this many consecutive rejected frames on one track.
    #[serde(default)]
    pub frame_failure_threshold: Option<u32>,

    /// Timeout for request/response exchanges with the relay.
    #[serde(default = "default_relay_request_timeout_ms")]
    pub relay_request_timeout_ms: u64,
}

fn default_accept_offer_delay_ms() -> u64 {
    500
}

fn default_rotation_interval_secs() -> u64 {
    600
}

fn default_key_exchange_timeout_secs() -> Option<u64> {
    Some(15)
}

fn default_replay_window_ms() -> u64 {
    peercall_crypto::REPLAY_WINDOW_MS
}

fn default_fallback_stun_url() -> String {
    "stun:stun.l.google.com:19302".into()
}

fn default_relay_request_timeout_ms() -> u64 {
    10_000
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            accept_offer_delay_ms: default_accept_offer_delay_ms(),
            rotation_interval_secs: default_rotation_interval_secs(),
            key_exchange_timeout_secs: default_key_exchange_timeout_secs(),
            media_timeout_ms: None,
            public_key_timeout_ms: None,
            replay_window_ms: default_replay_window_ms(),
            fallback_stun_url: default_fallback_stun_url(),
            buffer_early_candidates: false,
            frame_failure_threshold: None,
            relay_request_timeout_ms: default_relay_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

impl CallConfig {
    /// Load from a `.json` file, or TOML for any other extension.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    pub fn accept_offer_delay(&self) -> Duration {
        Duration::from_millis(self.accept_offer_delay_ms)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn key_exchange_timeout(&self) -> Option<Duration> {
        self.key_exchange_timeout_secs.map(Duration::from_secs)
    }

    pub fn media_timeout(&self) -> Option<Duration> {
        self.media_timeout_ms.map(Duration::from_millis)
    }

    pub fn public_key_timeout(&self) -> Option<Duration> {
        self.public_key_timeout_ms.map(Duration::from_millis)
    }

    pub fn relay_request_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CallConfig::default();
        assert_eq!(config.accept_offer_delay(), Duration::from_millis(500));
        assert_eq!(config.rotation_interval(), Duration::from_secs(600));
        assert_eq!(config.key_exchange_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.replay_window_ms, 5_000);
        assert!(config.media_timeout().is_none());
        assert!(config.public_key_timeout().is_none());
        assert!(!config.buffer_early_candidates);
        assert!(config.frame_failure_threshold.is_none());
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            rotation_interval_secs = 120
            media_timeout_ms = 3000
            buffer_early_candidates = true
            frame_failure_threshold = 50
        "#;
        let config: CallConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.rotation_interval_secs, 120);
        assert_eq!(config.media_timeout(), Some(Duration::from_secs(3)));
        assert!(config.buffer_early_candidates);
        assert_eq!(config.frame_failure_threshold, Some(50));
        // Untouched fields keep their defaults.
        assert_eq!(config.accept_offer_delay_ms, 500);
    }

    #[test]
    fn config_json_deserialization() {
        let json = r#"{ "key_exchange_timeout_secs": null, "replay_window_ms": 2000 }"#;
        let config: CallConfig = serde_json::from_str(json).unwrap();
        assert!(config.key_exchange_timeout().is_none());
        assert_eq!(config.replay_window_ms, 2_000);
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = std::env::temp_dir().join(format!("peercall-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let json_path = dir.join("call.json");
        std::fs::write(&json_path, r#"{ "accept_offer_delay_ms": 10 }"#).unwrap();
        assert_eq!(CallConfig::load_from_file(&json_path).unwrap().accept_offer_delay_ms, 10);

        let toml_path = dir.join("call.toml");
        std::fs::write(&toml_path, "accept_offer_delay_ms = 20\n").unwrap();
        assert_eq!(CallConfig::load_from_file(&toml_path).unwrap().accept_offer_delay_ms, 20);

        assert!(matches!(
            CallConfig::load_from_file(&dir.join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
