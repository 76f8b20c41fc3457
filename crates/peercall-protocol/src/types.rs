use serde::{Deserialize, Serialize};

/// Unique user identifier assigned by the relay upon authentication.
pub type UserId = u32;

/// Sender id placed on every outbound signal. The relay overwrites it with the
/// authenticated sender before forwarding.
pub const UNSTAMPED_USER_ID: UserId = 0;

/// A STUN/TURN server entry handed to the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN entry.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Whether an SDP blob is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP session description. Never encrypted by PeerCall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Payload of `call_invite`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteData {
    /// Display name of the caller.
    pub username: String,
    /// Identifier of this call attempt, bound into every encrypted frame.
    pub session_id: String,
    /// Whether the caller intends to start with camera video.
    #[serde(default)]
    pub video: bool,
}

/// A session key wrapped to the recipient's identity key.
///
/// Binary fields travel as standard base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// HKDF salt (16 bytes).
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    /// AES-GCM nonce (12 bytes).
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Encrypted 32-byte key plus 16-byte tag.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Serde adapter encoding byte vectors as base64 strings in JSON.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn ice_candidate_optional_fields_default() {
        let candidate: IceCandidate =
            serde_json::from_str(r#"{"candidate":"candidate:2"}"#).unwrap();
        assert!(candidate.sdp_mid.is_none());
        assert!(candidate.sdp_m_line_index.is_none());
    }

    #[test]
    fn wrapped_key_binary_fields_are_base64() {
        let wrapped = WrappedKey {
            salt: vec![0xFF; 16],
            nonce: vec![0x00; 12],
            ciphertext: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&wrapped).unwrap();
        assert_eq!(json["ciphertext"], "AQID");
        let decoded: WrappedKey = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, wrapped);
    }

    #[test]
    fn wrapped_key_rejects_invalid_base64() {
        let result: Result<WrappedKey, _> =
            serde_json::from_str(r#"{"salt":"!!","nonce":"","ciphertext":""}"#);
        assert!(result.is_err());
    }

    #[test]
    fn stun_server_has_no_credentials() {
        let server = IceServer::stun("stun:stun.example.org:3478");
        let json = serde_json::to_string(&server).unwrap();
        assert_eq!(json, r#"{"urls":["stun:stun.example.org:3478"]}"#);
    }
}
