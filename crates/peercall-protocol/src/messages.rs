use serde::{Deserialize, Serialize};

use crate::types::*;

/// A call signaling message exchanged between the two endpoints of a call.
///
/// JSON shape: `{"type": "call_offer", "fromUserId": 0, "toUserId": 7,
/// "data": {...}, "sessionKeyHash": "..."}`. Variants without a payload omit
/// `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignalingMessage {
    /// Always [`UNSTAMPED_USER_ID`] when sent; stamped by the relay.
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    #[serde(flatten)]
    pub payload: CallPayload,
    /// Hex fingerprint of the session key carried by `call_session_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_hash: Option<String>,
}

impl CallSignalingMessage {
    /// Build an outbound message addressed to `to_user_id`.
    pub fn outbound(to_user_id: UserId, payload: CallPayload) -> Self {
        Self {
            from_user_id: UNSTAMPED_USER_ID,
            to_user_id,
            payload,
            session_key_hash: None,
        }
    }

    /// Wire name of the payload variant, for logging.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Variant-specific payload of a [`CallSignalingMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CallPayload {
    /// Caller rings the callee.
    #[serde(rename = "call_invite")]
    Invite(InviteData),
    /// Callee picked up; the caller answers with an offer.
    #[serde(rename = "call_accept")]
    Accept,
    /// Callee declined.
    #[serde(rename = "call_reject")]
    Reject,
    #[serde(rename = "call_offer")]
    Offer(SessionDescription),
    #[serde(rename = "call_answer")]
    Answer(SessionDescription),
    #[serde(rename = "call_ice_candidate")]
    IceCandidate(IceCandidate),
    /// Either side hung up, or the transport failed.
    #[serde(rename = "call_end")]
    End,
    /// A fresh session key wrapped to the recipient.
    #[serde(rename = "call_session_key")]
    SessionKey(WrappedKey),
    /// Camera video is about to be enabled (`true`) or was disabled.
    #[serde(rename = "call_video_toggle")]
    VideoToggle(bool),
    /// Screen share is about to be enabled (`true`) or was disabled.
    #[serde(rename = "call_screen_share_toggle")]
    ScreenShareToggle(bool),
}

impl CallPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invite(_) => "call_invite",
            Self::Accept => "call_accept",
            Self::Reject => "call_reject",
            Self::Offer(_) => "call_offer",
            Self::Answer(_) => "call_answer",
            Self::IceCandidate(_) => "call_ice_candidate",
            Self::End => "call_end",
            Self::SessionKey(_) => "call_session_key",
            Self::VideoToggle(_) => "call_video_toggle",
            Self::ScreenShareToggle(_) => "call_screen_share_toggle",
        }
    }
}

/// Messages sent from a client to the relay over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a fresh connection.
    Authenticate {
        username: String,
        protocol_version: u32,
        /// 32-byte X25519 identity public key.
        #[serde(with = "base64_bytes")]
        identity_key: Vec<u8>,
    },

    /// Ask for the ICE server list to configure a new transport.
    RequestIceServers,

    /// Ask for another user's current identity public key.
    RequestPublicKey { user_id: UserId },

    /// Forward a call signal to `message.to_user_id`.
    Signal { message: CallSignalingMessage },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Client is disconnecting gracefully.
    Disconnect,
}

/// Messages sent from the relay to a client over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication succeeded.
    Authenticated { user_id: UserId },

    /// Authentication failed; the connection is closed afterwards.
    AuthError { reason: String },

    /// Response to `RequestIceServers`.
    IceServers { servers: Vec<IceServer> },

    /// Response to `RequestPublicKey`.
    PublicKey {
        user_id: UserId,
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },

    /// The requested user is not connected.
    PublicKeyUnavailable { user_id: UserId },

    /// A call signal from another user, with `from_user_id` stamped.
    Signal { message: CallSignalingMessage },

    /// The recipient of a forwarded signal is not connected.
    SignalUndeliverable { to_user_id: UserId },

    /// Pong response for latency measurement.
    Pong { timestamp: u64 },

    /// Relay is shutting down.
    ServerShutdown { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_json_shape() {
        let msg = CallSignalingMessage::outbound(
            7,
            CallPayload::Offer(SessionDescription::offer("v=0")),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "call_offer");
        assert_eq!(json["fromUserId"], 0);
        assert_eq!(json["toUserId"], 7);
        assert_eq!(json["data"]["type"], "offer");
        assert_eq!(json["data"]["sdp"], "v=0");
        assert!(json.get("sessionKeyHash").is_none());
    }

    #[test]
    fn unit_variants_omit_data() {
        let msg = CallSignalingMessage::outbound(3, CallPayload::Accept);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "call_accept");
        assert!(json.get("data").is_none());

        let parsed: CallSignalingMessage =
            serde_json::from_str(r#"{"type":"call_end","fromUserId":4,"toUserId":9}"#).unwrap();
        assert_eq!(parsed.payload, CallPayload::End);
        assert_eq!(parsed.from_user_id, 4);
    }

    #[test]
    fn parses_toggle_and_key_hash() {
        let parsed: CallSignalingMessage = serde_json::from_str(
            r#"{"type":"call_screen_share_toggle","fromUserId":2,"toUserId":1,"data":true}"#,
        )
        .unwrap();
        assert_eq!(parsed.payload, CallPayload::ScreenShareToggle(true));

        let msg = CallSignalingMessage {
            from_user_id: 0,
            to_user_id: 1,
            payload: CallPayload::SessionKey(WrappedKey {
                salt: vec![1; 16],
                nonce: vec![2; 12],
                ciphertext: vec![3; 48],
            }),
            session_key_hash: Some("deadbeef".into()),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: CallSignalingMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result: Result<CallSignalingMessage, _> =
            serde_json::from_str(r#"{"type":"call_poke","fromUserId":1,"toUserId":2}"#);
        assert!(result.is_err());
    }

    #[test]
    fn invite_carries_session_id() {
        let parsed: CallSignalingMessage = serde_json::from_str(
            r#"{"type":"call_invite","fromUserId":5,"toUserId":6,
                "data":{"username":"alice","sessionId":"abc-123"}}"#,
        )
        .unwrap();
        match parsed.payload {
            CallPayload::Invite(invite) => {
                assert_eq!(invite.username, "alice");
                assert_eq!(invite.session_id, "abc-123");
                assert!(!invite.video);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn control_envelope_tagging() {
        let msg = ClientMessage::RequestPublicKey { user_id: 12 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "request_public_key");
        assert_eq!(json["user_id"], 12);

        let msg = ServerMessage::Signal {
            message: CallSignalingMessage::outbound(1, CallPayload::VideoToggle(false)),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "signal");
        assert_eq!(json["message"]["type"], "call_video_toggle");
        assert_eq!(json["message"]["data"], false);
    }
}
