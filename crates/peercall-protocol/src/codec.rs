use bytes::{Buf, BytesMut};
use serde::Serialize;

use crate::error::ProtocolError;
use crate::messages::{CallSignalingMessage, ClientMessage, ServerMessage};

/// Maximum control-channel message size: 64 KiB.
pub const MAX_MSG_SIZE: u32 = 65_536;

/// Current control-channel protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

fn encode_framed<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encode a `ClientMessage` into a length-prefixed byte buffer.
pub fn encode_client_msg(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    encode_framed(msg)
}

/// Decode a `ClientMessage` from a JSON payload (without length prefix).
pub fn decode_client_msg(payload: &[u8]) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode a `ServerMessage` into a length-prefixed byte buffer.
pub fn encode_server_msg(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    encode_framed(msg)
}

/// Decode a `ServerMessage` from a JSON payload (without length prefix).
pub fn decode_server_msg(payload: &[u8]) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Serialize a bare call signal to JSON, for transports other than the relay.
pub fn encode_signal(msg: &CallSignalingMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parse a bare call signal from JSON.
pub fn decode_signal(text: &str) -> Result<CallSignalingMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CallPayload;
    use crate::types::IceCandidate;

    #[test]
    fn authenticate_roundtrip() {
        let msg = ClientMessage::Authenticate {
            username: "alice".into(),
            protocol_version: PROTOCOL_VERSION,
            identity_key: vec![9u8; 32],
        };
        let encoded = encode_client_msg(&msg).unwrap();
        // Skip the 4-byte length prefix
        let decoded = decode_client_msg(&encoded[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn frame_decoding() {
        let msg = ClientMessage::Ping { timestamp: 12345 };
        let encoded = encode_client_msg(&msg).unwrap();

        let mut buf = BytesMut::new();

        // Partial data, should return None
        buf.extend_from_slice(&encoded[..3]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        // Complete data
        buf.extend_from_slice(&encoded[3..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        let decoded = decode_client_msg(&payload).unwrap();
        match decoded {
            ClientMessage::Ping { timestamp } => assert_eq!(timestamp, 12345),
            _ => panic!("wrong variant"),
        }

        // Buffer should be empty now
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_message_too_large() {
        let mut buf = BytesMut::new();
        let bad_len = (MAX_MSG_SIZE + 1).to_be_bytes();
        buf.extend_from_slice(&bad_len);
        buf.extend_from_slice(&[0u8; 100]);
        let result = try_decode_frame(&mut buf);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge(_))));
    }

    #[test]
    fn encode_refuses_oversized_payload() {
        let msg = ClientMessage::Signal {
            message: CallSignalingMessage::outbound(
                2,
                CallPayload::IceCandidate(IceCandidate {
                    candidate: "x".repeat(MAX_MSG_SIZE as usize),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                }),
            ),
        };
        assert!(matches!(
            encode_client_msg(&msg),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn frame_partial_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]); // only 2 bytes, need 4
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn frame_multiple_messages() {
        let first = ServerMessage::Authenticated { user_id: 1 };
        let second = ServerMessage::Signal {
            message: CallSignalingMessage {
                from_user_id: 4,
                to_user_id: 1,
                payload: CallPayload::End,
                session_key_hash: None,
            },
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_server_msg(&first).unwrap());
        buf.extend_from_slice(&encode_server_msg(&second).unwrap());

        let payload1 = try_decode_frame(&mut buf).unwrap().unwrap();
        let payload2 = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decode_server_msg(&payload1).unwrap(), first);
        assert_eq!(decode_server_msg(&payload2).unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn bare_signal_text() {
        let msg = CallSignalingMessage::outbound(8, CallPayload::Reject);
        let text = encode_signal(&msg).unwrap();
        assert_eq!(text, r#"{"fromUserId":0,"toUserId":8,"type":"call_reject"}"#);
        assert_eq!(decode_signal(&text).unwrap(), msg);
    }
}
