//! Signaling messages carried over WebTransport
//!
//! Datagrams carry `ice-candidate`, `coords` and `error` messages; one-shot
//! unidirectional streams carry `offer` and `answer`. Every message is a
//! JSON object tagged by its `type` field.

use serde::{Deserialize, Serialize};

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP offer from client
    Offer { sdp: String },
    /// SDP answer from server
    Answer { sdp: String },
    /// Trickled ICE candidate, either direction
    IceCandidate { candidate: IceCandidate },
    /// Ball position as seen by the client
    Coords { x: f64, y: f64 },
    /// Distance between reported and true position
    Error { e: f64 },
}

/// Type tags understood by [`SignalingMessage`]
const KNOWN_TYPES: &[&str] = &["offer", "answer", "ice-candidate", "coords", "error"];

/// Outcome of decoding a signaling payload
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A well-formed message
    Message(SignalingMessage),
    /// Valid JSON with a `type` this server does not know
    Unrecognized(String),
    /// Not UTF-8 JSON, no `type`, or missing/invalid fields
    Malformed(String),
}

impl SignalingMessage {
    /// Decode a payload at the transport boundary
    pub fn decode(payload: &[u8]) -> Decoded {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => return Decoded::Malformed(e.to_string()),
        };

        let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
            return Decoded::Malformed("missing type".to_string());
        };
        if !KNOWN_TYPES.contains(&kind) {
            return Decoded::Unrecognized(kind.to_string());
        }

        match serde_json::from_value(value) {
            Ok(msg) => Decoded::Message(msg),
            Err(e) => Decoded::Malformed(e.to_string()),
        }
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Coords { .. } => "coords",
            SignalingMessage::Error { .. } => "error",
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Peer connection state as reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the peer connection is unusable
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_offer() {
        let decoded = SignalingMessage::decode(br#"{"type":"offer","sdp":"v=0\r\n"}"#);
        assert_eq!(
            decoded,
            Decoded::Message(SignalingMessage::Offer {
                sdp: "v=0\r\n".to_string()
            })
        );
    }

    #[test]
    fn test_decode_browser_candidate() {
        let payload = br#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}}"#;
        match SignalingMessage::decode(payload) {
            Decoded::Message(SignalingMessage::IceCandidate { candidate }) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_candidate_without_optional_fields() {
        let payload = br#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1"}}"#;
        assert!(matches!(
            SignalingMessage::decode(payload),
            Decoded::Message(SignalingMessage::IceCandidate { .. })
        ));
    }

    #[test]
    fn test_decode_coords_accepts_integers() {
        assert_eq!(
            SignalingMessage::decode(br#"{"type":"coords","x":7,"y":6.5}"#),
            Decoded::Message(SignalingMessage::Coords { x: 7.0, y: 6.5 })
        );
    }

    #[test]
    fn test_decode_unrecognized_type() {
        assert_eq!(
            SignalingMessage::decode(br#"{"type":"renegotiate"}"#),
            Decoded::Unrecognized("renegotiate".to_string())
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            SignalingMessage::decode(b"\xff\xfe"),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            SignalingMessage::decode(br#"{"sdp":"x"}"#),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            SignalingMessage::decode(br#"{"type":"coords","x":1}"#),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            SignalingMessage::decode(br#"{"type":"offer"}"#),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn test_encode_error_report() {
        let bytes = SignalingMessage::Error { e: 5.0 }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["e"], 5.0);
    }

    #[test]
    fn test_encode_answer() {
        let bytes = SignalingMessage::Answer {
            sdp: "v=0".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"type":"answer","sdp":"v=0"}"#
        );
    }
}
