//! The on-wire envelope and mainline payload types.
//!
//! Every datagram carries exactly one JSON envelope terminated by a newline.
//! `Data` is raw bytes, base64 in JSON; for signed types it is
//! `signature || inner-json`, for directed party traffic it is additionally
//! sealed to the recipient's encryption key. `Time` is only set once an
//! envelope has been routed; unrouted envelopes carry null.

use super::identity::{MinPeer, Peer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base64 bytes in JSON, matching the original wire encoding of raw data.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Known mainline envelope tags. The wire carries the string form; unknown
/// tags survive decoding so the dispatcher can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Bootstrap,
    VerifyBootstrap,
    Announce,
    Chat,
    Disconnect,
    SuggestionRequest,
    Suggestions,
    Ping,
    Pulse,
    Party,
    Invite,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Bootstrap => "bootstrap",
            EnvelopeKind::VerifyBootstrap => "verifybs",
            EnvelopeKind::Announce => "announce",
            EnvelopeKind::Chat => "chat",
            EnvelopeKind::Disconnect => "disconnect",
            EnvelopeKind::SuggestionRequest => "request",
            EnvelopeKind::Suggestions => "suggestions",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pulse => "pulse",
            EnvelopeKind::Party => "party",
            EnvelopeKind::Invite => "invite",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "bootstrap" => EnvelopeKind::Bootstrap,
            "verifybs" => EnvelopeKind::VerifyBootstrap,
            "announce" => EnvelopeKind::Announce,
            "chat" => EnvelopeKind::Chat,
            "disconnect" => EnvelopeKind::Disconnect,
            "request" => EnvelopeKind::SuggestionRequest,
            "suggestions" => EnvelopeKind::Suggestions,
            "ping" => EnvelopeKind::Ping,
            "pulse" => EnvelopeKind::Pulse,
            "party" => EnvelopeKind::Party,
            "invite" => EnvelopeKind::Invite,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: String,
    pub from: String,
    /// Recipient id, or empty for broadcast.
    pub to: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Set on first routing; a null time means "not routed".
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from: String, to: String, data: Vec<u8>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            from,
            to,
            data,
            time: None,
        }
    }
}

// =============================================================================
// MAINLINE PAYLOADS
// =============================================================================
// Every payload that can (re-)introduce a peer carries a wall-clock Time; the
// peer cache compares it against the last recorded event to let a
// disconnected peer rejoin.

/// Inner payload for bootstrap, verify and announce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageTimePeer {
    pub peer: Peer,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageChat {
    pub min: MinPeer,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Typed marker payload: -1 disconnect, 1 pulse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageTime {
    pub message_type: i32,
    pub time: DateTime<Utc>,
}

/// Ping carries the sender's identity so the receiver can pulse back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessagePing {
    pub min: MinPeer,
    pub message_type: i32,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageSuggestionRequest {
    pub peer: Peer,
    pub to: String,
    pub time: DateTime<Utc>,
}

/// Suggestion response. `request_data` echoes the original signed request so
/// the requester can confirm it asked (prevents amplification abuse).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageSuggestions {
    pub peer: Peer,
    #[serde(with = "b64")]
    pub request_data: Vec<u8>,
    pub suggested_peers: Vec<Peer>,
    pub time: DateTime<Utc>,
}

/// Disconnect marker value.
pub const MESSAGE_TYPE_DISCONNECT: i32 = -1;
/// Ping marker value.
pub const MESSAGE_TYPE_PING: i32 = 0;
/// Pulse marker value.
pub const MESSAGE_TYPE_PULSE: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::identity::Identity;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(
            EnvelopeKind::Chat,
            "a.b".into(),
            String::new(),
            vec![1, 2, 3],
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["Type"], "chat");
        assert_eq!(json["From"], "a.b");
        assert_eq!(json["To"], "");
        assert_eq!(json["Data"], "AQID");
        assert!(json["Time"].is_null());

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, vec![1, 2, 3]);
        assert!(back.time.is_none());
    }

    #[test]
    fn every_tag_roundtrips() {
        for kind in [
            EnvelopeKind::Bootstrap,
            EnvelopeKind::VerifyBootstrap,
            EnvelopeKind::Announce,
            EnvelopeKind::Chat,
            EnvelopeKind::Disconnect,
            EnvelopeKind::SuggestionRequest,
            EnvelopeKind::Suggestions,
            EnvelopeKind::Ping,
            EnvelopeKind::Pulse,
            EnvelopeKind::Party,
            EnvelopeKind::Invite,
        ] {
            assert_eq!(EnvelopeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EnvelopeKind::parse("gossip"), None);
    }

    #[test]
    fn chat_payload_keys_are_pascal_case() {
        let identity = Identity::generate(String::new());
        let chat = MessageChat {
            min: identity.min(),
            message: "hi".into(),
            time: crate::types::now(),
        };
        let json = serde_json::to_value(&chat).unwrap();
        assert!(json.get("Min").is_some());
        assert!(json.get("Message").is_some());
        assert!(json.get("Time").is_some());
    }
}
