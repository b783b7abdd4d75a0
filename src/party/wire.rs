//! Party-level wire types.
//!
//! Party traffic rides inside a mainline `party` envelope: the outer `Data`
//! is sealed to one recipient and contains a `PartyEnvelope`, whose own
//! `Data` is a signed payload. Invites travel in their own envelope type but
//! use the same sealing.

use crate::files::{Block, PackSummary};
use crate::net::envelope::b64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Party ids are eight-or-fewer name characters padded with random hex to 32.
pub const PARTY_ID_LEN: usize = 32;

/// `^[a-zA-Z0-9]{32}$`
pub fn valid_party_id(id: &str) -> bool {
    id.len() == PARTY_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyKind {
    Advertisement,
    Announce,
    Chat,
    Disconnect,
    Request,
    Fulfillment,
}

impl PartyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PartyKind::Advertisement => "ad",
            PartyKind::Announce => "announce",
            PartyKind::Chat => "chat",
            PartyKind::Disconnect => "disconnect",
            PartyKind::Request => "request",
            PartyKind::Fulfillment => "fulfillment",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "ad" => PartyKind::Advertisement,
            "announce" => PartyKind::Announce,
            "chat" => PartyKind::Chat,
            "disconnect" => PartyKind::Disconnect,
            "request" => PartyKind::Request,
            "fulfillment" => PartyKind::Fulfillment,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    pub from: String,
    pub party_id: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

impl PartyEnvelope {
    pub fn new(kind: PartyKind, from: String, party_id: String, data: Vec<u8>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            from,
            party_id,
            data,
        }
    }
}

/// Invite payload: the party snapshot a joiner starts from. The member list
/// is truncated to 20 entries by the sender to bound envelope size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyInvite {
    pub id: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyAnnounce {
    pub peer_id: String,
    pub party_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyChat {
    pub peer_id: String,
    pub party_id: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyDisconnect {
    pub peer_id: String,
    pub party_id: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyAdvertisement {
    pub peer_id: String,
    pub party_id: String,
    pub time: DateTime<Utc>,
    pub hash: String,
    pub pack: PackSummary,
}

/// Block request: the requester's coverage tells holders which blocks it can
/// verify next. `time` is the requester's stamp on the wire; the receiving
/// node rewrites it to a local expiry before queueing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyRequest {
    pub peer_id: String,
    pub pack_hash: String,
    pub file_hash: String,
    pub coverage: Vec<u64>,
    pub time: DateTime<Utc>,
    pub party_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartyFulfillment {
    pub peer_id: String,
    pub pack_hash: String,
    pub file_hash: String,
    pub party_id: String,
    pub block: Block,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_id_validation() {
        assert!(valid_party_id("coolname0123456789abcdef01234567"));
        assert!(!valid_party_id("short"));
        assert!(!valid_party_id("coolname0123456789abcdef0123456!"));
        assert!(!valid_party_id(""));
    }

    #[test]
    fn party_tags_roundtrip() {
        for kind in [
            PartyKind::Advertisement,
            PartyKind::Announce,
            PartyKind::Chat,
            PartyKind::Disconnect,
            PartyKind::Request,
            PartyKind::Fulfillment,
        ] {
            assert_eq!(PartyKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PartyKind::parse("karaoke"), None);
    }

    #[test]
    fn party_envelope_wire_shape() {
        let env = PartyEnvelope::new(
            PartyKind::Chat,
            "a.b".into(),
            "p".repeat(32),
            vec![1, 2],
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["Type"], "chat");
        assert_eq!(json["PartyId"], "p".repeat(32));
        assert_eq!(json["Data"], "AQI=");
    }
}
