//! Node identity and its public projections.
//!
//! A node id is `hex(sign_pub) "." hex(enc_pub)`. The first half alone is the
//! short id, which doubles as the routing key.

use crate::crypto::{BoxKeypair, CryptoError, SignKeypair, KEY_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdError {
    #[error("invalid id")]
    Invalid,
}

/// Serialize 32-byte keys as lowercase hex strings on the wire.
pub mod hexkey {
    use super::KEY_SIZE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; KEY_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; KEY_SIZE], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be 32 bytes"))
    }
}

/// Identity-only projection of a peer: just the two public keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MinPeer {
    #[serde(with = "hexkey")]
    pub sign_pub: [u8; KEY_SIZE],
    #[serde(with = "hexkey")]
    pub enc_pub: [u8; KEY_SIZE],
}

impl MinPeer {
    pub fn id(&self) -> String {
        format!("{}.{}", hex::encode(self.sign_pub), hex::encode(self.enc_pub))
    }

    pub fn short_id(&self) -> String {
        hex::encode(self.sign_pub)
    }
}

/// Public projection of a remote node: keys plus a reachable address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Peer {
    #[serde(with = "hexkey")]
    pub sign_pub: [u8; KEY_SIZE],
    #[serde(with = "hexkey")]
    pub enc_pub: [u8; KEY_SIZE],
    pub address: String,
}

impl Peer {
    pub fn id(&self) -> String {
        format!("{}.{}", hex::encode(self.sign_pub), hex::encode(self.enc_pub))
    }

    pub fn short_id(&self) -> String {
        hex::encode(self.sign_pub)
    }

    pub fn min(&self) -> MinPeer {
        MinPeer {
            sign_pub: self.sign_pub,
            enc_pub: self.enc_pub,
        }
    }
}

/// Parse a full id (`signhex.enchex`) into its key pair.
pub fn parse_id(id: &str) -> Result<MinPeer, IdError> {
    let (sign_hex, enc_hex) = id.split_once('.').ok_or(IdError::Invalid)?;
    let sign_pub: [u8; KEY_SIZE] = hex::decode(sign_hex)
        .map_err(|_| IdError::Invalid)?
        .try_into()
        .map_err(|_| IdError::Invalid)?;
    let enc_pub: [u8; KEY_SIZE] = hex::decode(enc_hex)
        .map_err(|_| IdError::Invalid)?
        .try_into()
        .map_err(|_| IdError::Invalid)?;
    Ok(MinPeer { sign_pub, enc_pub })
}

/// The short id of a full id, without building a `MinPeer`.
pub fn id_front(id: &str) -> Result<String, IdError> {
    Ok(parse_id(id)?.short_id())
}

/// Decode a short id into routing-key bytes.
pub fn short_id_bytes(short_id: &str) -> Result<[u8; KEY_SIZE], IdError> {
    hex::decode(short_id)
        .map_err(|_| IdError::Invalid)?
        .try_into()
        .map_err(|_| IdError::Invalid)
}

/// The local node: both keypairs plus the advertised address. Secrets stay
/// here; everything that crosses the wire goes through [`Identity::peer`].
pub struct Identity {
    sign: SignKeypair,
    enc: BoxKeypair,
    address: String,
}

impl Identity {
    pub fn generate(address: String) -> Self {
        Self {
            sign: SignKeypair::generate(),
            enc: BoxKeypair::generate(),
            address,
        }
    }

    pub fn from_secrets(sign_secret: [u8; KEY_SIZE], enc_secret: [u8; KEY_SIZE], address: String) -> Self {
        Self {
            sign: SignKeypair::from_secret(sign_secret),
            enc: BoxKeypair::from_secret(enc_secret),
            address,
        }
    }

    pub fn peer(&self) -> Peer {
        Peer {
            sign_pub: self.sign.public(),
            enc_pub: self.enc.public(),
            address: self.address.clone(),
        }
    }

    pub fn min(&self) -> MinPeer {
        MinPeer {
            sign_pub: self.sign.public(),
            enc_pub: self.enc.public(),
        }
    }

    pub fn id(&self) -> String {
        self.peer().id()
    }

    pub fn short_id(&self) -> String {
        hex::encode(self.sign.public())
    }

    pub fn sign_pub(&self) -> [u8; KEY_SIZE] {
        self.sign.public()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.sign.sign(message)
    }

    pub fn seal(&self, plain: &[u8], peer_enc_pub: &[u8; KEY_SIZE]) -> Vec<u8> {
        self.enc.seal(plain, peer_enc_pub)
    }

    pub fn open(&self, sealed: &[u8], peer_enc_pub: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
        self.enc.open(sealed, peer_enc_pub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrip() {
        let identity = Identity::generate("127.0.0.1:3499".into());
        let id = identity.id();
        let min = parse_id(&id).unwrap();
        assert_eq!(min.id(), id);
        assert_eq!(min.short_id(), identity.short_id());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_id("nodots").is_err());
        assert!(parse_id("zz.zz").is_err());
        assert!(parse_id("abcd.abcd").is_err());
        let identity = Identity::generate(String::new());
        // Right shape, wrong second half length.
        let bad = format!("{}.abcd", identity.short_id());
        assert!(parse_id(&bad).is_err());
    }

    #[test]
    fn peer_wire_form_uses_hex_keys() {
        let identity = Identity::generate("10.0.0.1:9000".into());
        let json = serde_json::to_value(identity.peer()).unwrap();
        assert_eq!(
            json["SignPub"].as_str().unwrap(),
            identity.short_id().as_str()
        );
        assert_eq!(json["Address"].as_str().unwrap(), "10.0.0.1:9000");
    }
}
