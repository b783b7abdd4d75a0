//! Signing and sealed-box primitives.
//!
//! Two independent keypairs per node: an Ed25519 pair for signatures and an
//! X25519 pair for peer-to-peer sealed boxes. Signed payloads carry the
//! 64-byte detached signature prepended to the message. Sealed payloads are
//! XChaCha20-Poly1305 with a random 24-byte nonce prepended, keyed from the
//! X25519 shared secret.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey as BoxPublicKey, StaticSecret};

/// Ed25519 signature length; signed payloads start with this many bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Both public key types are 32 raw bytes.
pub const KEY_SIZE: usize = 32;

/// XChaCha20 nonce length; sealed payloads start with this many bytes.
const NONCE_SIZE: usize = 24;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signed payload shorter than a signature")]
    Truncated,
    #[error("sealed payload could not be opened")]
    OpenFailed,
}

/// Ed25519 signing keypair. The secret never leaves this struct.
pub struct SignKeypair {
    public: [u8; KEY_SIZE],
    secret: SigningKey,
}

impl SignKeypair {
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        Self {
            public: secret.verifying_key().to_bytes(),
            secret,
        }
    }

    pub fn from_secret(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = SigningKey::from_bytes(&bytes);
        Self {
            public: secret.verifying_key().to_bytes(),
            secret,
        }
    }

    pub fn public(&self) -> [u8; KEY_SIZE] {
        self.public
    }

    /// Sign `message`, returning `signature || message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let sig = self.secret.sign(message);
        let mut out = Vec::with_capacity(SIGNATURE_SIZE + message.len());
        out.extend_from_slice(&sig.to_bytes());
        out.extend_from_slice(message);
        out
    }
}

/// Verify a `signature || message` payload, returning the message slice.
pub fn verify<'a>(signed: &'a [u8], public: &[u8; KEY_SIZE]) -> Result<&'a [u8], CryptoError> {
    if signed.len() < SIGNATURE_SIZE {
        return Err(CryptoError::Truncated);
    }
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_slice(&signed[..SIGNATURE_SIZE])
        .map_err(|_| CryptoError::InvalidSignature)?;
    let message = &signed[SIGNATURE_SIZE..];
    key.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)?;
    Ok(message)
}

/// X25519 keypair for sealed boxes.
pub struct BoxKeypair {
    public: [u8; KEY_SIZE],
    secret: StaticSecret,
}

impl BoxKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            public: BoxPublicKey::from(&secret).to_bytes(),
            secret,
        }
    }

    pub fn from_secret(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        Self {
            public: BoxPublicKey::from(&secret).to_bytes(),
            secret,
        }
    }

    pub fn public(&self) -> [u8; KEY_SIZE] {
        self.public
    }

    /// Seal `plain` to the holder of `peer_public`. Output is `nonce || ciphertext`.
    pub fn seal(&self, plain: &[u8], peer_public: &[u8; KEY_SIZE]) -> Vec<u8> {
        let cipher = self.cipher_for(peer_public);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        // Aead encrypt with a fresh random nonce cannot fail.
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plain)
            .expect("aead encrypt");
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Open a `nonce || ciphertext` payload sealed by the holder of `peer_public`.
    pub fn open(&self, sealed: &[u8], peer_public: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::OpenFailed);
        }
        let cipher = self.cipher_for(peer_public);
        cipher
            .decrypt(
                XNonce::from_slice(&sealed[..NONCE_SIZE]),
                &sealed[NONCE_SIZE..],
            )
            .map_err(|_| CryptoError::OpenFailed)
    }

    /// The symmetric key is the SHA-256 of the raw X25519 shared secret, so
    /// both directions of a pair derive the same cipher.
    fn cipher_for(&self, peer_public: &[u8; KEY_SIZE]) -> XChaCha20Poly1305 {
        let shared = self.secret.diffie_hellman(&BoxPublicKey::from(*peer_public));
        let key = Sha256::digest(shared.as_bytes());
        XChaCha20Poly1305::new(&key)
    }
}

/// SHA-256 of `data` as a lowercase hex string. All content addressing in the
/// pack/block model uses this form.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
