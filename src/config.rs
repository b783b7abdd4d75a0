//! Node configuration.

use crate::crypto::KEY_SIZE;
use std::path::PathBuf;

/// Pre-existing key material, for nodes that persist identity externally.
/// Fresh keypairs are generated when absent.
pub struct KeyMaterial {
    pub sign_secret: [u8; KEY_SIZE],
    pub enc_secret: [u8; KEY_SIZE],
}

/// Options recognized by the node constructor.
pub struct NodeConfig {
    /// Base directory for shared content. Defaults to `$HOME/party-line`.
    pub shared_dir: Option<PathBuf>,
    /// `ip:port` advertised to peers. Port mapping is the embedder's job.
    pub external_address: String,
    /// UDP bind port. 0 picks an ephemeral port.
    pub port: u16,
    pub keys: Option<KeyMaterial>,
}

impl NodeConfig {
    pub fn new(external_address: impl Into<String>, port: u16) -> Self {
        Self {
            shared_dir: None,
            external_address: external_address.into(),
            port,
            keys: None,
        }
    }

    pub fn with_shared_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shared_dir = Some(dir.into());
        self
    }
}
