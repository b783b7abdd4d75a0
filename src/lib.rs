pub mod config;
pub mod crypto;
pub mod files;
pub mod net;
pub mod node;
pub mod party;
pub mod types;

pub use config::{KeyMaterial, NodeConfig};
pub use files::{Pack, PackState, BLOCK_SIZE};
pub use node::{Node, NodeError, NodeEvents};
pub use party::Party;
pub use types::{Chat, Status, StatusPriority};
