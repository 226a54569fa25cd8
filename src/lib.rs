//! Embercoin node facade
//!
//! Composition root for an embedded node: wallet login, chain bootstrap,
//! transaction construction, and the long-lived tasks (sync handlers,
//! catch-up timer, event loop). There is no CLI here — a host binary
//! builds a [`NodeConfig`], supplies a [`PubSub`](embercoin_network::PubSub)
//! transport, and drives the [`Node`].

pub mod asset;
pub mod config;
pub mod node;

pub use asset::AssetLedger;
pub use config::{random_instance_id, NodeConfig};
pub use node::{Node, NodeError};

pub use embercoin_crypto::Keypair;
pub use embercoin_network::{LocalBus, PubSub};

/// Wallet login: derive the node keypair from a seed phrase. The seed
/// itself is an opaque external concern; everything downstream only sees
/// the resulting [`Keypair`].
pub fn login(mnemonic: &str, salt: &str) -> Keypair {
    Keypair::from_seed(mnemonic, salt)
}
