//! Node configuration

use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default genesis subsidy: 2^27.
pub const DEFAULT_GENESIS_VALUE: f64 = 134_217_728.0;

/// Default reward per mined block.
pub const DEFAULT_SUBSIDY: f64 = 50.0;

/// Options recognized at node construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Full nodes persist the whole chain and accept mempool transactions
    /// from clients (subscribes the `fullnodes/*` topics).
    pub is_full_node: bool,

    /// Miner nodes additionally run proof-of-work over queued
    /// transactions (subscribes the `mining/*` topics).
    pub is_miner_node: bool,

    /// Distinguishes this instance's database directory. When absent a
    /// random 12-character id is generated; hosts that want a stable id
    /// (e.g. derived from a MAC address) pass their own.
    pub instance_id: Option<String>,

    /// Root under which `db/blockchain/blocks_<instance_id>` is created.
    pub data_dir: PathBuf,

    /// Embedded into the genesis coinbase's input.
    pub genesis_coinbase_data: String,

    /// Recipient of the genesis subsidy.
    pub genesis_coinbase_address: String,

    pub genesis_coinbase_value: f64,

    /// Reward per mined block.
    pub subsidy: f64,

    /// Protocol version announced on the `version` topic.
    pub version: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            is_full_node: true,
            is_miner_node: false,
            instance_id: None,
            data_dir: PathBuf::from(".embercoin"),
            genesis_coinbase_data: String::new(),
            genesis_coinbase_address: String::new(),
            genesis_coinbase_value: DEFAULT_GENESIS_VALUE,
            subsidy: DEFAULT_SUBSIDY,
            version: embercoin_network::message::PROTOCOL_VERSION,
        }
    }
}

impl NodeConfig {
    /// Database directory for a resolved instance id.
    pub fn db_path(&self, instance_id: &str) -> PathBuf {
        self.data_dir
            .join("db")
            .join("blockchain")
            .join(format!("blocks_{instance_id}"))
    }
}

/// Random 12-character alphanumeric instance id.
pub fn random_instance_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_path_layout() {
        let config = NodeConfig {
            data_dir: PathBuf::from("/tmp/ember"),
            ..NodeConfig::default()
        };
        assert_eq!(
            config.db_path("t1"),
            PathBuf::from("/tmp/ember/db/blockchain/blocks_t1")
        );
    }

    #[test]
    fn instance_ids_are_distinct_and_sized() {
        let a = random_instance_id();
        let b = random_instance_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
