//! Block structure
//!
//! A block binds an ordered transaction list to its parent through the
//! Merkle root and the proof-of-work hash. The hash itself is computed by
//! the consensus crate over `merkle_root || prev_hash || nonce ||
//! difficulty`; it is stored in the block for O(1) self-reference.

use std::fmt;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::merkle::merkle_root;
use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Seconds since the epoch at assembly time.
    pub timestamp: i64,

    /// Hash of the parent block; empty for genesis.
    pub prev_hash: Vec<u8>,

    pub transactions: Vec<Transaction>,

    /// Merkle commitment over the serialized transactions.
    pub merkle_root: Vec<u8>,

    /// Leading zero bits demanded of the proof-of-work hash.
    pub difficulty: u32,

    pub nonce: i64,

    /// Content address; derived, kept for O(1) self-reference.
    pub hash: Vec<u8>,

    /// Chain height; genesis is 1.
    pub height: u64,

    /// Redundant with `transactions.len()`.
    pub tx_count: u32,
}

impl Block {
    /// Merkle root over the canonical serialization of each transaction.
    pub fn hash_transactions(&self) -> Result<Vec<u8>, CodecError> {
        let mut blobs = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            blobs.push(tx.serialize()?);
        }
        Ok(merkle_root(&blobs))
    }

    /// Whether this is the chain's first block.
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block, CodecError> {
        codec::decode(bytes)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = Utc
            .timestamp_opt(self.timestamp, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.timestamp.to_string());
        write!(
            f,
            "Block {{ height: {}, hash: {}, txs: {}, time: {} }}",
            self.height,
            hex::encode(self.hash.get(..8).unwrap_or(&self.hash)),
            self.transactions.len(),
            time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use embercoin_crypto::{get_address, Keypair};

    fn sample_block() -> Block {
        let address = get_address(&Keypair::random().public_key());
        let coinbase = Transaction::new_coinbase(&address, b"reward", 50.0).unwrap();
        let mut block = Block {
            timestamp: 1_700_000_000,
            prev_hash: vec![3; 32],
            merkle_root: Vec::new(),
            difficulty: 5,
            nonce: 42,
            hash: vec![9; 32],
            height: 2,
            tx_count: 1,
            transactions: vec![coinbase],
        };
        block.merkle_root = block.hash_transactions().unwrap();
        block
    }

    #[test]
    fn serialization_roundtrip() {
        let block = sample_block();
        let decoded = Block::deserialize(&block.serialize().unwrap()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn merkle_root_tracks_transactions() {
        let block = sample_block();
        let root = block.hash_transactions().unwrap();

        let mut mutated = block.clone();
        mutated.transactions[0].vout[0].value += 1.0;
        assert_ne!(root, mutated.hash_transactions().unwrap());
    }

    #[test]
    fn genesis_detection() {
        let mut block = sample_block();
        assert!(!block.is_genesis());
        block.prev_hash = Vec::new();
        assert!(block.is_genesis());
    }
}
