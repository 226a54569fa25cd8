//! Embercoin persistence
//!
//! One sled keyspace per node instance holds the whole chain state:
//! `"lh"` maps to the current tip hash, each block is stored under its own
//! hash, and `"utxo-" || txid` holds the unspent outputs of one
//! transaction. Values are opaque blobs produced by the core codec. The
//! store is the single source of truth; the UTXO index is a derived view
//! and always recomputable from it.

use thiserror::Error;

use embercoin_consensus::ConsensusError;
use embercoin_core::{CodecError, TransactionError};

pub mod chain;
pub mod utxo;

pub use chain::{ChainIterator, ChainStore, TIP_KEY, UTXO_PREFIX};
pub use utxo::UtxoIndex;

#[derive(Debug, Error)]
pub enum StoreError {
    /// KV backend failure, including lock-file conflicts.
    #[error("storage backend: {0}")]
    Backend(#[from] sled::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Height/parent mismatch, bad proof of work, or a broken Merkle
    /// commitment.
    #[error("invalid block: {0}")]
    InvalidBlock(#[from] ConsensusError),

    /// A transaction whose references are broken or whose signatures do
    /// not verify.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The database lock stayed held through every retry.
    #[error("database locked after {attempts} attempts: {source}")]
    LockHeld {
        attempts: u32,
        source: sled::Error,
    },
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::InvalidTransaction(err.to_string())
    }
}
