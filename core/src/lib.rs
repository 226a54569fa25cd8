//! Embercoin core types and data structures
//!
//! This crate defines the block and transaction model shared by every other
//! crate: the canonical binary codec that block and transaction hashes are
//! computed over, the Merkle commitment binding a block to its transaction
//! set, and the UTXO transaction with its trimmed-copy signing scheme.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod block;
pub mod codec;
pub mod merkle;
pub mod transaction;

pub use block::Block;
pub use codec::{decode, encode, CodecError};
pub use transaction::{
    RefType, Transaction, TransactionError, TxInput, TxOutput, TxOutputs, TxType,
};

/// Hashes and transaction ids. 32 bytes when set; the empty vector is the
/// sentinel for the genesis parent link and the coinbase input reference.
pub type Hash = Vec<u8>;

/// Width in bytes of every real hash in the system.
pub const HASH_LEN: usize = 32;

/// Current wall-clock time in seconds since the epoch.
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
