//! Embercoin consensus rules
//!
//! Block assembly (timestamping, Merkle commitment, nonce search) and the
//! structural checks a block must pass before it is appended to a chain.

use log::debug;
use thiserror::Error;

use embercoin_core::{current_timestamp, Block, CodecError, Transaction};

pub mod pow;

pub use pow::{ProofOfWork, DIFFICULTY};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid proof of work")]
    InvalidProofOfWork,

    #[error("merkle root does not commit to the transaction set")]
    InvalidMerkleRoot,

    #[error("difficulty {0} differs from the network constant {DIFFICULTY}")]
    InvalidDifficulty(u32),

    #[error("height {candidate} does not follow parent height {parent}")]
    InvalidHeight { candidate: u64, parent: u64 },

    #[error("previous-hash link does not match the parent block")]
    BrokenParentLink,

    #[error("block carries no transactions")]
    EmptyBlock,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Assemble and mine a block: stamp the timestamp, commit to the
/// transaction set, then search for a satisfying nonce.
pub fn create_block(
    transactions: Vec<Transaction>,
    prev_hash: Vec<u8>,
    height: u64,
) -> Result<Block, ConsensusError> {
    if transactions.is_empty() {
        return Err(ConsensusError::EmptyBlock);
    }
    let mut block = Block {
        timestamp: current_timestamp(),
        prev_hash,
        merkle_root: Vec::new(),
        difficulty: DIFFICULTY,
        nonce: 0,
        hash: Vec::new(),
        height,
        tx_count: transactions.len() as u32,
        transactions,
    };
    block.merkle_root = block.hash_transactions()?;

    let (nonce, hash) = ProofOfWork::new(&block).run();
    block.nonce = nonce;
    block.hash = hash;
    debug!("assembled {}", block);
    Ok(block)
}

/// The chain's first block: empty parent link, height 1, exactly one
/// coinbase transaction.
pub fn new_genesis_block(coinbase: Transaction) -> Result<Block, ConsensusError> {
    create_block(vec![coinbase], Vec::new(), 1)
}

/// Structural linkage checks against the parent block.
pub fn is_block_valid(candidate: &Block, parent: &Block) -> Result<(), ConsensusError> {
    if candidate.height != parent.height + 1 {
        return Err(ConsensusError::InvalidHeight {
            candidate: candidate.height,
            parent: parent.height,
        });
    }
    if candidate.prev_hash != parent.hash {
        return Err(ConsensusError::BrokenParentLink);
    }
    Ok(())
}

/// Self-contained checks: the network difficulty constant, the Merkle
/// commitment, and the proof of work. Transaction validity is checked by
/// the store, which can resolve spent outputs.
pub fn check_block(candidate: &Block) -> Result<(), ConsensusError> {
    if candidate.transactions.is_empty() {
        return Err(ConsensusError::EmptyBlock);
    }
    if candidate.difficulty != DIFFICULTY {
        return Err(ConsensusError::InvalidDifficulty(candidate.difficulty));
    }
    if candidate.hash_transactions()? != candidate.merkle_root {
        return Err(ConsensusError::InvalidMerkleRoot);
    }
    if !ProofOfWork::new(candidate).validate() {
        return Err(ConsensusError::InvalidProofOfWork);
    }
    Ok(())
}
