//! Proof of work
//!
//! Difficulty `D` fixes the target `T = 2^(256 − D)`. The preimage is the
//! concatenation `merkle_root || prev_hash || nonce (LE) || difficulty (LE)`
//! with fixed widths, so every node hashes exactly the same bytes. A block
//! holds once `SHA256(preimage)` read as a big-endian integer falls below
//! `T`.

use num_bigint::BigUint;
use sha2::{Digest, Sha256};

use embercoin_core::Block;

/// Leading zero bits demanded of every block hash. Compile-time constant;
/// there is no difficulty adjustment in this design.
pub const DIFFICULTY: u32 = 5;

/// Nonce search space upper bound.
const MAX_NONCE: i64 = i64::MAX;

/// Nonce search and validation context for one block.
pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: BigUint,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> ProofOfWork<'a> {
        let target = BigUint::from(1u8) << (256 - block.difficulty as usize);
        ProofOfWork { block, target }
    }

    /// The exact byte layout all nodes must agree on.
    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            self.block.merkle_root.len() + self.block.prev_hash.len() + 16,
        );
        data.extend_from_slice(&self.block.merkle_root);
        data.extend_from_slice(&self.block.prev_hash);
        data.extend_from_slice(&nonce.to_le_bytes());
        data.extend_from_slice(&(self.block.difficulty as u64).to_le_bytes());
        data
    }

    /// Search for a nonce whose hash meets the target. CPU-bound; callers
    /// run it on a blocking thread.
    pub fn run(&self) -> (i64, Vec<u8>) {
        let mut nonce = 0i64;
        loop {
            let hash = Sha256::digest(self.prepare_data(nonce));
            if BigUint::from_bytes_be(&hash) < self.target {
                return (nonce, hash.to_vec());
            }
            debug_assert!(nonce < MAX_NONCE, "nonce space exhausted");
            nonce += 1;
        }
    }

    /// Recompute the hash with the block's stored nonce and check that it
    /// both matches the stored hash and meets the target.
    pub fn validate(&self) -> bool {
        let hash = Sha256::digest(self.prepare_data(self.block.nonce));
        hash.as_slice() == self.block.hash && BigUint::from_bytes_be(&hash) < self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embercoin_core::Transaction;
    use embercoin_crypto::{get_address, Keypair};

    fn mined_block() -> Block {
        let address = get_address(&Keypair::random().public_key());
        let coinbase = Transaction::new_coinbase(&address, b"reward", 50.0).unwrap();
        crate::create_block(vec![coinbase], vec![1; 32], 2).unwrap()
    }

    #[test]
    fn mined_blocks_validate() {
        let block = mined_block();
        assert!(ProofOfWork::new(&block).validate());
    }

    #[test]
    fn hash_has_required_leading_zero_bits() {
        let block = mined_block();
        let target = BigUint::from(1u8) << (256 - DIFFICULTY as usize);
        assert!(BigUint::from_bytes_be(&block.hash) < target);
    }

    #[test]
    fn any_header_mutation_invalidates() {
        let block = mined_block();

        let mut bad = block.clone();
        bad.merkle_root[0] ^= 0x01;
        assert!(!ProofOfWork::new(&bad).validate());

        let mut bad = block.clone();
        bad.prev_hash[0] ^= 0x01;
        assert!(!ProofOfWork::new(&bad).validate());

        let mut bad = block.clone();
        bad.nonce += 1;
        assert!(!ProofOfWork::new(&bad).validate());

        let mut bad = block.clone();
        bad.difficulty += 1;
        assert!(!ProofOfWork::new(&bad).validate());

        let mut bad = block;
        bad.hash[0] ^= 0x01;
        assert!(!ProofOfWork::new(&bad).validate());
    }
}
