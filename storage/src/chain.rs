//! Block store and chain append
//!
//! Single-writer discipline: every mutation serializes through one mutex
//! guarding the backing database's write path, and each append commits the
//! block and the tip pointer in one atomic batch. Reads go straight to
//! sled. The in-memory tip mirror is refreshed while the writer lock is
//! still held, so it never disagrees with the committed `"lh"` key.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use embercoin_consensus as consensus;
use embercoin_core::{Block, Transaction};

use crate::StoreError;

/// Key under which the current tip hash is kept.
pub const TIP_KEY: &[u8] = b"lh";

/// Prefix for materialized UTXO entries, managed by [`crate::UtxoIndex`].
pub const UTXO_PREFIX: &[u8] = b"utxo-";

/// Lock retries after the initial open attempt, with linear backoff.
const OPEN_RETRIES: u32 = 3;

/// Persistent block store, keyed by block hash, with the tip under
/// [`TIP_KEY`].
pub struct ChainStore {
    db: sled::Db,
    tip: Mutex<Vec<u8>>,
    write_lock: Mutex<()>,
}

impl ChainStore {
    /// Open (or create) the store at `path`.
    ///
    /// A lock held by a dying process clears asynchronously, so a failed
    /// open is retried up to three times with linear backoff (1s, 2s, 3s)
    /// before surfacing [`StoreError::LockHeld`].
    pub fn open(path: impl AsRef<Path>) -> Result<ChainStore, StoreError> {
        let path = path.as_ref();
        let mut retry = 0u32;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(err) => {
                    if retry >= OPEN_RETRIES {
                        return Err(StoreError::LockHeld {
                            attempts: retry + 1,
                            source: err,
                        });
                    }
                    retry += 1;
                    warn!(
                        "database at {} is locked ({}), retry {}/{}",
                        path.display(),
                        err,
                        retry,
                        OPEN_RETRIES
                    );
                    thread::sleep(Duration::from_secs(retry as u64));
                }
            }
        };
        let tip = db
            .get(TIP_KEY)?
            .map(|raw| raw.to_vec())
            .unwrap_or_default();
        Ok(ChainStore {
            db,
            tip: Mutex::new(tip),
            write_lock: Mutex::new(()),
        })
    }

    /// Seed an empty store with the genesis block. A no-op when a chain
    /// already exists.
    pub fn initialize(&self, genesis: &Block) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        if self.db.get(TIP_KEY)?.is_some() {
            debug!("chain already initialized, keeping existing genesis");
            return Ok(());
        }
        consensus::check_block(genesis)?;
        self.commit(genesis)?;
        info!("created chain with genesis {}", hex::encode(&genesis.hash));
        Ok(())
    }

    /// Write `block` and the tip pointer in one atomic batch and refresh
    /// the in-memory tip. Callers hold the writer lock.
    fn commit(&self, block: &Block) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        batch.insert(block.hash.clone(), block.serialize()?);
        batch.insert(TIP_KEY, block.hash.clone());
        self.db.apply_batch(batch)?;
        *self.tip.lock().unwrap() = block.hash.clone();
        Ok(())
    }

    /// Append a block.
    ///
    /// Idempotent: a block already present leaves the store untouched and
    /// returns `Ok(false)`. Otherwise the candidate must extend the current
    /// tip, carry a valid proof of work and Merkle commitment, and contain
    /// only verifiable transactions; block and tip are then committed in
    /// one atomic batch and `Ok(true)` is returned.
    pub fn add_block(&self, block: &Block) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        if self.db.contains_key(&block.hash)? {
            debug!("block {} already stored", hex::encode(&block.hash));
            return Ok(false);
        }

        match self.db.get(TIP_KEY)? {
            Some(tip_hash) => {
                let parent = self.get_block(&tip_hash)?;
                consensus::is_block_valid(block, &parent)?;
            }
            // An empty store accepts a genesis block; this is how a
            // freshly joined node bootstraps from the network.
            None if block.is_genesis() => {}
            None => return Err(StoreError::NotFound("chain tip".into())),
        }
        consensus::check_block(block)?;
        for tx in &block.transactions {
            self.verify_transaction(tx)?;
        }

        self.commit(block)?;
        info!("appended {}", block);
        Ok(true)
    }

    /// Validate `transactions`, assemble a block on top of the current tip,
    /// run the proof of work, and append it.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block, StoreError> {
        for tx in &transactions {
            self.verify_transaction(tx)?;
        }
        let tip_hash = self
            .db
            .get(TIP_KEY)?
            .ok_or_else(|| StoreError::NotFound("chain tip".into()))?;
        let parent = self.get_block(&tip_hash)?;
        let block = consensus::create_block(transactions, tip_hash.to_vec(), parent.height + 1)?;
        self.add_block(&block)?;
        Ok(block)
    }

    /// Check a transaction's signatures against the outputs it spends,
    /// resolving producing transactions from the chain.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let mut prev: HashMap<Vec<u8>, Transaction> = HashMap::new();
        for input in &tx.vin {
            if prev.contains_key(&input.prev_tx_id) {
                continue;
            }
            let prev_tx = self.find_transaction(&input.prev_tx_id)?.ok_or_else(|| {
                StoreError::NotFound(format!(
                    "transaction {} referenced by an input",
                    hex::encode(&input.prev_tx_id)
                ))
            })?;
            prev.insert(prev_tx.id.clone(), prev_tx);
        }
        match tx.verify(&prev)? {
            true => Ok(()),
            false => Err(StoreError::InvalidTransaction(format!(
                "signature check failed for {}",
                hex::encode(&tx.id)
            ))),
        }
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StoreError> {
        match self.db.get(hash)? {
            Some(raw) => Ok(Block::deserialize(&raw)?),
            None => Err(StoreError::NotFound(format!(
                "block {}",
                hex::encode(hash)
            ))),
        }
    }

    pub fn has_block(&self, hash: &[u8]) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(hash)?)
    }

    /// Height of the tip block, or 0 when the chain is absent.
    pub fn get_best_height(&self) -> Result<u64, StoreError> {
        match self.db.get(TIP_KEY)? {
            Some(tip) => Ok(self.get_block(&tip)?.height),
            None => Ok(0),
        }
    }

    /// Current tip hash; empty when the chain is absent.
    pub fn tip_hash(&self) -> Vec<u8> {
        self.tip.lock().unwrap().clone()
    }

    /// Hashes of every block strictly above `above_height`, in ascending
    /// height order.
    pub fn get_block_hashes(&self, above_height: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut hashes = Vec::new();
        for block in self.iter()? {
            let block = block?;
            if block.height <= above_height {
                break;
            }
            hashes.push(block.hash);
        }
        hashes.reverse();
        Ok(hashes)
    }

    /// Scan the chain for a transaction by id.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Option<Transaction>, StoreError> {
        for block in self.iter()? {
            let block = block?;
            for tx in block.transactions {
                if tx.id == id {
                    return Ok(Some(tx));
                }
            }
        }
        Ok(None)
    }

    /// Walk the chain from the tip down to genesis.
    pub fn iter(&self) -> Result<ChainIterator, StoreError> {
        let next_hash = self
            .db
            .get(TIP_KEY)?
            .map(|raw| raw.to_vec())
            .unwrap_or_default();
        Ok(ChainIterator {
            db: self.db.clone(),
            next_hash,
        })
    }

    /// Flush pending writes to disk; called on shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &sled::Db {
        &self.db
    }
}

/// Iterator yielding blocks from the tip back to genesis, following
/// `prev_hash` links until the empty genesis sentinel.
pub struct ChainIterator {
    db: sled::Db,
    next_hash: Vec<u8>,
}

impl Iterator for ChainIterator {
    type Item = Result<Block, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_hash.is_empty() {
            return None;
        }
        let raw = match self.db.get(&self.next_hash) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                let missing = std::mem::take(&mut self.next_hash);
                return Some(Err(StoreError::NotFound(format!(
                    "block {}",
                    hex::encode(missing)
                ))));
            }
            Err(err) => {
                self.next_hash = Vec::new();
                return Some(Err(err.into()));
            }
        };
        match Block::deserialize(&raw) {
            Ok(block) => {
                self.next_hash = block.prev_hash.clone();
                Some(Ok(block))
            }
            Err(err) => {
                self.next_hash = Vec::new();
                Some(Err(err.into()))
            }
        }
    }
}
