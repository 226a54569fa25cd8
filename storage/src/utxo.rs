//! UTXO index
//!
//! A derived view over the chain: for every transaction with unspent
//! outputs, the key `utxo-<txid>` holds those outputs keyed by their
//! original index. The index can always be rebuilt from the store by a
//! full backward scan, and is updated incrementally as each block is
//! accepted. After every accepted block the materialized keys and a fresh
//! scan describe the same mapping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};

use embercoin_core::{Block, TxOutput, TxOutputs};

use crate::chain::{ChainStore, UTXO_PREFIX};
use crate::StoreError;

/// Keys deleted per batch while clearing the index.
const CLEAR_BATCH: usize = 100_000;

/// Materialized view of unspent outputs, backed by the chain store's
/// keyspace.
#[derive(Clone)]
pub struct UtxoIndex {
    store: Arc<ChainStore>,
}

fn utxo_key(txid: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(UTXO_PREFIX.len() + txid.len());
    key.extend_from_slice(UTXO_PREFIX);
    key.extend_from_slice(txid);
    key
}

impl UtxoIndex {
    pub fn new(store: Arc<ChainStore>) -> UtxoIndex {
        UtxoIndex { store }
    }

    /// Compute the full UTXO mapping by scanning the chain tip → genesis.
    ///
    /// Spends are recorded as they are encountered; because the scan runs
    /// backward, a spend is always seen before the producing output, so
    /// checking the spent set at the producer is sufficient.
    pub fn find_utxo(&self) -> Result<HashMap<Vec<u8>, TxOutputs>, StoreError> {
        let mut unspent: HashMap<Vec<u8>, TxOutputs> = HashMap::new();
        let mut spent: HashMap<Vec<u8>, HashSet<i32>> = HashMap::new();

        for block in self.store.iter()? {
            let block = block?;
            for tx in &block.transactions {
                for (index, output) in tx.vout.iter().enumerate() {
                    let spent_here = spent
                        .get(&tx.id)
                        .map_or(false, |indexes| indexes.contains(&(index as i32)));
                    if spent_here {
                        continue;
                    }
                    unspent
                        .entry(tx.id.clone())
                        .or_default()
                        .outputs
                        .insert(index as u32, output.clone());
                }
                if !tx.is_coinbase() {
                    for input in &tx.vin {
                        spent
                            .entry(input.prev_tx_id.clone())
                            .or_default()
                            .insert(input.vout_index);
                    }
                }
            }
        }
        Ok(unspent)
    }

    /// Rebuild the materialized index from scratch: delete every `utxo-`
    /// key (batched), then write the result of a fresh [`Self::find_utxo`]
    /// scan.
    pub fn compute(&self) -> Result<(), StoreError> {
        let db = self.store.db();

        let mut stale: Vec<Vec<u8>> = Vec::new();
        for entry in db.scan_prefix(UTXO_PREFIX) {
            let (key, _) = entry?;
            stale.push(key.to_vec());
        }
        for chunk in stale.chunks(CLEAR_BATCH) {
            let mut batch = sled::Batch::default();
            for key in chunk {
                batch.remove(key.clone());
            }
            db.apply_batch(batch)?;
        }

        let unspent = self.find_utxo()?;
        let mut batch = sled::Batch::default();
        for (txid, outputs) in &unspent {
            batch.insert(utxo_key(txid), outputs.serialize()?);
        }
        db.apply_batch(batch)?;
        info!("reindexed {} transactions with unspent outputs", unspent.len());
        Ok(())
    }

    /// Fold one accepted block into the index: inputs prune (or delete)
    /// the entries they spend, and every transaction's outputs are written
    /// under its id. All mutations land in one atomic batch.
    pub fn update(&self, block: &Block) -> Result<(), StoreError> {
        let db = self.store.db();
        // Read-through overlay so transactions within the same block see
        // each other's effects before the batch is applied.
        let mut staged: HashMap<Vec<u8>, Option<TxOutputs>> = HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    let key = utxo_key(&input.prev_tx_id);
                    let mut outputs = match staged.get(&key) {
                        Some(Some(outputs)) => outputs.clone(),
                        Some(None) => TxOutputs::default(),
                        None => match db.get(&key)? {
                            Some(raw) => TxOutputs::deserialize(&raw)?,
                            None => TxOutputs::default(),
                        },
                    };
                    if input.vout_index >= 0 {
                        outputs.outputs.remove(&(input.vout_index as u32));
                    }
                    let entry = if outputs.outputs.is_empty() {
                        None
                    } else {
                        Some(outputs)
                    };
                    staged.insert(key, entry);
                }
            }

            let mut fresh = TxOutputs::default();
            for (index, output) in tx.vout.iter().enumerate() {
                fresh.outputs.insert(index as u32, output.clone());
            }
            staged.insert(utxo_key(&tx.id), Some(fresh));
        }

        let mut batch = sled::Batch::default();
        for (key, entry) in staged {
            match entry {
                Some(outputs) => batch.insert(key, outputs.serialize()?),
                None => batch.remove(key),
            }
        }
        db.apply_batch(batch)?;
        debug!("utxo index updated for block {}", hex::encode(&block.hash));
        Ok(())
    }

    /// Collect fungible outputs locked with `pub_key_hash` until their sum
    /// reaches `amount`. Returns the accumulated value and, per producing
    /// transaction, the original output indexes to spend.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: f64,
    ) -> Result<(f64, HashMap<Vec<u8>, Vec<u32>>), StoreError> {
        let mut accumulated = 0.0;
        let mut spendable: HashMap<Vec<u8>, Vec<u32>> = HashMap::new();

        for entry in self.store.db().scan_prefix(UTXO_PREFIX) {
            let (key, raw) = entry?;
            let txid = key[UTXO_PREFIX.len()..].to_vec();
            let outputs = TxOutputs::deserialize(&raw)?;
            for (&index, output) in &outputs.outputs {
                if accumulated >= amount {
                    return Ok((accumulated, spendable));
                }
                if output.is_fungible() && output.is_locked_with(pub_key_hash) {
                    accumulated += output.value;
                    spendable.entry(txid.clone()).or_default().push(index);
                }
            }
        }
        Ok((accumulated, spendable))
    }

    /// First unspent asset output carrying `asset_id` and locked with
    /// `pub_key_hash`, as `(txid, original index)`.
    pub fn is_asset_spendable(
        &self,
        pub_key_hash: &[u8],
        asset_id: &[u8],
    ) -> Result<Option<(Vec<u8>, u32)>, StoreError> {
        for entry in self.store.db().scan_prefix(UTXO_PREFIX) {
            let (key, raw) = entry?;
            let outputs = TxOutputs::deserialize(&raw)?;
            for (&index, output) in &outputs.outputs {
                let matches = output.value == 0.0
                    && output.asset_id.as_deref() == Some(asset_id)
                    && output.is_locked_with(pub_key_hash);
                if matches {
                    return Ok(Some((key[UTXO_PREFIX.len()..].to_vec(), index)));
                }
            }
        }
        Ok(None)
    }

    /// Every unspent output locked with `pub_key_hash`; balances sum the
    /// fungible ones.
    pub fn outputs_locked_with(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, StoreError> {
        let mut owned = Vec::new();
        for entry in self.store.db().scan_prefix(UTXO_PREFIX) {
            let (_, raw) = entry?;
            let outputs = TxOutputs::deserialize(&raw)?;
            for output in outputs.outputs.values() {
                if output.is_locked_with(pub_key_hash) {
                    owned.push(output.clone());
                }
            }
        }
        Ok(owned)
    }

    /// Number of transactions that still have unspent outputs.
    pub fn count_transactions(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.store.db().scan_prefix(UTXO_PREFIX) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// The materialized mapping as currently stored, for consistency
    /// checks against [`Self::find_utxo`].
    pub fn materialized(&self) -> Result<HashMap<Vec<u8>, TxOutputs>, StoreError> {
        let mut mapping = HashMap::new();
        for entry in self.store.db().scan_prefix(UTXO_PREFIX) {
            let (key, raw) = entry?;
            mapping.insert(
                key[UTXO_PREFIX.len()..].to_vec(),
                TxOutputs::deserialize(&raw)?,
            );
        }
        Ok(mapping)
    }
}
