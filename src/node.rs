//! Node composition
//!
//! A [`Node`] ties the store, UTXO index, mempool, and sync service
//! together behind the operations a host binary calls: open (bootstrapping
//! genesis on first run), start the background tasks, build and submit
//! transactions, query balances, and shut down cleanly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use embercoin_consensus::new_genesis_block;
use embercoin_core::{
    current_timestamp, Block, CodecError, RefType, Transaction, TransactionError, TxInput,
    TxOutput, TxType,
};
use embercoin_crypto::{
    get_address, hash_pub_key, pub_key_hash_from_address, script, sha256, CryptoError, Keypair,
};
use embercoin_network::{
    Mempool, MempoolChannels, PubSub, Side, SyncConfig, SyncError, SyncService,
};
use embercoin_storage::{ChainStore, StoreError, UtxoIndex};

use crate::asset::AssetLedger;
use crate::config::{random_instance_id, NodeConfig};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid block: {0}")]
    Consensus(#[from] embercoin_consensus::ConsensusError),

    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: f64, required: f64 },

    #[error("asset {0} is not spendable by this wallet")]
    AssetNotSpendable(String),
}

/// An embedded Embercoin node.
pub struct Node {
    config: NodeConfig,
    instance_id: String,
    keypair: Keypair,
    store: Arc<ChainStore>,
    utxo: UtxoIndex,
    mempool: Arc<Mempool>,
    sync: Arc<SyncService>,
    channels: Mutex<Option<MempoolChannels>>,
    cancel: CancellationToken,
    assets: Option<Arc<dyn AssetLedger>>,
}

impl Node {
    /// Open the node's chain (creating genesis on first run) and wire up
    /// the sync service. Background tasks start with [`Node::start`].
    pub fn open(
        config: NodeConfig,
        transport: Arc<dyn PubSub>,
        keypair: Keypair,
    ) -> Result<Node, NodeError> {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(random_instance_id);
        let store = Arc::new(ChainStore::open(config.db_path(&instance_id))?);
        let utxo = UtxoIndex::new(Arc::clone(&store));

        // Only a node configured as the genesis authority mints the chain;
        // everyone else starts empty and bootstraps over the network.
        if store.get_best_height()? == 0 && !config.genesis_coinbase_address.is_empty() {
            let coinbase = Transaction::new_coinbase(
                &config.genesis_coinbase_address,
                config.genesis_coinbase_data.as_bytes(),
                config.genesis_coinbase_value,
            )?;
            let genesis = new_genesis_block(coinbase)?;
            store.initialize(&genesis)?;
            info!("instance {} created a new chain", instance_id);
        }
        utxo.compute()?;

        let (mempool, channels) = Mempool::new();
        let cancel = CancellationToken::new();
        let sync = SyncService::new(
            transport,
            Arc::clone(&store),
            utxo.clone(),
            Arc::clone(&mempool),
            SyncConfig {
                is_full_node: config.is_full_node,
                is_miner_node: config.is_miner_node,
                mining_address: get_address(&keypair.public_key()),
                subsidy: config.subsidy,
                version: config.version,
            },
            cancel.child_token(),
        );

        Ok(Node {
            config,
            instance_id,
            keypair,
            store,
            utxo,
            mempool,
            sync,
            channels: Mutex::new(Some(channels)),
            cancel,
            assets: None,
        })
    }

    /// Attach the host's asset record store; accepted Casting and Destroy
    /// transactions are mirrored into it.
    pub fn with_asset_ledger(mut self, ledger: Arc<dyn AssetLedger>) -> Node {
        self.assets = Some(ledger);
        self
    }

    /// Start the sync handlers, the catch-up timer, and the event loop.
    pub async fn start(&self) -> Result<(), NodeError> {
        self.sync.start().await?;
        if let Some(channels) = self.channels.lock().unwrap().take() {
            let sync = Arc::clone(&self.sync);
            let cancel = self.cancel.child_token();
            let is_miner = self.config.is_miner_node;
            let assets = self.assets.clone();
            tokio::spawn(run_event_loop(sync, channels, cancel, is_miner, assets));
        }
        Ok(())
    }

    /// Cancel background tasks, wait for any mining cycle to wind down,
    /// and flush the database.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.cancel.cancel();
        self.mempool.wait_mining_idle().await;
        self.store.flush()?;
        info!("instance {} shut down", self.instance_id);
        Ok(())
    }

    /// This wallet's address.
    pub fn address(&self) -> String {
        get_address(&self.keypair.public_key())
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn get_best_height(&self) -> Result<u64, NodeError> {
        Ok(self.store.get_best_height()?)
    }

    /// Sum of the fungible unspent outputs locked to `address`.
    pub fn get_balance(&self, address: &str) -> Result<f64, NodeError> {
        let pub_key_hash = pub_key_hash_from_address(address)?;
        let balance = self
            .utxo
            .outputs_locked_with(&pub_key_hash)?
            .iter()
            .filter(|output| output.is_fungible())
            .map(|output| output.value)
            .sum();
        Ok(balance)
    }

    /// Build, sign, and submit a transfer of `amount` to `address`.
    /// `tx_type` distinguishes plain transfers from gifts
    /// ([`TxType::Handsel`]); both spend and lock value identically.
    pub async fn send(
        &self,
        address: &str,
        amount: f64,
        tx_type: TxType,
    ) -> Result<Transaction, NodeError> {
        let tx = self.build_transfer(address, amount, tx_type)?;
        self.submit(tx).await
    }

    /// Mint a new asset to this wallet. The asset id commits to the
    /// minter, the time, and the payload.
    pub async fn cast_asset(&self, payload: &[u8]) -> Result<Transaction, NodeError> {
        let minted_at = current_timestamp();
        let mut preimage = self.keypair.public_key();
        preimage.extend_from_slice(&minted_at.to_le_bytes());
        preimage.extend_from_slice(payload);
        let asset_id = sha256(&preimage);

        let output = TxOutput::new_asset(asset_id, &self.address())?;
        let tx = Transaction::new(Vec::new(), vec![output], TxType::Casting)?;
        self.submit(tx).await
    }

    /// Move an asset owned by this wallet to `address`.
    pub async fn trade_asset(
        &self,
        address: &str,
        asset_id: &[u8],
    ) -> Result<Transaction, NodeError> {
        let (prev_tx_id, index) = self.find_owned_asset(asset_id)?;
        let input = TxInput::new(
            prev_tx_id,
            index as i32,
            self.keypair.public_key(),
            RefType::Asset,
        );
        let output = TxOutput::new_asset(asset_id.to_vec(), address)?;
        let mut tx = Transaction::new(vec![input], vec![output], TxType::Trade)?;
        self.sign(&mut tx)?;
        self.submit(tx).await
    }

    /// Re-lock an asset owned by this wallet under an unspendable script.
    pub async fn destroy_asset(&self, asset_id: &[u8]) -> Result<Transaction, NodeError> {
        let (prev_tx_id, index) = self.find_owned_asset(asset_id)?;
        let input = TxInput::new(
            prev_tx_id,
            index as i32,
            self.keypair.public_key(),
            RefType::Asset,
        );
        let tombstone = TxOutput {
            value: 0.0,
            asset_id: Some(asset_id.to_vec()),
            pub_key_hash: script::build_unspendable_script(),
        };
        let mut tx = Transaction::new(vec![input], vec![tombstone], TxType::Destroy)?;
        self.sign(&mut tx)?;
        self.submit(tx).await
    }

    /// Queue everything pending and run one mining cycle. Convenience for
    /// hosts driving a single-node deployment; networked miners are driven
    /// by the event loop instead.
    pub async fn mine_pending_transactions(&self) -> Result<Block, NodeError> {
        for id in self.mempool.pending_ids() {
            self.mempool.move_to(&hex::encode(id), Side::Queued);
        }
        Ok(self.sync.mine_pending().await?)
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub fn utxo(&self) -> &UtxoIndex {
        &self.utxo
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    fn find_owned_asset(&self, asset_id: &[u8]) -> Result<(Vec<u8>, u32), NodeError> {
        let pub_key_hash = hash_pub_key(&self.keypair.public_key());
        self.utxo
            .is_asset_spendable(&pub_key_hash, asset_id)?
            .ok_or_else(|| NodeError::AssetNotSpendable(hex::encode(asset_id)))
    }

    fn build_transfer(
        &self,
        address: &str,
        amount: f64,
        tx_type: TxType,
    ) -> Result<Transaction, NodeError> {
        let pub_key_hash = hash_pub_key(&self.keypair.public_key());
        let (accumulated, spendable) = self.utxo.find_spendable_outputs(&pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(NodeError::InsufficientFunds {
                available: accumulated,
                required: amount,
            });
        }

        let mut inputs = Vec::new();
        for (txid, indexes) in &spendable {
            for &index in indexes {
                inputs.push(TxInput::new(
                    txid.clone(),
                    index as i32,
                    self.keypair.public_key(),
                    RefType::Token,
                ));
            }
        }
        let mut outputs = vec![TxOutput::new(amount, address)?];
        let change = accumulated - amount;
        if change > 0.0 {
            outputs.push(TxOutput::new(change, &self.address())?);
        }

        let mut tx = Transaction::new(inputs, outputs, tx_type)?;
        self.sign(&mut tx)?;
        Ok(tx)
    }

    /// Resolve every input's producing transaction from the chain and
    /// sign.
    fn sign(&self, tx: &mut Transaction) -> Result<(), NodeError> {
        let mut prev: HashMap<Vec<u8>, Transaction> = HashMap::new();
        for input in &tx.vin {
            if prev.contains_key(&input.prev_tx_id) {
                continue;
            }
            let prev_tx = self
                .store
                .find_transaction(&input.prev_tx_id)?
                .ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "transaction {}",
                        hex::encode(&input.prev_tx_id)
                    ))
                })?;
            prev.insert(prev_tx.id.clone(), prev_tx);
        }
        tx.sign(&self.keypair, &prev)?;
        Ok(())
    }

    /// Admit into the local mempool and hand to the full nodes.
    async fn submit(&self, tx: Transaction) -> Result<Transaction, NodeError> {
        debug!("submitting {}", tx);
        self.mempool.add(tx.clone());
        self.sync.broadcast_transaction(&tx).await?;
        Ok(tx)
    }
}

/// Drain the mempool channels: accepted blocks are mirrored into the
/// asset ledger, and queued-transaction events trigger mining cycles on
/// miner nodes.
async fn run_event_loop(
    sync: Arc<SyncService>,
    mut channels: MempoolChannels,
    cancel: CancellationToken,
    is_miner: bool,
    assets: Option<Arc<dyn AssetLedger>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            block = channels.blocks.recv() => match block {
                Some(block) => {
                    if let Some(ledger) = &assets {
                        mirror_assets(ledger.as_ref(), &block);
                    }
                }
                None => break,
            },
            tx = channels.txs.recv() => match tx {
                Some(tx) => {
                    debug!("queued {}", tx);
                    if is_miner {
                        match sync.mine_pending().await {
                            Ok(block) => debug!("cycle produced {}", block),
                            Err(SyncError::NothingToMine) => {
                                debug!("queue drained before this cycle")
                            }
                            Err(err) => warn!("mining cycle failed: {}", err),
                        }
                    }
                }
                None => break,
            },
        }
    }
}

/// Keep the host's asset table in step with an accepted block.
fn mirror_assets(ledger: &dyn AssetLedger, block: &Block) {
    for tx in &block.transactions {
        match tx.trans_type {
            TxType::Casting => {
                for output in &tx.vout {
                    if let Some(asset_id) = &output.asset_id {
                        if let Err(err) = ledger.record_asset(asset_id, &output.pub_key_hash) {
                            warn!("asset ledger record failed: {}", err);
                        }
                    }
                }
            }
            TxType::Destroy => {
                for output in &tx.vout {
                    if let Some(asset_id) = &output.asset_id {
                        if let Err(err) = ledger.remove_asset(asset_id) {
                            warn!("asset ledger remove failed: {}", err);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}
