//! Synchronization protocol
//!
//! The handler state machine over the pub/sub topics: peers compare tip
//! heights, advertise block inventories, fetch bodies two-step via
//! getdata, and propagate transactions from clients through full nodes to
//! miners. Handler failures are logged and dropped — a bad message never
//! takes a peer down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use embercoin_core::{codec, Block, Transaction};
use embercoin_storage::{ChainStore, UtxoIndex};

use crate::mempool::{Mempool, Side};
use crate::message::{
    GetBlocksPayload, GetBlockPayload, GetTxPayload, HeightPayload, InvPayload, RequestMessage,
    VersionPayload, PROTOCOL_VERSION, TOPIC_BLOCK, TOPIC_FULLNODES_GET_DATA_TX,
    TOPIC_FULLNODES_TX, TOPIC_GET_BLOCKS, TOPIC_GET_DATA_BLOCK, TOPIC_HEIGHT, TOPIC_INV_BLOCK,
    TOPIC_MINING_INV_TX, TOPIC_MINING_TX, TOPIC_VERSION,
};
use crate::transport::{PubSub, TopicHandler};
use crate::SyncError;

/// Delay between successive getdata requests for inventoried blocks.
const GETDATA_SPACING: Duration = Duration::from_millis(500);

/// How long a peer is skipped after being picked by the catch-up timer.
const CONTACT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Catch-up period for full nodes.
const FULL_NODE_SYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Catch-up period for everyone else.
const LIGHT_NODE_SYNC_PERIOD: Duration = Duration::from_secs(20 * 60);

/// Sleep when no catch-up candidate is available.
const NO_PEER_SLEEP: Duration = Duration::from_secs(10 * 60);

/// Role and reward configuration for the sync service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub is_full_node: bool,
    pub is_miner_node: bool,
    /// Address credited by this node's coinbase when it mines.
    pub mining_address: String,
    /// Reward per mined block.
    pub subsidy: f64,
    pub version: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            is_full_node: true,
            is_miner_node: false,
            mining_address: String::new(),
            subsidy: 50.0,
            version: PROTOCOL_VERSION,
        }
    }
}

/// The protocol engine: owns the handlers, the catch-up timer, and the
/// mining cycle.
pub struct SyncService {
    transport: Arc<dyn PubSub>,
    store: Arc<ChainStore>,
    utxo: UtxoIndex,
    mempool: Arc<Mempool>,
    config: SyncConfig,
    last_contact: Mutex<HashMap<String, Instant>>,
    cancel: CancellationToken,
    // Handle to ourselves for handler closures and spawned tasks.
    weak: Weak<SyncService>,
}

impl SyncService {
    pub fn new(
        transport: Arc<dyn PubSub>,
        store: Arc<ChainStore>,
        utxo: UtxoIndex,
        mempool: Arc<Mempool>,
        config: SyncConfig,
        cancel: CancellationToken,
    ) -> Arc<SyncService> {
        Arc::new_cyclic(|weak| SyncService {
            transport,
            store,
            utxo,
            mempool,
            config,
            last_contact: Mutex::new(HashMap::new()),
            cancel,
            weak: weak.clone(),
        })
    }

    /// Subscribe every topic this node's role requires, start the catch-up
    /// timer, and announce ourselves.
    pub async fn start(&self) -> Result<(), SyncError> {
        let general = [
            TOPIC_VERSION,
            TOPIC_HEIGHT,
            TOPIC_GET_BLOCKS,
            TOPIC_INV_BLOCK,
            TOPIC_GET_DATA_BLOCK,
            TOPIC_BLOCK,
        ];
        for topic in general {
            self.subscribe(topic, true).await?;
        }
        if self.config.is_full_node {
            self.subscribe(TOPIC_FULLNODES_TX, true).await?;
            self.subscribe(TOPIC_FULLNODES_GET_DATA_TX, true).await?;
        }
        if self.config.is_miner_node {
            self.subscribe(TOPIC_MINING_INV_TX, true).await?;
            self.subscribe(TOPIC_MINING_TX, true).await?;
        }

        if let Some(service) = self.weak.upgrade() {
            tokio::spawn(async move { service.run_catch_up_timer().await });
        }

        self.send(
            TOPIC_VERSION,
            "",
            codec::encode(&VersionPayload {
                version: self.config.version,
            })?,
        )
        .await?;
        self.announce_height().await?;
        info!("sync service started as {}", self.transport.host_id());
        Ok(())
    }

    async fn subscribe(&self, topic: &'static str, subscriber: bool) -> Result<(), SyncError> {
        let service = match self.weak.upgrade() {
            Some(service) => service,
            None => return Ok(()),
        };
        let handler: TopicHandler = Arc::new(move |raw| {
            let service = Arc::clone(&service);
            Box::pin(async move { service.dispatch(topic, raw).await })
        });
        self.transport.subscribe(topic, handler, subscriber).await?;
        Ok(())
    }

    /// Decode the envelope, apply receiver filtering, and route to the
    /// topic handler. Every failure ends here as a log line.
    async fn dispatch(self: Arc<Self>, topic: &'static str, raw: Vec<u8>) {
        let msg = match RequestMessage::deserialize(&raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("dropping malformed message on {topic}: {err}");
                return;
            }
        };
        if !msg.is_for(&self.transport.host_id()) {
            return;
        }
        let result = match topic {
            TOPIC_VERSION => self.handle_version(&msg),
            TOPIC_HEIGHT => self.handle_height(&msg).await,
            TOPIC_GET_BLOCKS => self.handle_get_blocks(&msg).await,
            TOPIC_INV_BLOCK => self.handle_inv_block(&msg).await,
            TOPIC_GET_DATA_BLOCK => self.handle_get_data_block(&msg).await,
            TOPIC_BLOCK => self.handle_block(&msg).await,
            TOPIC_FULLNODES_TX => self.handle_fullnodes_tx(&msg).await,
            TOPIC_FULLNODES_GET_DATA_TX => self.handle_fullnodes_get_data_tx(&msg).await,
            TOPIC_MINING_INV_TX => self.handle_mining_inv_tx(&msg).await,
            TOPIC_MINING_TX => self.handle_mining_tx(&msg),
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!("handler for {} failed: {}", topic, err);
        }
    }

    pub(crate) fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub(crate) fn utxo(&self) -> &UtxoIndex {
        &self.utxo
    }

    pub(crate) fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub(crate) fn sync_config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn host_id(&self) -> String {
        self.transport.host_id()
    }

    /// Wrap and broadcast a payload. An empty `receiver` addresses the
    /// whole topic.
    pub(crate) async fn send(
        &self,
        topic: &str,
        receiver: &str,
        payload: Vec<u8>,
    ) -> Result<(), SyncError> {
        let msg = RequestMessage::new(&self.transport.host_id(), receiver, payload);
        self.transport
            .broadcast_with_topic(topic, msg.serialize()?)
            .await?;
        Ok(())
    }

    /// Broadcast our tip height to the whole network.
    pub async fn announce_height(&self) -> Result<(), SyncError> {
        let height = self.store.get_best_height()?;
        self.send(
            TOPIC_HEIGHT,
            "",
            codec::encode(&HeightPayload { height })?,
        )
        .await
    }

    /// Hand a freshly built local transaction to the full nodes.
    pub async fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), SyncError> {
        self.send(TOPIC_FULLNODES_TX, "", tx.serialize()?).await
    }

    fn handle_version(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let payload: VersionPayload = codec::decode(&msg.payload)?;
        debug!("peer {} speaks protocol {}", msg.sender, payload.version);
        Ok(())
    }

    /// Height comparison drives catch-up: a peer that is behind asks us
    /// for blocks, a peer that is ahead learns our height and will ask.
    async fn handle_height(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let payload: HeightPayload = codec::decode(&msg.payload)?;
        let local = self.store.get_best_height()?;
        if local < payload.height {
            let full_nodes = self.transport.list_peers(TOPIC_FULLNODES_TX).await;
            if full_nodes.contains(&msg.sender) {
                debug!(
                    "behind peer {} ({} < {}), requesting blocks",
                    msg.sender, local, payload.height
                );
                self.send(
                    TOPIC_GET_BLOCKS,
                    &msg.sender,
                    codec::encode(&GetBlocksPayload { height: local })?,
                )
                .await?;
            }
        } else if local > payload.height {
            self.send(
                TOPIC_HEIGHT,
                &msg.sender,
                codec::encode(&HeightPayload { height: local })?,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_get_blocks(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let payload: GetBlocksPayload = codec::decode(&msg.payload)?;
        let items = self.store.get_block_hashes(payload.height)?;
        debug!(
            "advertising {} blocks above height {} to {}",
            items.len(),
            payload.height,
            msg.sender
        );
        self.send(
            TOPIC_INV_BLOCK,
            &msg.sender,
            codec::encode(&InvPayload { items })?,
        )
        .await
    }

    /// Request every inventoried block body, spaced to avoid a burst.
    async fn handle_inv_block(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let payload: InvPayload = codec::decode(&msg.payload)?;
        for (index, hash) in payload.items.into_iter().enumerate() {
            if index > 0 {
                sleep(GETDATA_SPACING).await;
            }
            self.mempool.push_in_transit(hash.clone());
            self.send(
                TOPIC_GET_DATA_BLOCK,
                &msg.sender,
                codec::encode(&GetBlockPayload {
                    hash,
                    is_miner: self.config.is_miner_node,
                })?,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_get_data_block(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let payload: GetBlockPayload = codec::decode(&msg.payload)?;
        let block = self.store.get_block(&payload.hash)?;
        self.send(TOPIC_BLOCK, &msg.sender, block.serialize()?).await
    }

    /// Attempt to append a received block. Success folds it into the UTXO
    /// index; once nothing is left in transit, the index is rebuilt from
    /// scratch as a defensive resync.
    async fn handle_block(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let block = Block::deserialize(&msg.payload)?;
        match self.store.add_block(&block) {
            Ok(true) => {
                self.utxo.update(&block)?;
                self.mempool.remove_in_transit(&block.hash);
                info!("accepted {} from {}", block, msg.sender);
                self.mempool.notify_block(block);
                if let Some(next) = self.mempool.first_in_transit() {
                    self.send(
                        TOPIC_GET_DATA_BLOCK,
                        &msg.sender,
                        codec::encode(&GetBlockPayload {
                            hash: next,
                            is_miner: self.config.is_miner_node,
                        })?,
                    )
                    .await?;
                } else {
                    self.utxo.compute()?;
                }
            }
            Ok(false) => {
                // Redelivery of a block we already hold.
                self.mempool.remove_in_transit(&block.hash);
            }
            Err(err) => {
                // Kept in transit: a block that ran ahead of its parent
                // becomes acceptable later and is re-requested after the
                // next successful append.
                warn!(
                    "rejected block {} from {}: {}",
                    hex::encode(&block.hash),
                    msg.sender,
                    err
                );
            }
        }
        Ok(())
    }

    /// Full nodes admit client transactions and advertise their pending
    /// set to the miners.
    async fn handle_fullnodes_tx(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let tx = Transaction::deserialize(&msg.payload)?;
        if tx.is_coinbase() {
            warn!("ignoring coinbase submitted by {}", msg.sender);
            return Ok(());
        }
        self.store.verify_transaction(&tx)?;
        debug!("admitting {} from {}", tx, msg.sender);
        self.mempool.add(tx);

        let items = self.mempool.pending_ids();
        if !items.is_empty() {
            self.send(TOPIC_MINING_INV_TX, "", codec::encode(&InvPayload { items })?)
                .await?;
        }
        Ok(())
    }

    async fn handle_fullnodes_get_data_tx(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let payload: GetTxPayload = codec::decode(&msg.payload)?;
        let id_hex = hex::encode(&payload.id);
        match self.mempool.get_pending(&id_hex) {
            Some(tx) => self.send(TOPIC_MINING_TX, &msg.sender, tx.serialize()?).await,
            None => {
                debug!("transaction {} not in this mempool", id_hex);
                Ok(())
            }
        }
    }

    /// Miners queue known transactions for the next cycle and fetch the
    /// bodies of unknown ones.
    async fn handle_mining_inv_tx(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let payload: InvPayload = codec::decode(&msg.payload)?;
        for id in payload.items {
            let id_hex = hex::encode(&id);
            match self.mempool.get_pending(&id_hex) {
                Some(tx) => {
                    self.mempool.move_to(&id_hex, Side::Queued);
                    self.mempool.notify_tx(tx);
                }
                None => {
                    self.send(
                        TOPIC_FULLNODES_GET_DATA_TX,
                        &msg.sender,
                        codec::encode(&GetTxPayload { id })?,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    fn handle_mining_tx(&self, msg: &RequestMessage) -> Result<(), SyncError> {
        let tx = Transaction::deserialize(&msg.payload)?;
        if tx.is_coinbase() {
            warn!("ignoring coinbase submitted by {}", msg.sender);
            return Ok(());
        }
        self.store.verify_transaction(&tx)?;
        let id_hex = hex::encode(&tx.id);
        self.mempool.add(tx.clone());
        self.mempool.move_to(&id_hex, Side::Queued);
        self.mempool.notify_tx(tx);
        Ok(())
    }

    /// Periodic catch-up: pick one full node we have not contacted
    /// recently and compare heights with the whole topic.
    async fn run_catch_up_timer(self: Arc<Self>) {
        let period = if self.config.is_full_node {
            FULL_NODE_SYNC_PERIOD
        } else {
            LIGHT_NODE_SYNC_PERIOD
        };
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(period) => {}
            }
            match self.pick_catch_up_peer().await {
                Some(peer) => {
                    debug!("catch-up round via {}", peer);
                    self.last_contact
                        .lock()
                        .unwrap()
                        .insert(peer, Instant::now());
                    if let Err(err) = self.announce_height().await {
                        warn!("catch-up announcement failed: {}", err);
                    }
                }
                None => {
                    debug!("no catch-up candidate, sleeping");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(NO_PEER_SLEEP) => {}
                    }
                }
            }
        }
    }

    async fn pick_catch_up_peer(&self) -> Option<String> {
        let host = self.transport.host_id();
        let contacts = self.last_contact.lock().unwrap().clone();
        let candidates: Vec<String> = self
            .transport
            .list_peers(TOPIC_FULLNODES_TX)
            .await
            .into_iter()
            .filter(|peer| *peer != host)
            .filter(|peer| {
                contacts
                    .get(peer)
                    .map_or(true, |at| at.elapsed() >= CONTACT_COOLDOWN)
            })
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}
