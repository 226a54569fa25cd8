//! Mempool
//!
//! Two tables of transactions keyed by hex id: `pending` (received, not
//! yet scheduled) and `queued` (about to be mined), plus the list of block
//! hashes requested but not yet received. Handlers run concurrently, so
//! every table sits behind a mutex. Two bounded channels feed the node's
//! event loop, and a latch tracks mining cycles in flight. Nothing here is
//! persisted across restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use log::warn;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use embercoin_core::{Block, Transaction};

/// Capacity of the block and transaction event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 200;

/// Which mempool table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Pending,
    Queued,
}

/// Receivers handed to the node's event loop.
pub struct MempoolChannels {
    pub blocks: mpsc::Receiver<Block>,
    pub txs: mpsc::Receiver<Transaction>,
}

pub struct Mempool {
    pending: Mutex<HashMap<String, Transaction>>,
    queued: Mutex<HashMap<String, Transaction>>,
    blocks_in_transit: Mutex<Vec<Vec<u8>>>,
    block_events: mpsc::Sender<Block>,
    tx_events: mpsc::Sender<Transaction>,
    mining: MiningLatch,
}

impl Mempool {
    pub fn new() -> (std::sync::Arc<Mempool>, MempoolChannels) {
        let (block_events, blocks) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (tx_events, txs) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mempool = std::sync::Arc::new(Mempool {
            pending: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            blocks_in_transit: Mutex::new(Vec::new()),
            block_events,
            tx_events,
            mining: MiningLatch::new(),
        });
        (mempool, MempoolChannels { blocks, txs })
    }

    fn table(&self, side: Side) -> &Mutex<HashMap<String, Transaction>> {
        match side {
            Side::Pending => &self.pending,
            Side::Queued => &self.queued,
        }
    }

    /// Admit a transaction into `pending`.
    pub fn add(&self, tx: Transaction) {
        let id = hex::encode(&tx.id);
        self.pending.lock().unwrap().insert(id, tx);
    }

    pub fn contains_pending(&self, id_hex: &str) -> bool {
        self.pending.lock().unwrap().contains_key(id_hex)
    }

    pub fn get_pending(&self, id_hex: &str) -> Option<Transaction> {
        self.pending.lock().unwrap().get(id_hex).cloned()
    }

    /// Move a transaction into `dest`, removing it from the other table.
    pub fn move_to(&self, id_hex: &str, dest: Side) {
        let source = match dest {
            Side::Pending => Side::Queued,
            Side::Queued => Side::Pending,
        };
        let moved = self.table(source).lock().unwrap().remove(id_hex);
        if let Some(tx) = moved {
            self.table(dest).lock().unwrap().insert(id_hex.to_string(), tx);
        }
    }

    pub fn remove(&self, id_hex: &str, side: Side) {
        self.table(side).lock().unwrap().remove(id_hex);
    }

    /// Empty both tables.
    pub fn clear_all(&self) {
        self.pending.lock().unwrap().clear();
        self.queued.lock().unwrap().clear();
    }

    /// Up to `n` pending transactions, in arbitrary order.
    pub fn get_transactions(&self, n: usize) -> Vec<Transaction> {
        self.pending
            .lock()
            .unwrap()
            .values()
            .take(n)
            .cloned()
            .collect()
    }

    /// Ids of every pending transaction.
    pub fn pending_ids(&self) -> Vec<Vec<u8>> {
        self.pending
            .lock()
            .unwrap()
            .values()
            .map(|tx| tx.id.clone())
            .collect()
    }

    /// Every queued transaction, in arbitrary order.
    pub fn queued_transactions(&self) -> Vec<Transaction> {
        self.queued.lock().unwrap().values().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    // Blocks requested from peers but not yet received.

    pub fn push_in_transit(&self, hash: Vec<u8>) {
        let mut transit = self.blocks_in_transit.lock().unwrap();
        if !transit.contains(&hash) {
            transit.push(hash);
        }
    }

    pub fn remove_in_transit(&self, hash: &[u8]) {
        self.blocks_in_transit
            .lock()
            .unwrap()
            .retain(|pending| pending != hash);
    }

    pub fn first_in_transit(&self) -> Option<Vec<u8>> {
        self.blocks_in_transit.lock().unwrap().first().cloned()
    }

    pub fn in_transit_len(&self) -> usize {
        self.blocks_in_transit.lock().unwrap().len()
    }

    // Event channels feeding the node's event loop. A full channel drops
    // the event with a warning rather than blocking a handler.

    pub fn notify_block(&self, block: Block) {
        if let Err(err) = self.block_events.try_send(block) {
            warn!("block event channel full, dropping event: {err}");
        }
    }

    pub fn notify_tx(&self, tx: Transaction) {
        if let Err(err) = self.tx_events.try_send(tx) {
            warn!("tx event channel full, dropping event: {err}");
        }
    }

    // Mining-cycle latch.

    pub fn begin_mining(&self) {
        self.mining.add();
    }

    pub fn finish_mining(&self) {
        self.mining.done();
    }

    /// Wait until no mining cycle is in flight.
    pub async fn wait_mining_idle(&self) {
        self.mining.wait_idle().await;
    }
}

/// Count-down latch for mining cycles: `add` on entry, `done` on exit,
/// `wait_idle` parks until the count returns to zero.
struct MiningLatch {
    count: Mutex<u32>,
    idle: Notify,
}

impl MiningLatch {
    fn new() -> MiningLatch {
        MiningLatch {
            count: Mutex::new(0),
            idle: Notify::new(),
        }
    }

    fn add(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking, so a notify between the check and
            // the await is not lost.
            notified.as_mut().enable();
            if *self.count.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embercoin_crypto::{get_address, Keypair};

    fn sample_tx(tag: &str) -> Transaction {
        let address = get_address(&Keypair::random().public_key());
        Transaction::new_coinbase(&address, tag.as_bytes(), 50.0).unwrap()
    }

    #[tokio::test]
    async fn add_move_remove() {
        let (mempool, _channels) = Mempool::new();
        let tx = sample_tx("a");
        let id = hex::encode(&tx.id);

        mempool.add(tx);
        assert!(mempool.contains_pending(&id));
        assert_eq!(mempool.pending_len(), 1);

        mempool.move_to(&id, Side::Queued);
        assert!(!mempool.contains_pending(&id));
        assert_eq!(mempool.queued_len(), 1);

        mempool.move_to(&id, Side::Pending);
        assert_eq!(mempool.pending_len(), 1);
        assert_eq!(mempool.queued_len(), 0);

        mempool.remove(&id, Side::Pending);
        assert_eq!(mempool.pending_len(), 0);
    }

    #[tokio::test]
    async fn clear_all_empties_both_tables() {
        let (mempool, _channels) = Mempool::new();
        mempool.add(sample_tx("a"));
        let tx = sample_tx("b");
        let id = hex::encode(&tx.id);
        mempool.add(tx);
        mempool.move_to(&id, Side::Queued);

        mempool.clear_all();
        assert_eq!(mempool.pending_len(), 0);
        assert_eq!(mempool.queued_len(), 0);
    }

    #[tokio::test]
    async fn get_transactions_caps_at_n() {
        let (mempool, _channels) = Mempool::new();
        for i in 0..5 {
            mempool.add(sample_tx(&format!("tx-{i}")));
        }
        assert_eq!(mempool.get_transactions(3).len(), 3);
        assert_eq!(mempool.get_transactions(10).len(), 5);
    }

    #[tokio::test]
    async fn transit_list_deduplicates() {
        let (mempool, _channels) = Mempool::new();
        mempool.push_in_transit(vec![1]);
        mempool.push_in_transit(vec![2]);
        mempool.push_in_transit(vec![1]);
        assert_eq!(mempool.in_transit_len(), 2);
        assert_eq!(mempool.first_in_transit(), Some(vec![1]));

        mempool.remove_in_transit(&[1]);
        assert_eq!(mempool.first_in_transit(), Some(vec![2]));
    }

    #[tokio::test]
    async fn events_reach_the_channels() {
        let (mempool, mut channels) = Mempool::new();
        mempool.notify_tx(sample_tx("evt"));
        let received = channels.txs.recv().await.unwrap();
        assert!(received.is_coinbase());
    }

    #[tokio::test]
    async fn latch_waits_for_active_cycles() {
        let (mempool, _channels) = Mempool::new();
        // Idle latch returns immediately.
        mempool.wait_mining_idle().await;

        mempool.begin_mining();
        let waiter = {
            let mempool = std::sync::Arc::clone(&mempool);
            tokio::spawn(async move {
                mempool.wait_mining_idle().await;
            })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        mempool.finish_mining();
        tokio::time::timeout(tokio::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
