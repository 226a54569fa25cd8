//! Mining cycle
//!
//! A miner drains its queued transactions into a block: filter them by
//! validity, append a fresh coinbase, search for a nonce on a blocking
//! thread, commit, fold into the UTXO index, and announce the new tip.
//! Any failure leaves the mempool untouched and announces nothing.

use std::sync::Arc;

use log::{info, warn};

use embercoin_core::{codec, current_timestamp, Transaction};

use crate::message::{InvPayload, TOPIC_INV_BLOCK};
use crate::sync::SyncService;
use crate::SyncError;

impl SyncService {
    /// Run one mining cycle over the queued transactions. Returns the
    /// mined block, or [`SyncError::NothingToMine`] when no queued
    /// transaction survives validation.
    pub async fn mine_pending(&self) -> Result<embercoin_core::Block, SyncError> {
        self.mempool().begin_mining();
        let result = self.mine_cycle().await;
        self.mempool().finish_mining();

        match result {
            Ok(block) => {
                self.send(
                    TOPIC_INV_BLOCK,
                    "",
                    codec::encode(&InvPayload {
                        items: vec![block.hash.clone()],
                    })?,
                )
                .await?;
                self.mempool().clear_all();
                self.mempool().notify_block(block.clone());
                info!("mined and announced {}", block);
                Ok(block)
            }
            Err(err) => Err(err),
        }
    }

    async fn mine_cycle(&self) -> Result<embercoin_core::Block, SyncError> {
        let mut transactions = Vec::new();
        for tx in self.mempool().queued_transactions() {
            match self.store().verify_transaction(&tx) {
                Ok(()) => transactions.push(tx),
                Err(err) => warn!("dropping invalid queued transaction: {}", err),
            }
        }
        if transactions.is_empty() {
            return Err(SyncError::NothingToMine);
        }

        // Tag the coinbase with host, time, and a random salt so two
        // cycles in the same second still produce distinct ids.
        let tag = format!(
            "mined by {} at {} / {:016x}",
            self.host_id(),
            current_timestamp(),
            rand::random::<u64>()
        );
        let coinbase = Transaction::new_coinbase(
            &self.sync_config().mining_address,
            tag.as_bytes(),
            self.sync_config().subsidy,
        )?;
        transactions.push(coinbase);

        let store = Arc::clone(self.store());
        let block = tokio::task::spawn_blocking(move || store.mine_block(transactions))
            .await
            .map_err(|err| SyncError::Mining(err.to_string()))??;
        self.utxo().update(&block)?;
        Ok(block)
    }
}
