//! Embercoin networking
//!
//! The synchronization protocol by which peers converge on a common chain:
//! topic constants and wire messages, the pub/sub transport contract, the
//! mempool feeding the node's event loop, and the handler state machine
//! for chain catch-up, transaction propagation, and mining.

use thiserror::Error;

use embercoin_core::{CodecError, TransactionError};
use embercoin_storage::StoreError;

pub mod mempool;
pub mod message;
pub mod miner;
pub mod sync;
pub mod transport;

pub use mempool::{Mempool, MempoolChannels, Side};
pub use message::RequestMessage;
pub use sync::{SyncConfig, SyncService};
pub use transport::{LocalBus, PubSub, TopicHandler, TransportError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The queued transaction set emptied out before a block could be
    /// assembled; the mining cycle aborts and the mempool stays untouched.
    #[error("no valid transactions to mine")]
    NothingToMine,

    #[error("mining cycle failed: {0}")]
    Mining(String),
}
