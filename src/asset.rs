//! Asset record side-table
//!
//! The reference deployment keeps an `asset(id, assetID, pkScript)` table
//! in a separate SQL database. That store is an external collaborator:
//! consensus never reads it, so the node only needs this narrow interface
//! to keep it in step with accepted blocks.

/// Errors are the collaborator's own; the node logs and moves on.
pub type AssetResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// CRUD surface of the host's asset record store.
pub trait AssetLedger: Send + Sync {
    /// Record a freshly minted asset and the script it is locked under.
    fn record_asset(&self, asset_id: &[u8], pk_script: &[u8]) -> AssetResult<()>;

    /// Drop the record of a destroyed asset.
    fn remove_asset(&self, asset_id: &[u8]) -> AssetResult<()>;

    /// Look up the locking script recorded for an asset.
    fn find_asset(&self, asset_id: &[u8]) -> AssetResult<Option<Vec<u8>>>;
}
