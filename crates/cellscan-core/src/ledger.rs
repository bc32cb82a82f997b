//! Ledger store contract — the persistent repository behind ingestion.
//!
//! Every write method is atomic with respect to the entities it touches:
//! readers never observe a block without its transactions, or a transaction
//! flagged authentic while its cells are mid-insert. Implementations include
//! `MemoryLedger` and `SqliteLedger` in `cellscan-storage`.

use async_trait::async_trait;

use crate::cursor::{CursorStatus, SyncCursor};
use crate::error::SyncError;
use crate::types::{
    Account, Block, CellInput, CellOutput, ChainStatus, DecodedBlock, DisplayInput, DisplayOutput,
    OutPoint, Transaction,
};

/// A stored cell output viewed from the spending side: its capacity and the
/// account address its lock resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellWithOwner {
    pub capacity: u64,
    pub address_hash: Option<String>,
}

/// Repository of blocks, transactions, cells, scripts, accounts, and the sync
/// cursor.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a decoded block with all owned transactions, cells, and scripts
    /// in one unit, status `Pending`.
    ///
    /// An existing hash with non-abandoned status fails with
    /// [`SyncError::DuplicateHash`]. An existing abandoned row set is refreshed
    /// in place back to `Pending` (hash reuse across repeated reorgs).
    async fn insert_block(&self, block: &DecodedBlock) -> Result<(), SyncError>;

    /// Flip the named blocks and their transactions to `Authentic`, applying
    /// account deltas. Per hash: no-op if already authentic; fails with
    /// [`SyncError::OrphanBlock`] unless the parent is authentic or the block
    /// is genesis.
    ///
    /// Also derives the spend-side aggregates the decoder cannot compute
    /// without stored previous outputs: each transaction's fee (consumed
    /// minus created capacity) and the block's `total_transaction_fee` and
    /// `cell_consumed`.
    async fn mark_authentic(&self, hashes: &[String]) -> Result<(), SyncError>;

    /// Flip the named blocks and their transactions to `Abandoned`, reversing
    /// account deltas for blocks that were authentic. Idempotent: an already
    /// abandoned block is a no-op. Callers pass hashes newest-first so
    /// reversals run in reverse chronological order.
    async fn mark_abandoned(&self, hashes: &[String]) -> Result<(), SyncError>;

    async fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, SyncError>;

    /// The block at `number` carrying `status`, if any. At most one authentic
    /// block can exist per height.
    async fn block_at(&self, number: u64, status: ChainStatus)
        -> Result<Option<Block>, SyncError>;

    /// Height of the highest authentic block, `None` on an empty ledger.
    async fn latest_authentic_number(&self) -> Result<Option<u64>, SyncError>;

    async fn transaction_by_hash(&self, hash: &str) -> Result<Option<Transaction>, SyncError>;

    /// Hashes of the transactions owned by a block, in block order.
    async fn block_tx_hashes(&self, block_hash: &str) -> Result<Vec<String>, SyncError>;

    /// Ordered inputs of a stored transaction.
    async fn cell_inputs(&self, tx_hash: &str) -> Result<Vec<CellInput>, SyncError>;

    /// Ordered outputs of a stored transaction.
    async fn cell_outputs(&self, tx_hash: &str) -> Result<Vec<CellOutput>, SyncError>;

    async fn account(&self, address: &str) -> Result<Option<Account>, SyncError>;

    /// Look up a stored output by out-point, regardless of status. Used by the
    /// aggregation path and the display-refresh workers.
    async fn previous_cell(&self, out_point: &OutPoint) -> Result<Option<CellWithOwner>, SyncError>;

    /// Write back the derived display projections for one transaction.
    /// Returns `false` (without error) if the transaction is missing or
    /// abandoned — the refresh is simply skipped.
    async fn update_display_fields(
        &self,
        tx_hash: &str,
        inputs: Vec<DisplayInput>,
        outputs: Vec<DisplayOutput>,
    ) -> Result<bool, SyncError>;

    async fn cursor(&self, name: &str) -> Result<Option<SyncCursor>, SyncError>;

    async fn save_cursor(&self, cursor: SyncCursor) -> Result<(), SyncError>;

    /// Compare-and-swap advance of a named cursor: succeeds only when the
    /// stored value still equals `expected` (`None` = cursor absent). This is
    /// what enforces the single-writer ingestion contract.
    async fn advance_cursor(
        &self,
        name: &str,
        expected: Option<u64>,
        value: u64,
        status: CursorStatus,
    ) -> Result<bool, SyncError>;
}
