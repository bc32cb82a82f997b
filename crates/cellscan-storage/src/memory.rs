//! In-memory ledger backend.
//!
//! Holds the full explorer data set in RAM behind one mutex, so every write
//! method is trivially atomic. Useful for tests and short-lived ingestion runs
//! that don't need persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use cellscan_core::account::transaction_deltas;
use cellscan_core::cursor::{CursorStatus, SyncCursor};
use cellscan_core::error::SyncError;
use cellscan_core::ledger::{CellWithOwner, LedgerStore};
use cellscan_core::types::{
    Account, Block, CellInput, CellOutput, ChainStatus, DecodedBlock, DecodedTransaction,
    DisplayInput, DisplayOutput, OutPoint, Transaction, UncleBlock,
};

#[derive(Default)]
struct Inner {
    /// Blocks by hash. Rows are never removed; reorg flips status.
    blocks: HashMap<String, Block>,
    uncles: Vec<UncleBlock>,
    transactions: HashMap<String, Transaction>,
    /// Block hash → owned transaction hashes, in block order.
    block_txs: HashMap<String, Vec<String>>,
    inputs: HashMap<String, Vec<CellInput>>,
    outputs: HashMap<String, Vec<CellOutput>>,
    accounts: HashMap<String, Account>,
    cursors: HashMap<String, SyncCursor>,
}

impl Inner {
    fn resolve(&self, out_point: &OutPoint) -> Option<CellWithOwner> {
        let cell = self
            .outputs
            .get(&out_point.tx_hash)?
            .get(out_point.index as usize)?;
        Some(CellWithOwner {
            capacity: cell.capacity,
            address_hash: cell.lock_script.address_hash().map(str::to_string),
        })
    }

    /// Rebuild the decoded view of a stored transaction for delta computation.
    fn decoded_tx(&self, tx_hash: &str) -> Option<DecodedTransaction> {
        Some(DecodedTransaction {
            transaction: self.transactions.get(tx_hash)?.clone(),
            inputs: self.inputs.get(tx_hash).cloned().unwrap_or_default(),
            outputs: self.outputs.get(tx_hash).cloned().unwrap_or_default(),
        })
    }

    /// Apply (forward) or reverse the account deltas of every transaction in
    /// a block. The forward pass also derives the spend-side aggregates the
    /// decoder cannot know: per-transaction fees and the block's
    /// `total_transaction_fee` / `cell_consumed`.
    fn apply_block_deltas(&mut self, block_hash: &str, reverse: bool) {
        let mut tx_hashes = self.block_txs.get(block_hash).cloned().unwrap_or_default();
        if reverse {
            tx_hashes.reverse();
        }

        let mut block_fee: u64 = 0;
        let mut block_consumed: u64 = 0;

        for tx_hash in tx_hashes {
            let Some(tx) = self.decoded_tx(&tx_hash) else {
                continue;
            };
            let deltas = transaction_deltas(&tx, |op| self.resolve(op));
            for delta in deltas {
                let delta = if reverse { delta.reversed() } else { delta };
                let account = self
                    .accounts
                    .entry(delta.address_hash.clone())
                    .or_insert_with(|| Account::new(&delta.address_hash));
                account.apply(&delta);
            }

            if !reverse {
                let consumed: u64 = tx
                    .inputs
                    .iter()
                    .filter_map(|input| input.previous_output.as_ref())
                    .filter_map(|op| self.resolve(op))
                    .map(|cell| cell.capacity)
                    .sum();
                let created: u64 = tx.outputs.iter().map(|o| o.capacity).sum();
                let fee = consumed.saturating_sub(created);
                block_fee += fee;
                block_consumed += consumed;
                if let Some(row) = self.transactions.get_mut(&tx_hash) {
                    row.transaction_fee = fee;
                }
            }
        }

        if !reverse {
            if let Some(block) = self.blocks.get_mut(block_hash) {
                block.total_transaction_fee = block_fee;
                block.cell_consumed = block_consumed;
            }
        }
    }

    fn set_block_status(&mut self, block_hash: &str, status: ChainStatus) {
        if let Some(block) = self.blocks.get_mut(block_hash) {
            block.status = status;
        }
        for tx_hash in self.block_txs.get(block_hash).cloned().unwrap_or_default() {
            if let Some(tx) = self.transactions.get_mut(&tx_hash) {
                tx.status = status;
            }
        }
    }
}

/// In-memory [`LedgerStore`]. All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored block rows across all statuses (test helper).
    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn insert_block(&self, decoded: &DecodedBlock) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let hash = decoded.block.block_hash.clone();

        if let Some(existing) = inner.blocks.get(&hash) {
            if existing.status != ChainStatus::Abandoned {
                return Err(SyncError::DuplicateHash { hash });
            }
        }

        // A transaction re-mined on this block may already sit under an
        // abandoned block; any other live holder of the hash is a duplicate.
        for tx in &decoded.transactions {
            if let Some(existing) = inner.transactions.get(&tx.transaction.tx_hash) {
                if existing.status != ChainStatus::Abandoned && existing.block_hash != hash {
                    return Err(SyncError::DuplicateHash {
                        hash: tx.transaction.tx_hash.clone(),
                    });
                }
            }
        }

        if inner.blocks.contains_key(&hash) {
            // Abandoned row set: refresh in place back to pending.
            inner.uncles.retain(|u| u.owner_hash != hash);
            if let Some(old_txs) = inner.block_txs.remove(&hash) {
                for tx_hash in old_txs {
                    inner.transactions.remove(&tx_hash);
                    inner.inputs.remove(&tx_hash);
                    inner.outputs.remove(&tx_hash);
                }
            }
        }

        // Detach re-mined transactions from their abandoned former owners so
        // a later refresh of those blocks cannot touch the re-owned rows.
        for tx in &decoded.transactions {
            let tx_hash = &tx.transaction.tx_hash;
            let old_owner = inner
                .transactions
                .get(tx_hash)
                .map(|t| t.block_hash.clone());
            if let Some(old_owner) = old_owner {
                if let Some(owned) = inner.block_txs.get_mut(&old_owner) {
                    owned.retain(|h| h != tx_hash);
                }
            }
        }

        let mut block = decoded.block.clone();
        block.status = ChainStatus::Pending;
        inner.blocks.insert(hash.clone(), block);
        inner.uncles.extend(decoded.uncles.iter().cloned());

        let mut tx_hashes = Vec::with_capacity(decoded.transactions.len());
        for tx in &decoded.transactions {
            let mut row = tx.transaction.clone();
            row.status = ChainStatus::Pending;
            tx_hashes.push(row.tx_hash.clone());
            inner.inputs.insert(row.tx_hash.clone(), tx.inputs.clone());
            inner.outputs.insert(row.tx_hash.clone(), tx.outputs.clone());
            inner.transactions.insert(row.tx_hash.clone(), row);
        }
        inner.block_txs.insert(hash.clone(), tx_hashes);

        debug!(block = %hash, number = decoded.block.number, "block stored");
        Ok(())
    }

    async fn mark_authentic(&self, hashes: &[String]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        for hash in hashes {
            let block = inner
                .blocks
                .get(hash)
                .cloned()
                .ok_or_else(|| SyncError::Other(format!("unknown block {hash}")))?;

            if block.status == ChainStatus::Authentic {
                continue; // idempotent
            }

            // Invariant: at most one authentic block per height.
            let conflicting = inner.blocks.values().any(|b| {
                b.number == block.number
                    && b.status == ChainStatus::Authentic
                    && b.block_hash != block.block_hash
            });
            if conflicting {
                return Err(SyncError::Storage(format!(
                    "height {} already has an authentic block",
                    block.number
                )));
            }

            if block.number > 0 {
                let parent_ok = inner
                    .blocks
                    .get(&block.parent_hash)
                    .is_some_and(|p| p.status == ChainStatus::Authentic);
                if !parent_ok {
                    return Err(SyncError::OrphanBlock { hash: hash.clone() });
                }
            }

            inner.set_block_status(hash, ChainStatus::Authentic);
            inner.apply_block_deltas(hash, false);
        }
        Ok(())
    }

    async fn mark_abandoned(&self, hashes: &[String]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        for hash in hashes {
            let Some(block) = inner.blocks.get(hash).cloned() else {
                return Err(SyncError::Other(format!("unknown block {hash}")));
            };
            match block.status {
                ChainStatus::Abandoned => continue, // idempotent
                ChainStatus::Authentic => {
                    inner.apply_block_deltas(hash, true);
                    inner.set_block_status(hash, ChainStatus::Abandoned);
                }
                ChainStatus::Pending => inner.set_block_status(hash, ChainStatus::Abandoned),
            }
        }
        Ok(())
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, SyncError> {
        Ok(self.inner.lock().unwrap().blocks.get(hash).cloned())
    }

    async fn block_at(
        &self,
        number: u64,
        status: ChainStatus,
    ) -> Result<Option<Block>, SyncError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blocks
            .values()
            .find(|b| b.number == number && b.status == status)
            .cloned())
    }

    async fn latest_authentic_number(&self) -> Result<Option<u64>, SyncError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blocks
            .values()
            .filter(|b| b.status == ChainStatus::Authentic)
            .map(|b| b.number)
            .max())
    }

    async fn transaction_by_hash(&self, hash: &str) -> Result<Option<Transaction>, SyncError> {
        Ok(self.inner.lock().unwrap().transactions.get(hash).cloned())
    }

    async fn block_tx_hashes(&self, block_hash: &str) -> Result<Vec<String>, SyncError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .block_txs
            .get(block_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn cell_inputs(&self, tx_hash: &str) -> Result<Vec<CellInput>, SyncError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .inputs
            .get(tx_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn cell_outputs(&self, tx_hash: &str) -> Result<Vec<CellOutput>, SyncError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .outputs
            .get(tx_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn account(&self, address: &str) -> Result<Option<Account>, SyncError> {
        Ok(self.inner.lock().unwrap().accounts.get(address).cloned())
    }

    async fn previous_cell(
        &self,
        out_point: &OutPoint,
    ) -> Result<Option<CellWithOwner>, SyncError> {
        Ok(self.inner.lock().unwrap().resolve(out_point))
    }

    async fn update_display_fields(
        &self,
        tx_hash: &str,
        inputs: Vec<DisplayInput>,
        outputs: Vec<DisplayOutput>,
    ) -> Result<bool, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.transactions.get_mut(tx_hash) {
            Some(tx) if tx.status != ChainStatus::Abandoned => {
                tx.display_inputs = Some(inputs);
                tx.display_outputs = Some(outputs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cursor(&self, name: &str) -> Result<Option<SyncCursor>, SyncError> {
        Ok(self.inner.lock().unwrap().cursors.get(name).cloned())
    }

    async fn save_cursor(&self, cursor: SyncCursor) -> Result<(), SyncError> {
        self.inner
            .lock()
            .unwrap()
            .cursors
            .insert(cursor.name.clone(), cursor);
        Ok(())
    }

    async fn advance_cursor(
        &self,
        name: &str,
        expected: Option<u64>,
        value: u64,
        status: CursorStatus,
    ) -> Result<bool, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.cursors.get(name).map(|c| c.value);
        if current != expected {
            return Ok(false);
        }
        match inner.cursors.get_mut(name) {
            Some(cursor) => cursor.advance(value, status),
            None => {
                inner
                    .cursors
                    .insert(name.to_string(), SyncCursor::new(name, value, status));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellscan_core::cursor::TIP_CURSOR;
    use cellscan_core::types::Script;

    fn lock(address: &str) -> Script {
        Script {
            code_hash: "0xcode".into(),
            version: 0,
            args: vec![address.to_string()],
        }
    }

    fn header(number: u64, hash: &str, parent: &str) -> Block {
        Block {
            block_hash: hash.into(),
            parent_hash: parent.into(),
            number,
            timestamp: (number * 8000) as i64,
            difficulty: "0x100".into(),
            miner_hash: "0xminer".into(),
            version: 0,
            reward: 0,
            total_transaction_fee: 0,
            total_cell_capacity: 0,
            cell_consumed: 0,
            tx_count: 1,
            uncles_count: 0,
            uncle_block_hashes: vec![],
            status: ChainStatus::Pending,
        }
    }

    fn cellbase_tx(hash: &str, block: &Block, to: &str, capacity: u64) -> DecodedTransaction {
        DecodedTransaction {
            transaction: Transaction {
                tx_hash: hash.into(),
                block_hash: block.block_hash.clone(),
                block_number: block.number,
                block_timestamp: block.timestamp,
                deps: vec![],
                status: ChainStatus::Pending,
                transaction_fee: 0,
                version: 0,
                display_inputs: None,
                display_outputs: None,
            },
            inputs: vec![CellInput { previous_output: None, args: vec![] }],
            outputs: vec![CellOutput {
                capacity,
                data: "0x".into(),
                lock_script: lock(to),
                type_script: None,
            }],
        }
    }

    /// Block with a single cellbase transaction paying `capacity` to `to`.
    fn cellbase_block(number: u64, hash: &str, parent: &str, to: &str, capacity: u64) -> DecodedBlock {
        let block = header(number, hash, parent);
        let tx = cellbase_tx(&format!("{hash}-cb"), &block, to, capacity);
        DecodedBlock { block, uncles: vec![], transactions: vec![tx] }
    }

    async fn seed_genesis(store: &MemoryLedger) {
        store
            .insert_block(&cellbase_block(0, "0xg", "0x0", "0xgenesis", 0))
            .await
            .unwrap();
        store.mark_authentic(&["0xg".into()]).await.unwrap();
    }

    #[tokio::test]
    async fn insert_then_authentic_updates_accounts() {
        let store = MemoryLedger::new();
        seed_genesis(&store).await;

        store
            .insert_block(&cellbase_block(1, "0xb1", "0xg", "0xX", 1000))
            .await
            .unwrap();
        store.mark_authentic(&["0xb1".into()]).await.unwrap();

        assert_eq!(store.latest_authentic_number().await.unwrap(), Some(1));
        let x = store.account("0xX").await.unwrap().unwrap();
        assert_eq!(x.balance, 1000);
        assert_eq!(x.transactions_count, 1);
    }

    #[tokio::test]
    async fn duplicate_hash_rejected_unless_abandoned() {
        let store = MemoryLedger::new();
        let b = cellbase_block(0, "0xg", "0x0", "0xX", 10);
        store.insert_block(&b).await.unwrap();

        let err = store.insert_block(&b).await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateHash { .. }));

        // After abandoning, the same hash may be refreshed in place.
        store.mark_abandoned(&["0xg".into()]).await.unwrap();
        store.insert_block(&b).await.unwrap();
        assert_eq!(store.block_count(), 1);
        let row = store.block_by_hash("0xg").await.unwrap().unwrap();
        assert_eq!(row.status, ChainStatus::Pending);
    }

    #[tokio::test]
    async fn orphan_rejected_without_authentic_parent() {
        let store = MemoryLedger::new();
        store
            .insert_block(&cellbase_block(5, "0xb5", "0xb4-missing", "0xX", 10))
            .await
            .unwrap();
        let err = store.mark_authentic(&["0xb5".into()]).await.unwrap_err();
        assert!(matches!(err, SyncError::OrphanBlock { .. }));
    }

    #[tokio::test]
    async fn one_authentic_block_per_height() {
        let store = MemoryLedger::new();
        seed_genesis(&store).await;
        store
            .insert_block(&cellbase_block(1, "0xb1", "0xg", "0xX", 10))
            .await
            .unwrap();
        store.mark_authentic(&["0xb1".into()]).await.unwrap();

        store
            .insert_block(&cellbase_block(1, "0xb1prime", "0xg", "0xY", 10))
            .await
            .unwrap();
        let err = store.mark_authentic(&["0xb1prime".into()]).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[tokio::test]
    async fn abandon_is_idempotent_and_reverses_balances() {
        let store = MemoryLedger::new();
        seed_genesis(&store).await;
        store
            .insert_block(&cellbase_block(1, "0xb1", "0xg", "0xX", 1000))
            .await
            .unwrap();
        store.mark_authentic(&["0xb1".into()]).await.unwrap();

        store.mark_abandoned(&["0xb1".into()]).await.unwrap();
        store.mark_abandoned(&["0xb1".into()]).await.unwrap(); // no-op

        let x = store.account("0xX").await.unwrap().unwrap();
        assert_eq!(x.balance, 0);
        assert_eq!(x.transactions_count, 0);
        let row = store.block_by_hash("0xb1").await.unwrap().unwrap();
        assert_eq!(row.status, ChainStatus::Abandoned);
        assert_eq!(
            store
                .transaction_by_hash("0xb1-cb")
                .await
                .unwrap()
                .unwrap()
                .status,
            ChainStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn spend_derives_fee_and_tracks_consumption() {
        let store = MemoryLedger::new();
        seed_genesis(&store).await;
        store
            .insert_block(&cellbase_block(1, "0xb1", "0xg", "0xX", 1000))
            .await
            .unwrap();
        store.mark_authentic(&["0xb1".into()]).await.unwrap();

        // Block 2: X spends the 1000-capacity cell, 990 to Y (10 fee).
        let block = header(2, "0xb2", "0xb1");
        let mut spend = cellbase_tx("0xb2-t1", &block, "0xY", 990);
        spend.inputs = vec![CellInput {
            previous_output: Some(OutPoint { tx_hash: "0xb1-cb".into(), index: 0 }),
            args: vec![],
        }];
        let cb = cellbase_tx("0xb2-cb", &block, "0xminer", 500);
        store
            .insert_block(&DecodedBlock {
                block,
                uncles: vec![],
                transactions: vec![cb, spend],
            })
            .await
            .unwrap();
        store.mark_authentic(&["0xb2".into()]).await.unwrap();

        let x = store.account("0xX").await.unwrap().unwrap();
        assert_eq!(x.balance, 0);
        assert_eq!(x.cell_consumed, 1000);
        assert_eq!(x.transactions_count, 2); // credited in #1, debited in #2
        let y = store.account("0xY").await.unwrap().unwrap();
        assert_eq!(y.balance, 990);
        assert_eq!(y.transactions_count, 1);

        // Fee and consumption derived at authentication time.
        let spend_row = store.transaction_by_hash("0xb2-t1").await.unwrap().unwrap();
        assert_eq!(spend_row.transaction_fee, 10);
        let b2 = store.block_by_hash("0xb2").await.unwrap().unwrap();
        assert_eq!(b2.total_transaction_fee, 10);
        assert_eq!(b2.cell_consumed, 1000);
    }

    #[tokio::test]
    async fn display_writeback_skips_abandoned() {
        let store = MemoryLedger::new();
        seed_genesis(&store).await;
        store
            .insert_block(&cellbase_block(1, "0xb1", "0xg", "0xX", 100))
            .await
            .unwrap();
        store.mark_authentic(&["0xb1".into()]).await.unwrap();

        let ok = store
            .update_display_fields(
                "0xb1-cb",
                vec![DisplayInput { from_cellbase: true, address_hash: None, capacity: None }],
                vec![DisplayOutput { address_hash: Some("0xX".into()), capacity: 100 }],
            )
            .await
            .unwrap();
        assert!(ok);

        store.mark_abandoned(&["0xb1".into()]).await.unwrap();
        let ok = store
            .update_display_fields("0xb1-cb", vec![], vec![])
            .await
            .unwrap();
        assert!(!ok);

        let missing = store
            .update_display_fields("0xnope", vec![], vec![])
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn cell_accessors_follow_block_order() {
        let store = MemoryLedger::new();
        seed_genesis(&store).await;
        store
            .insert_block(&cellbase_block(1, "0xb1", "0xg", "0xX", 100))
            .await
            .unwrap();

        assert_eq!(
            store.block_tx_hashes("0xb1").await.unwrap(),
            vec!["0xb1-cb".to_string()]
        );
        let inputs = store.cell_inputs("0xb1-cb").await.unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].is_cellbase());
        let outputs = store.cell_outputs("0xb1-cb").await.unwrap();
        assert_eq!(outputs[0].capacity, 100);
    }

    #[tokio::test]
    async fn cursor_cas() {
        let store = MemoryLedger::new();
        assert!(store
            .advance_cursor(TIP_CURSOR, None, 0, CursorStatus::Syncing)
            .await
            .unwrap());
        // Stale expectation loses the race.
        assert!(!store
            .advance_cursor(TIP_CURSOR, None, 1, CursorStatus::Syncing)
            .await
            .unwrap());
        assert!(store
            .advance_cursor(TIP_CURSOR, Some(0), 1, CursorStatus::Synced)
            .await
            .unwrap());
        let cursor = store.cursor(TIP_CURSOR).await.unwrap().unwrap();
        assert_eq!(cursor.value, 1);
        assert_eq!(cursor.status, CursorStatus::Synced);
    }

    #[tokio::test]
    async fn reorged_branch_reclaims_shared_transaction() {
        let store = MemoryLedger::new();
        seed_genesis(&store).await;

        // Both competing blocks at height 1 carry the same mempool transaction.
        let a1 = {
            let block = header(1, "0xa1", "0xg");
            let tx = cellbase_tx("0xshared", &block, "0xX", 700);
            DecodedBlock { block, uncles: vec![], transactions: vec![tx] }
        };
        store.insert_block(&a1).await.unwrap();
        store.mark_authentic(&["0xa1".into()]).await.unwrap();
        store.mark_abandoned(&["0xa1".into()]).await.unwrap();

        let b1 = {
            let block = header(1, "0xb1", "0xg");
            let tx = cellbase_tx("0xshared", &block, "0xX", 700);
            DecodedBlock { block, uncles: vec![], transactions: vec![tx] }
        };
        store.insert_block(&b1).await.unwrap();
        store.mark_authentic(&["0xb1".into()]).await.unwrap();

        // The row moved to its new owner and the abandoned block lost it.
        let tx = store.transaction_by_hash("0xshared").await.unwrap().unwrap();
        assert_eq!(tx.block_hash, "0xb1");
        assert_eq!(tx.status, ChainStatus::Authentic);
        assert!(store.block_tx_hashes("0xa1").await.unwrap().is_empty());
        assert_eq!(
            store.block_tx_hashes("0xb1").await.unwrap(),
            vec!["0xshared".to_string()]
        );

        let x = store.account("0xX").await.unwrap().unwrap();
        assert_eq!(x.balance, 700);
        assert_eq!(x.transactions_count, 1);

        // While 0xb1 owns the hash, re-adopting 0xa1 is a duplicate.
        let err = store.insert_block(&a1).await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateHash { .. }));
    }
}
