//! Account aggregation — pure delta arithmetic shared by ledger backends.
//!
//! A transaction touches an account by creating a cell its lock resolves to,
//! or by consuming a cell it previously locked. Backends compute deltas with
//! [`transaction_deltas`] inside their `mark_authentic` transaction and apply
//! the reversed deltas inside `mark_abandoned`, so balances always reflect
//! exactly the currently-authentic chain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ledger::CellWithOwner;
use crate::types::{Account, DecodedTransaction, OutPoint};

/// Signed aggregate change for one account, attributable to one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDelta {
    pub address_hash: String,
    pub balance: i64,
    pub cell_consumed: i64,
    pub transactions_count: i64,
}

impl AccountDelta {
    /// The exact inverse, used when abandoning a previously authentic block.
    pub fn reversed(&self) -> Self {
        Self {
            address_hash: self.address_hash.clone(),
            balance: -self.balance,
            cell_consumed: -self.cell_consumed,
            transactions_count: -self.transactions_count,
        }
    }
}

impl Account {
    /// Fold a delta into the aggregate.
    pub fn apply(&mut self, delta: &AccountDelta) {
        debug_assert_eq!(self.address_hash, delta.address_hash);
        self.balance += delta.balance;
        self.cell_consumed += delta.cell_consumed;
        self.transactions_count += delta.transactions_count;
    }
}

/// Compute the per-account deltas of one transaction becoming authentic.
///
/// `resolve_prev` looks up an already-stored output by out-point; the cellbase
/// input has none and is skipped, as is any input whose previous output is
/// unknown to the store (it cannot be attributed). Each touched account counts
/// the transaction exactly once. Deltas come back in address order, so
/// applying them is deterministic across backends.
pub fn transaction_deltas<F>(tx: &DecodedTransaction, resolve_prev: F) -> Vec<AccountDelta>
where
    F: Fn(&OutPoint) -> Option<CellWithOwner>,
{
    // address → (balance, cell_consumed)
    let mut changes: BTreeMap<String, (i64, i64)> = BTreeMap::new();

    for output in &tx.outputs {
        if let Some(address) = output.lock_script.address_hash() {
            let entry = changes.entry(address.to_string()).or_default();
            entry.0 += output.capacity as i64;
        }
    }

    for input in &tx.inputs {
        let Some(out_point) = &input.previous_output else {
            continue; // cellbase
        };
        let Some(cell) = resolve_prev(out_point) else {
            continue;
        };
        if let Some(address) = cell.address_hash {
            let entry = changes.entry(address).or_default();
            entry.0 -= cell.capacity as i64;
            entry.1 += cell.capacity as i64;
        }
    }

    changes
        .into_iter()
        .map(|(address_hash, (balance, cell_consumed))| AccountDelta {
            address_hash,
            balance,
            cell_consumed,
            transactions_count: 1,
        })
        .collect()
}
