//! Fork resolution.
//!
//! When a fetched block does not extend the local authentic tip, the resolver
//! walks the node's branch backwards until it meets a height where the node's
//! hash equals the locally authentic one (the fork point), then flips the
//! superseded suffix to `abandoned` and adopts the new branch in ascending
//! order. Both flips are idempotent, so a resolve cycle aborted half way is
//! safe to re-run from scratch.

use cellscan_core::types::{ChainStatus, DecodedBlock};
use cellscan_core::{LedgerStore, SyncError};

use crate::client::ChainClient;
use crate::decode::decode;

/// Summary of a completed reorg, for logs and loop observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Height of the common ancestor; everything above it changed branch.
    pub fork_point: u64,
    /// Hashes flipped to `abandoned`, newest first.
    pub abandoned: Vec<String>,
    /// Hashes of the adopted branch, oldest first.
    pub adopted: Vec<String>,
}

impl ReorgEvent {
    pub fn depth(&self) -> usize {
        self.abandoned.len()
    }
}

/// Walks back from a divergence and swaps the canonical suffix.
pub struct ReorgResolver {
    window: u64,
}

impl ReorgResolver {
    /// `window` bounds how many heights below the divergence the resolver may
    /// search for a common ancestor before giving up with `ReorgTooDeep`.
    pub fn new(window: u64) -> Self {
        Self { window }
    }

    /// Resolve a fork. `mismatch` is the decoded block whose parent hash did
    /// not match the local authentic block one height below it.
    pub async fn resolve<C, S>(
        &self,
        client: &C,
        store: &S,
        mismatch: DecodedBlock,
    ) -> Result<ReorgEvent, SyncError>
    where
        C: ChainClient + ?Sized,
        S: LedgerStore + ?Sized,
    {
        let divergence = mismatch.block.number;
        let mut expected_parent = mismatch.block.parent_hash.clone();
        let mut new_branch = vec![mismatch];

        // Walk down the node's branch until its hash agrees with ours.
        let fork_point = loop {
            let height = match new_branch.last() {
                Some(b) => b.block.number,
                None => break 0, // unreachable, branch never empties
            };
            if height == 0 || divergence - height >= self.window {
                return Err(SyncError::ReorgTooDeep {
                    window: self.window,
                    floor: height,
                });
            }
            let below = height - 1;

            let raw = client.block_at(below).await?.ok_or_else(|| {
                SyncError::Unavailable(format!("node no longer serves height {below}"))
            })?;
            let ancestor = decode(&raw)?;
            if ancestor.block.block_hash != expected_parent {
                return Err(SyncError::MalformedBlock {
                    number: below,
                    reason: format!(
                        "node branch is not self-consistent: expected {expected_parent}, got {}",
                        ancestor.block.block_hash
                    ),
                });
            }

            let local = store.block_at(below, ChainStatus::Authentic).await?;
            match local {
                Some(ours) if ours.block_hash == ancestor.block.block_hash => break below,
                _ => {
                    expected_parent = ancestor.block.parent_hash.clone();
                    new_branch.push(ancestor);
                }
            }
        };

        // Abandon the superseded suffix, newest first so account reversal
        // unwinds in reverse chronological order.
        let mut abandoned = Vec::new();
        let mut height = fork_point + 1;
        while let Some(old) = store.block_at(height, ChainStatus::Authentic).await? {
            abandoned.push(old.block_hash);
            height += 1;
        }
        abandoned.reverse();
        if !abandoned.is_empty() {
            store.mark_abandoned(&abandoned).await?;
        }

        // Adopt the new branch oldest first. A hash already stored from an
        // earlier visit of this branch is refreshed in place by insert_block.
        new_branch.reverse();
        let mut adopted = Vec::with_capacity(new_branch.len());
        for block in &new_branch {
            let hash = block.block.block_hash.clone();
            match store.insert_block(block).await {
                Ok(()) => {}
                Err(SyncError::DuplicateHash { .. }) => {
                    tracing::debug!(hash = %hash, "branch block already stored, resuming");
                }
                Err(e) => return Err(e),
            }
            store.mark_authentic(&[hash.clone()]).await?;
            adopted.push(hash);
        }

        let event = ReorgEvent {
            fork_point,
            abandoned,
            adopted,
        };
        tracing::warn!(
            fork_point = event.fork_point,
            depth = event.depth(),
            adopted = event.adopted.len(),
            "reorg resolved"
        );
        Ok(event)
    }
}
