//! Deduplicated display-refresh queue.
//!
//! `display_inputs` / `display_outputs` resolve each input's previous-output
//! details, which is too expensive to do inline during ingestion. The queue
//! recomputes them out-of-band on a small worker pool. Jobs are keyed by the
//! exact ordered transaction-hash list: enqueueing an identical list while the
//! first job is still pending collapses into a single run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use cellscan_core::types::{ChainStatus, DisplayInput, DisplayOutput};
use cellscan_core::{LedgerStore, SyncError};

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Scheduled,
    /// An identical job is already pending; nothing was queued.
    AlreadyScheduled,
}

struct Job {
    key: String,
    tx_hashes: Vec<String>,
}

/// Worker pool that recomputes display projections for sets of transactions.
pub struct DisplayRefreshQueue {
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<Mutex<HashSet<String>>>,
    workers: Vec<JoinHandle<()>>,
}

impl DisplayRefreshQueue {
    pub fn new(store: Arc<dyn LedgerStore>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let pending: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let pending = Arc::clone(&pending);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else { break };
                        if let Err(e) = run_job(store.as_ref(), &job.tx_hashes).await {
                            tracing::warn!(worker_id, key = %job.key, error = %e, "display refresh failed");
                        }
                        pending.lock().unwrap().remove(&job.key);
                    }
                })
            })
            .collect();

        Self {
            sender,
            pending,
            workers: handles,
        }
    }

    /// Submit a job for the exact ordered `tx_hashes` list. Returns
    /// `AlreadyScheduled` when an identical list is already pending.
    pub fn enqueue(&self, tx_hashes: Vec<String>) -> EnqueueOutcome {
        let key = tx_hashes.join(",");
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.insert(key.clone()) {
                tracing::debug!(key = %key, "display refresh already scheduled");
                return EnqueueOutcome::AlreadyScheduled;
            }
        }
        if self.sender.send(Job { key: key.clone(), tx_hashes }).is_err() {
            // Workers are gone; leave nothing pending.
            self.pending.lock().unwrap().remove(&key);
            return EnqueueOutcome::AlreadyScheduled;
        }
        EnqueueOutcome::Scheduled
    }

    /// Stop accepting jobs and wait for in-flight work to drain.
    pub async fn close(self) {
        drop(self.sender);
        join_all(self.workers).await;
    }
}

/// Recompute and write back projections for each transaction in the job.
/// Transactions that vanished or got abandoned since enqueue are skipped.
async fn run_job(store: &dyn LedgerStore, tx_hashes: &[String]) -> Result<(), SyncError> {
    for tx_hash in tx_hashes {
        let Some(tx) = store.transaction_by_hash(tx_hash).await? else {
            tracing::debug!(tx_hash = %tx_hash, "skipping refresh for unknown transaction");
            continue;
        };
        if tx.status != ChainStatus::Authentic {
            tracing::debug!(tx_hash = %tx_hash, status = %tx.status, "skipping refresh");
            continue;
        }

        let mut display_inputs = Vec::new();
        for input in store.cell_inputs(tx_hash).await? {
            match &input.previous_output {
                None => display_inputs.push(DisplayInput {
                    from_cellbase: true,
                    address_hash: None,
                    capacity: None,
                }),
                Some(out_point) => {
                    let previous = store.previous_cell(out_point).await?;
                    display_inputs.push(DisplayInput {
                        from_cellbase: false,
                        address_hash: previous.as_ref().and_then(|c| c.address_hash.clone()),
                        capacity: previous.as_ref().map(|c| c.capacity),
                    });
                }
            }
        }

        let display_outputs: Vec<DisplayOutput> = store
            .cell_outputs(tx_hash)
            .await?
            .iter()
            .map(|output| DisplayOutput {
                address_hash: output.lock_script.address_hash().map(str::to_owned),
                capacity: output.capacity,
            })
            .collect();

        let written = store
            .update_display_fields(tx_hash, display_inputs, display_outputs)
            .await?;
        if written {
            tracing::debug!(tx_hash = %tx_hash, "display fields refreshed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RawBlock, RawHeader, RawInput, RawOutPoint, RawOutput, RawScript, RawTransaction};
    use crate::decode::decode;
    use cellscan_storage::MemoryLedger;

    fn cellbase_block(number: u64, hash: &str, parent: &str, owner: &str, capacity: i64) -> RawBlock {
        RawBlock {
            header: RawHeader {
                hash: hash.into(),
                parent_hash: parent.into(),
                number,
                timestamp: (number * 8000) as i64,
                difficulty: "0x100".into(),
                miner_hash: "0xminer".into(),
                version: 0,
            },
            uncles: vec![],
            transactions: vec![RawTransaction {
                hash: format!("{hash}-cb"),
                version: 0,
                deps: vec![],
                inputs: vec![RawInput {
                    previous_output: None,
                    args: vec![],
                }],
                outputs: vec![RawOutput {
                    capacity,
                    data: "0x".into(),
                    lock: RawScript {
                        code_hash: "0xlock".into(),
                        version: 0,
                        args: vec![owner.into()],
                    },
                    type_: None,
                }],
            }],
        }
    }

    async fn seed(store: &MemoryLedger) {
        for raw in [
            cellbase_block(0, "0xg", "0x0", "0xminer-a", 0),
            cellbase_block(1, "0xb1", "0xg", "0xalice", 1000),
        ] {
            let decoded = decode(&raw).unwrap();
            store.insert_block(&decoded).await.unwrap();
            store
                .mark_authentic(&[decoded.block.block_hash.clone()])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn refresh_populates_display_fields() {
        let store = Arc::new(MemoryLedger::new());
        seed(&store).await;

        // Block 2 spends alice's cellbase output.
        let mut raw = cellbase_block(2, "0xb2", "0xb1", "0xminer-a", 0);
        raw.transactions.push(RawTransaction {
            hash: "0xspend".into(),
            version: 0,
            deps: vec![],
            inputs: vec![RawInput {
                previous_output: Some(RawOutPoint {
                    tx_hash: "0xb1-cb".into(),
                    index: 0,
                }),
                args: vec![],
            }],
            outputs: vec![RawOutput {
                capacity: 990,
                data: "0x".into(),
                lock: RawScript {
                    code_hash: "0xlock".into(),
                    version: 0,
                    args: vec!["0xbob".into()],
                },
                type_: None,
            }],
        });
        let decoded = decode(&raw).unwrap();
        store.insert_block(&decoded).await.unwrap();
        store.mark_authentic(&["0xb2".into()]).await.unwrap();

        let queue = DisplayRefreshQueue::new(store.clone() as Arc<dyn LedgerStore>, 2);
        assert_eq!(
            queue.enqueue(vec!["0xb2-cb".into(), "0xspend".into()]),
            EnqueueOutcome::Scheduled
        );
        queue.close().await;

        let tx = store.transaction_by_hash("0xspend").await.unwrap().unwrap();
        let inputs = tx.display_inputs.unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(!inputs[0].from_cellbase);
        assert_eq!(inputs[0].address_hash.as_deref(), Some("0xalice"));
        assert_eq!(inputs[0].capacity, Some(1000));
        let outputs = tx.display_outputs.unwrap();
        assert_eq!(outputs[0].address_hash.as_deref(), Some("0xbob"));
        assert_eq!(outputs[0].capacity, 990);

        let cb = store.transaction_by_hash("0xb2-cb").await.unwrap().unwrap();
        assert!(cb.display_inputs.unwrap()[0].from_cellbase);
    }

    #[tokio::test]
    async fn identical_pending_set_collapses() {
        let store = Arc::new(MemoryLedger::new());
        seed(&store).await;

        let queue = DisplayRefreshQueue::new(store.clone() as Arc<dyn LedgerStore>, 1);
        let set = vec!["0xb1-cb".to_string(), "0xg-cb".to_string()];

        // No await between the two submissions, so the worker cannot have
        // started draining yet.
        assert_eq!(queue.enqueue(set.clone()), EnqueueOutcome::Scheduled);
        assert_eq!(queue.enqueue(set.clone()), EnqueueOutcome::AlreadyScheduled);

        // A differently-ordered list is a different key.
        let reordered = vec!["0xg-cb".to_string(), "0xb1-cb".to_string()];
        assert_eq!(queue.enqueue(reordered), EnqueueOutcome::Scheduled);

        queue.close().await;
    }

    #[tokio::test]
    async fn vanished_and_abandoned_ids_are_skipped() {
        let store = Arc::new(MemoryLedger::new());
        seed(&store).await;
        store.mark_abandoned(&["0xb1".into()]).await.unwrap();

        let queue = DisplayRefreshQueue::new(store.clone() as Arc<dyn LedgerStore>, 1);
        assert_eq!(
            queue.enqueue(vec!["0xb1-cb".into(), "0xmissing".into(), "0xg-cb".into()]),
            EnqueueOutcome::Scheduled
        );
        queue.close().await;

        // The abandoned transaction was left untouched, the authentic one in
        // the same job still got its refresh.
        let abandoned = store.transaction_by_hash("0xb1-cb").await.unwrap().unwrap();
        assert!(abandoned.display_inputs.is_none());
        let genesis_cb = store.transaction_by_hash("0xg-cb").await.unwrap().unwrap();
        assert!(genesis_cb.display_inputs.is_some());
    }
}
