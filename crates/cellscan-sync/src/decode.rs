//! Raw block decoding.
//!
//! `decode` is a pure, deterministic transformation from a node-served
//! [`RawBlock`] into domain entities. It validates structure and computes the
//! aggregates that need only the block body (reward, created capacity, tx
//! counts); fee and consumed-capacity aggregates need previous outputs and
//! are derived later, when the block is marked authentic.

use cellscan_core::types::{
    Block, CellInput, CellOutput, ChainStatus, DecodedBlock, DecodedTransaction, OutPoint, Script,
    Transaction, UncleBlock,
};
use cellscan_core::SyncError;

use crate::client::{RawBlock, RawOutPoint, RawScript, RawTransaction};

/// Decode a raw block into persistable entities, all statused `Pending`.
///
/// Fails with [`SyncError::MalformedBlock`] on structural defects: an
/// unparseable hash, a negative capacity, or a cellbase input anywhere but the
/// first transaction. Nothing is persisted by this function, so a malformed
/// height is safe to retry once the node serves a corrected body.
pub fn decode(raw: &RawBlock) -> Result<DecodedBlock, SyncError> {
    let number = raw.header.number;
    check_hash(&raw.header.hash, number, "block hash")?;
    check_hash(&raw.header.parent_hash, number, "parent hash")?;

    let mut transactions = Vec::with_capacity(raw.transactions.len());
    let mut reward: u64 = 0;
    let mut total_cell_capacity: u64 = 0;

    for (pos, raw_tx) in raw.transactions.iter().enumerate() {
        let decoded = decode_transaction(raw_tx, raw, pos)?;
        let created: u64 = decoded.outputs.iter().map(|o| o.capacity).sum();
        total_cell_capacity += created;
        if pos == 0 && decoded.inputs.iter().any(CellInput::is_cellbase) {
            reward = created;
        }
        transactions.push(decoded);
    }

    let uncles: Vec<UncleBlock> = raw
        .uncles
        .iter()
        .map(|u| UncleBlock {
            block_hash: u.header.hash.clone(),
            parent_hash: u.header.parent_hash.clone(),
            number: u.header.number,
            timestamp: u.header.timestamp,
            difficulty: u.header.difficulty.clone(),
            miner_hash: u.header.miner_hash.clone(),
            version: u.header.version,
            reward: u.reward,
            owner_hash: raw.header.hash.clone(),
        })
        .collect();

    let block = Block {
        block_hash: raw.header.hash.clone(),
        parent_hash: raw.header.parent_hash.clone(),
        number,
        timestamp: raw.header.timestamp,
        difficulty: raw.header.difficulty.clone(),
        miner_hash: raw.header.miner_hash.clone(),
        version: raw.header.version,
        reward,
        total_transaction_fee: 0,
        total_cell_capacity,
        cell_consumed: 0,
        tx_count: raw.transactions.len() as u32,
        uncles_count: raw.uncles.len() as u32,
        uncle_block_hashes: raw.uncles.iter().map(|u| u.header.hash.clone()).collect(),
        status: ChainStatus::Pending,
    };

    Ok(DecodedBlock {
        block,
        uncles,
        transactions,
    })
}

fn decode_transaction(
    raw_tx: &RawTransaction,
    raw: &RawBlock,
    pos: usize,
) -> Result<DecodedTransaction, SyncError> {
    let number = raw.header.number;
    check_hash(&raw_tx.hash, number, "transaction hash")?;

    let mut inputs = Vec::with_capacity(raw_tx.inputs.len());
    for raw_in in &raw_tx.inputs {
        let previous_output = raw_in.previous_output.as_ref().map(out_point);
        if previous_output.is_none() && pos != 0 {
            return Err(SyncError::MalformedBlock {
                number,
                reason: format!("cellbase input in non-first transaction {}", raw_tx.hash),
            });
        }
        inputs.push(CellInput {
            previous_output,
            args: raw_in.args.clone(),
        });
    }

    let mut outputs = Vec::with_capacity(raw_tx.outputs.len());
    for raw_out in &raw_tx.outputs {
        if raw_out.capacity < 0 {
            return Err(SyncError::MalformedBlock {
                number,
                reason: format!("negative capacity in transaction {}", raw_tx.hash),
            });
        }
        outputs.push(CellOutput {
            capacity: raw_out.capacity as u64,
            data: raw_out.data.clone(),
            lock_script: script(&raw_out.lock),
            type_script: raw_out.type_.as_ref().map(script),
        });
    }

    let transaction = Transaction {
        tx_hash: raw_tx.hash.clone(),
        block_hash: raw.header.hash.clone(),
        block_number: number,
        block_timestamp: raw.header.timestamp,
        deps: raw_tx.deps.iter().map(out_point).collect(),
        status: ChainStatus::Pending,
        transaction_fee: 0,
        version: raw_tx.version,
        display_inputs: None,
        display_outputs: None,
    };

    Ok(DecodedTransaction {
        transaction,
        inputs,
        outputs,
    })
}

fn out_point(raw: &RawOutPoint) -> OutPoint {
    OutPoint {
        tx_hash: raw.tx_hash.clone(),
        index: raw.index,
    }
}

fn script(raw: &RawScript) -> Script {
    Script {
        code_hash: raw.code_hash.clone(),
        version: raw.version,
        args: raw.args.clone(),
    }
}

fn check_hash(hash: &str, number: u64, what: &str) -> Result<(), SyncError> {
    if hash.len() > 2 && hash.starts_with("0x") {
        return Ok(());
    }
    Err(SyncError::MalformedBlock {
        number,
        reason: format!("unparseable {what}: {hash:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RawHeader, RawInput, RawOutput, RawUncleBlock};

    fn raw_header(number: u64, hash: &str, parent: &str) -> RawHeader {
        RawHeader {
            hash: hash.into(),
            parent_hash: parent.into(),
            number,
            timestamp: (number * 8000) as i64,
            difficulty: "0x100".into(),
            miner_hash: "0xminer".into(),
            version: 0,
        }
    }

    fn cellbase(hash: &str, capacity: i64, owner: &str) -> RawTransaction {
        RawTransaction {
            hash: hash.into(),
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
                    code_hash: "0xcode".into(),
                    version: 0,
                    args: vec![owner.into()],
                },
                type_: None,
            }],
        }
    }

    #[test]
    fn decodes_block_with_aggregates() {
        let raw = RawBlock {
            header: raw_header(5, "0xb5", "0xb4"),
            uncles: vec![RawUncleBlock {
                header: raw_header(4, "0xu4", "0xb3"),
                reward: 30,
            }],
            transactions: vec![cellbase("0xcb", 1000, "0xminer-addr")],
        };

        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.block.number, 5);
        assert_eq!(decoded.block.reward, 1000);
        assert_eq!(decoded.block.total_cell_capacity, 1000);
        assert_eq!(decoded.block.tx_count, 1);
        assert_eq!(decoded.block.uncles_count, 1);
        assert_eq!(decoded.block.uncle_block_hashes, vec!["0xu4".to_string()]);
        assert_eq!(decoded.block.status, ChainStatus::Pending);
        assert_eq!(decoded.uncles[0].owner_hash, "0xb5");
        assert_eq!(decoded.transactions[0].transaction.block_timestamp, 40000);
        assert!(decoded.transactions[0].inputs[0].is_cellbase());
    }

    #[test]
    fn decode_is_deterministic() {
        let raw = RawBlock {
            header: raw_header(1, "0xb1", "0xg"),
            uncles: vec![],
            transactions: vec![cellbase("0xcb", 700, "0xx")],
        };
        assert_eq!(decode(&raw).unwrap(), decode(&raw).unwrap());
    }

    #[test]
    fn rejects_bad_hash() {
        let raw = RawBlock {
            header: raw_header(3, "not-a-hash", "0xb2"),
            uncles: vec![],
            transactions: vec![],
        };
        match decode(&raw).unwrap_err() {
            SyncError::MalformedBlock { number, .. } => assert_eq!(number, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_negative_capacity() {
        let raw = RawBlock {
            header: raw_header(2, "0xb2", "0xb1"),
            uncles: vec![],
            transactions: vec![cellbase("0xcb", -5, "0xx")],
        };
        assert!(matches!(
            decode(&raw).unwrap_err(),
            SyncError::MalformedBlock { number: 2, .. }
        ));
    }

    #[test]
    fn rejects_misplaced_cellbase() {
        let raw = RawBlock {
            header: raw_header(2, "0xb2", "0xb1"),
            uncles: vec![],
            transactions: vec![cellbase("0xcb", 100, "0xx"), cellbase("0xcb2", 1, "0xy")],
        };
        let err = decode(&raw).unwrap_err();
        assert!(err.to_string().contains("cellbase"));
    }
}
