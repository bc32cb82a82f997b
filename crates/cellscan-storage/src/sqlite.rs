//! SQLite ledger backend.
//!
//! Persists the full explorer data set to a single SQLite file. Uses `sqlx`
//! with WAL mode for concurrent read performance; every write method runs in
//! one database transaction, so readers never observe a block without its
//! transactions or a half-applied status flip.
//!
//! # Usage
//! ```rust,no_run
//! use cellscan_storage::sqlite::SqliteLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteLedger::open("./ledger.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteLedger::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction as SqlTx};
use tracing::debug;

use cellscan_core::account::transaction_deltas;
use cellscan_core::cursor::{CursorStatus, SyncCursor};
use cellscan_core::error::SyncError;
use cellscan_core::ledger::{CellWithOwner, LedgerStore};
use cellscan_core::types::{
    Account, Block, CellInput, CellOutput, ChainStatus, DecodedBlock, DecodedTransaction,
    DisplayInput, DisplayOutput, OutPoint, Script, Transaction,
};

fn status_str(status: ChainStatus) -> &'static str {
    match status {
        ChainStatus::Pending => "pending",
        ChainStatus::Authentic => "authentic",
        ChainStatus::Abandoned => "abandoned",
    }
}

fn parse_status(s: &str) -> Result<ChainStatus, SyncError> {
    match s {
        "pending" => Ok(ChainStatus::Pending),
        "authentic" => Ok(ChainStatus::Authentic),
        "abandoned" => Ok(ChainStatus::Abandoned),
        other => Err(SyncError::Storage(format!("unknown status '{other}'"))),
    }
}

fn parse_cursor_status(s: &str) -> Result<CursorStatus, SyncError> {
    match s {
        "syncing" => Ok(CursorStatus::Syncing),
        "synced" => Ok(CursorStatus::Synced),
        other => Err(SyncError::Storage(format!("unknown cursor status '{other}'"))),
    }
}

/// SQLite-backed [`LedgerStore`].
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ledger.db"`) or a full
    /// SQLite URL (`"sqlite:./ledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), SyncError> {
        // WAL mode — readers don't block the single writer
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS blocks (
                block_hash            TEXT    PRIMARY KEY,
                parent_hash           TEXT    NOT NULL,
                number                INTEGER NOT NULL,
                timestamp             INTEGER NOT NULL,
                difficulty            TEXT    NOT NULL,
                miner_hash            TEXT    NOT NULL,
                version               INTEGER NOT NULL,
                reward                INTEGER NOT NULL,
                total_transaction_fee INTEGER NOT NULL,
                total_cell_capacity   INTEGER NOT NULL,
                cell_consumed         INTEGER NOT NULL,
                tx_count              INTEGER NOT NULL,
                uncles_count          INTEGER NOT NULL,
                uncle_block_hashes    TEXT    NOT NULL,
                status                TEXT    NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_blocks_number_status
                ON blocks (number, status);",
            "CREATE TABLE IF NOT EXISTS uncle_blocks (
                block_hash  TEXT    NOT NULL,
                owner_hash  TEXT    NOT NULL,
                parent_hash TEXT    NOT NULL,
                number      INTEGER NOT NULL,
                timestamp   INTEGER NOT NULL,
                difficulty  TEXT    NOT NULL,
                miner_hash  TEXT    NOT NULL,
                version     INTEGER NOT NULL,
                reward      INTEGER NOT NULL,
                PRIMARY KEY (owner_hash, block_hash)
            );",
            "CREATE TABLE IF NOT EXISTS transactions (
                tx_hash         TEXT    PRIMARY KEY,
                block_hash      TEXT    NOT NULL,
                tx_index        INTEGER NOT NULL,
                block_number    INTEGER NOT NULL,
                block_timestamp INTEGER NOT NULL,
                deps            TEXT    NOT NULL,
                status          TEXT    NOT NULL,
                transaction_fee INTEGER NOT NULL,
                version         INTEGER NOT NULL,
                display_inputs  TEXT,
                display_outputs TEXT
            );",
            "CREATE INDEX IF NOT EXISTS idx_transactions_block
                ON transactions (block_hash, tx_index);",
            "CREATE TABLE IF NOT EXISTS cell_inputs (
                tx_hash          TEXT    NOT NULL,
                input_index      INTEGER NOT NULL,
                previous_tx_hash TEXT,
                previous_index   INTEGER,
                args             TEXT    NOT NULL,
                PRIMARY KEY (tx_hash, input_index)
            );",
            "CREATE TABLE IF NOT EXISTS cell_outputs (
                tx_hash        TEXT    NOT NULL,
                output_index   INTEGER NOT NULL,
                capacity       INTEGER NOT NULL,
                data           TEXT    NOT NULL,
                lock_code_hash TEXT    NOT NULL,
                lock_version   INTEGER NOT NULL,
                lock_args      TEXT    NOT NULL,
                type_code_hash TEXT,
                type_version   INTEGER,
                type_args      TEXT,
                address_hash   TEXT,
                PRIMARY KEY (tx_hash, output_index)
            );",
            "CREATE TABLE IF NOT EXISTS accounts (
                address_hash       TEXT    PRIMARY KEY,
                balance            INTEGER NOT NULL,
                cell_consumed      INTEGER NOT NULL,
                transactions_count INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS sync_cursors (
                name       TEXT    PRIMARY KEY,
                value      INTEGER NOT NULL,
                status     TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
        }

        Ok(())
    }

    fn block_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Block, SyncError> {
        let uncle_hashes: String = row.get("uncle_block_hashes");
        let status: String = row.get("status");
        Ok(Block {
            block_hash: row.get("block_hash"),
            parent_hash: row.get("parent_hash"),
            number: row.get::<i64, _>("number") as u64,
            timestamp: row.get("timestamp"),
            difficulty: row.get("difficulty"),
            miner_hash: row.get("miner_hash"),
            version: row.get::<i64, _>("version") as u32,
            reward: row.get::<i64, _>("reward") as u64,
            total_transaction_fee: row.get::<i64, _>("total_transaction_fee") as u64,
            total_cell_capacity: row.get::<i64, _>("total_cell_capacity") as u64,
            cell_consumed: row.get::<i64, _>("cell_consumed") as u64,
            tx_count: row.get::<i64, _>("tx_count") as u32,
            uncles_count: row.get::<i64, _>("uncles_count") as u32,
            uncle_block_hashes: serde_json::from_str(&uncle_hashes)
                .map_err(|e| SyncError::Storage(e.to_string()))?,
            status: parse_status(&status)?,
        })
    }

    fn tx_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction, SyncError> {
        let deps: String = row.get("deps");
        let status: String = row.get("status");
        let display_inputs: Option<String> = row.get("display_inputs");
        let display_outputs: Option<String> = row.get("display_outputs");
        Ok(Transaction {
            tx_hash: row.get("tx_hash"),
            block_hash: row.get("block_hash"),
            block_number: row.get::<i64, _>("block_number") as u64,
            block_timestamp: row.get("block_timestamp"),
            deps: serde_json::from_str(&deps).map_err(|e| SyncError::Storage(e.to_string()))?,
            status: parse_status(&status)?,
            transaction_fee: row.get::<i64, _>("transaction_fee") as u64,
            version: row.get::<i64, _>("version") as u32,
            display_inputs: display_inputs
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| SyncError::Storage(e.to_string()))?,
            display_outputs: display_outputs
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| SyncError::Storage(e.to_string()))?,
        })
    }

    /// Delete the row set owned by an abandoned block so its hash can be
    /// refreshed in place.
    async fn purge_block_rows(
        tx: &mut SqlTx<'_, Sqlite>,
        block_hash: &str,
    ) -> Result<(), SyncError> {
        let tx_hashes: Vec<String> =
            sqlx::query("SELECT tx_hash FROM transactions WHERE block_hash = ?")
                .bind(block_hash)
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?
                .iter()
                .map(|r| r.get("tx_hash"))
                .collect();

        for hash in &tx_hashes {
            sqlx::query("DELETE FROM cell_inputs WHERE tx_hash = ?")
                .bind(hash)
                .execute(&mut **tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            sqlx::query("DELETE FROM cell_outputs WHERE tx_hash = ?")
                .bind(hash)
                .execute(&mut **tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
        }
        sqlx::query("DELETE FROM transactions WHERE block_hash = ?")
            .bind(block_hash)
            .execute(&mut **tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        sqlx::query("DELETE FROM uncle_blocks WHERE owner_hash = ?")
            .bind(block_hash)
            .execute(&mut **tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        sqlx::query("DELETE FROM blocks WHERE block_hash = ?")
            .bind(block_hash)
            .execute(&mut **tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }

    fn input_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CellInput, SyncError> {
        let prev_hash: Option<String> = row.get("previous_tx_hash");
        let prev_index: Option<i64> = row.get("previous_index");
        let args: String = row.get("args");
        Ok(CellInput {
            previous_output: prev_hash.map(|h| OutPoint {
                tx_hash: h,
                index: prev_index.unwrap_or(0) as u32,
            }),
            args: serde_json::from_str(&args).map_err(|e| SyncError::Storage(e.to_string()))?,
        })
    }

    fn output_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CellOutput, SyncError> {
        let lock_args: String = row.get("lock_args");
        let type_code_hash: Option<String> = row.get("type_code_hash");
        let type_script = match type_code_hash {
            Some(code_hash) => {
                let type_args: Option<String> = row.get("type_args");
                Some(Script {
                    code_hash,
                    version: row.get::<Option<i64>, _>("type_version").unwrap_or(0) as u32,
                    args: type_args
                        .map(|s| serde_json::from_str(&s))
                        .transpose()
                        .map_err(|e| SyncError::Storage(e.to_string()))?
                        .unwrap_or_default(),
                })
            }
            None => None,
        };
        Ok(CellOutput {
            capacity: row.get::<i64, _>("capacity") as u64,
            data: row.get("data"),
            lock_script: Script {
                code_hash: row.get("lock_code_hash"),
                version: row.get::<i64, _>("lock_version") as u32,
                args: serde_json::from_str(&lock_args)
                    .map_err(|e| SyncError::Storage(e.to_string()))?,
            },
            type_script,
        })
    }

    /// Rebuild the decoded view of one stored transaction.
    async fn load_decoded_tx(
        tx: &mut SqlTx<'_, Sqlite>,
        tx_hash: &str,
    ) -> Result<Option<DecodedTransaction>, SyncError> {
        let Some(row) = sqlx::query("SELECT * FROM transactions WHERE tx_hash = ?")
            .bind(tx_hash)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        let transaction = Self::tx_from_row(&row)?;

        let input_rows = sqlx::query(
            "SELECT previous_tx_hash, previous_index, args
             FROM cell_inputs WHERE tx_hash = ? ORDER BY input_index",
        )
        .bind(tx_hash)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        let inputs = input_rows
            .iter()
            .map(Self::input_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let output_rows = sqlx::query(
            "SELECT capacity, data, lock_code_hash, lock_version, lock_args,
                    type_code_hash, type_version, type_args
             FROM cell_outputs WHERE tx_hash = ? ORDER BY output_index",
        )
        .bind(tx_hash)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        let outputs = output_rows
            .iter()
            .map(Self::output_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(DecodedTransaction { transaction, inputs, outputs }))
    }

    /// Apply (forward) or reverse the account deltas of every transaction in
    /// a block. The forward pass also derives per-transaction fees and the
    /// block's `total_transaction_fee` / `cell_consumed` aggregates, which
    /// need the previous outputs only the store can resolve.
    async fn apply_block_deltas(
        tx: &mut SqlTx<'_, Sqlite>,
        block_hash: &str,
        reverse: bool,
    ) -> Result<(), SyncError> {
        let mut tx_hashes: Vec<String> = sqlx::query(
            "SELECT tx_hash FROM transactions WHERE block_hash = ? ORDER BY tx_index",
        )
        .bind(block_hash)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?
        .iter()
        .map(|r| r.get("tx_hash"))
        .collect();
        if reverse {
            tx_hashes.reverse();
        }

        let mut block_fee: u64 = 0;
        let mut block_consumed: u64 = 0;

        for tx_hash in tx_hashes {
            let Some(decoded) = Self::load_decoded_tx(tx, &tx_hash).await? else {
                continue;
            };

            // Prefetch every consumed previous output, then compute deltas
            // with a pure lookup over the prefetched map.
            let mut previous: HashMap<OutPoint, CellWithOwner> = HashMap::new();
            for input in &decoded.inputs {
                let Some(out_point) = &input.previous_output else {
                    continue;
                };
                let row = sqlx::query(
                    "SELECT capacity, address_hash FROM cell_outputs
                     WHERE tx_hash = ? AND output_index = ?",
                )
                .bind(&out_point.tx_hash)
                .bind(out_point.index as i64)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
                if let Some(row) = row {
                    previous.insert(
                        out_point.clone(),
                        CellWithOwner {
                            capacity: row.get::<i64, _>("capacity") as u64,
                            address_hash: row.get("address_hash"),
                        },
                    );
                }
            }

            let deltas = transaction_deltas(&decoded, |op| previous.get(op).cloned());
            for delta in deltas {
                let delta = if reverse { delta.reversed() } else { delta };
                sqlx::query(
                    "INSERT INTO accounts (address_hash, balance, cell_consumed, transactions_count)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (address_hash) DO UPDATE SET
                         balance            = accounts.balance + excluded.balance,
                         cell_consumed      = accounts.cell_consumed + excluded.cell_consumed,
                         transactions_count = accounts.transactions_count + excluded.transactions_count",
                )
                .bind(&delta.address_hash)
                .bind(delta.balance)
                .bind(delta.cell_consumed)
                .bind(delta.transactions_count)
                .execute(&mut **tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            }

            if !reverse {
                let consumed: u64 = previous.values().map(|cell| cell.capacity).sum();
                let created: u64 = decoded.outputs.iter().map(|o| o.capacity).sum();
                let fee = consumed.saturating_sub(created);
                block_fee += fee;
                block_consumed += consumed;
                sqlx::query("UPDATE transactions SET transaction_fee = ? WHERE tx_hash = ?")
                    .bind(fee as i64)
                    .bind(&tx_hash)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
            }
        }

        if !reverse {
            sqlx::query(
                "UPDATE blocks SET total_transaction_fee = ?, cell_consumed = ?
                 WHERE block_hash = ?",
            )
            .bind(block_fee as i64)
            .bind(block_consumed as i64)
            .bind(block_hash)
            .execute(&mut **tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    async fn set_block_status(
        tx: &mut SqlTx<'_, Sqlite>,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<(), SyncError> {
        sqlx::query("UPDATE blocks SET status = ? WHERE block_hash = ?")
            .bind(status_str(status))
            .bind(block_hash)
            .execute(&mut **tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        sqlx::query("UPDATE transactions SET status = ? WHERE block_hash = ?")
            .bind(status_str(status))
            .bind(block_hash)
            .execute(&mut **tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ─── LedgerStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn insert_block(&self, decoded: &DecodedBlock) -> Result<(), SyncError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let block = &decoded.block;
        let existing = sqlx::query("SELECT status FROM blocks WHERE block_hash = ?")
            .bind(&block.block_hash)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        if let Some(row) = existing {
            let status: String = row.get("status");
            if parse_status(&status)? != ChainStatus::Abandoned {
                return Err(SyncError::DuplicateHash { hash: block.block_hash.clone() });
            }
            // Abandoned row set: refresh in place back to pending.
            Self::purge_block_rows(&mut tx, &block.block_hash).await?;
        }

        let uncle_hashes = serde_json::to_string(&block.uncle_block_hashes)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO blocks
             (block_hash, parent_hash, number, timestamp, difficulty, miner_hash, version,
              reward, total_transaction_fee, total_cell_capacity, cell_consumed, tx_count,
              uncles_count, uncle_block_hashes, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&block.block_hash)
        .bind(&block.parent_hash)
        .bind(block.number as i64)
        .bind(block.timestamp)
        .bind(&block.difficulty)
        .bind(&block.miner_hash)
        .bind(block.version as i64)
        .bind(block.reward as i64)
        .bind(block.total_transaction_fee as i64)
        .bind(block.total_cell_capacity as i64)
        .bind(block.cell_consumed as i64)
        .bind(block.tx_count as i64)
        .bind(block.uncles_count as i64)
        .bind(&uncle_hashes)
        .bind(status_str(ChainStatus::Pending))
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        for uncle in &decoded.uncles {
            sqlx::query(
                "INSERT INTO uncle_blocks
                 (block_hash, owner_hash, parent_hash, number, timestamp, difficulty,
                  miner_hash, version, reward)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&uncle.block_hash)
            .bind(&uncle.owner_hash)
            .bind(&uncle.parent_hash)
            .bind(uncle.number as i64)
            .bind(uncle.timestamp)
            .bind(&uncle.difficulty)
            .bind(&uncle.miner_hash)
            .bind(uncle.version as i64)
            .bind(uncle.reward as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        }

        for (tx_index, decoded_tx) in decoded.transactions.iter().enumerate() {
            let record = &decoded_tx.transaction;

            // A transaction re-mined on this block may already be stored under
            // an abandoned block; refresh that row in place under its new
            // owner. Any other live holder of the hash is a duplicate.
            let prior = sqlx::query("SELECT status FROM transactions WHERE tx_hash = ?")
                .bind(&record.tx_hash)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            if let Some(row) = prior {
                let status: String = row.get("status");
                if parse_status(&status)? != ChainStatus::Abandoned {
                    return Err(SyncError::DuplicateHash { hash: record.tx_hash.clone() });
                }
                for sql in [
                    "DELETE FROM cell_inputs WHERE tx_hash = ?",
                    "DELETE FROM cell_outputs WHERE tx_hash = ?",
                    "DELETE FROM transactions WHERE tx_hash = ?",
                ] {
                    sqlx::query(sql)
                        .bind(&record.tx_hash)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| SyncError::Storage(e.to_string()))?;
                }
            }

            let deps = serde_json::to_string(&record.deps)
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            sqlx::query(
                "INSERT INTO transactions
                 (tx_hash, block_hash, tx_index, block_number, block_timestamp, deps,
                  status, transaction_fee, version, display_inputs, display_outputs)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)",
            )
            .bind(&record.tx_hash)
            .bind(&block.block_hash)
            .bind(tx_index as i64)
            .bind(record.block_number as i64)
            .bind(record.block_timestamp)
            .bind(&deps)
            .bind(status_str(ChainStatus::Pending))
            .bind(record.transaction_fee as i64)
            .bind(record.version as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

            for (input_index, input) in decoded_tx.inputs.iter().enumerate() {
                let args = serde_json::to_string(&input.args)
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                sqlx::query(
                    "INSERT INTO cell_inputs
                     (tx_hash, input_index, previous_tx_hash, previous_index, args)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&record.tx_hash)
                .bind(input_index as i64)
                .bind(input.previous_output.as_ref().map(|op| op.tx_hash.clone()))
                .bind(input.previous_output.as_ref().map(|op| op.index as i64))
                .bind(&args)
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            }

            for (output_index, output) in decoded_tx.outputs.iter().enumerate() {
                let lock_args = serde_json::to_string(&output.lock_script.args)
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                let type_args = output
                    .type_script
                    .as_ref()
                    .map(|s| serde_json::to_string(&s.args))
                    .transpose()
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                sqlx::query(
                    "INSERT INTO cell_outputs
                     (tx_hash, output_index, capacity, data, lock_code_hash, lock_version,
                      lock_args, type_code_hash, type_version, type_args, address_hash)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.tx_hash)
                .bind(output_index as i64)
                .bind(output.capacity as i64)
                .bind(&output.data)
                .bind(&output.lock_script.code_hash)
                .bind(output.lock_script.version as i64)
                .bind(&lock_args)
                .bind(output.type_script.as_ref().map(|s| s.code_hash.clone()))
                .bind(output.type_script.as_ref().map(|s| s.version as i64))
                .bind(type_args)
                .bind(output.lock_script.address_hash())
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        debug!(block = %block.block_hash, number = block.number, "block stored");
        Ok(())
    }

    async fn mark_authentic(&self, hashes: &[String]) -> Result<(), SyncError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        for hash in hashes {
            let row = sqlx::query("SELECT * FROM blocks WHERE block_hash = ?")
                .bind(hash)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?
                .ok_or_else(|| SyncError::Other(format!("unknown block {hash}")))?;
            let block = Self::block_from_row(&row)?;

            if block.status == ChainStatus::Authentic {
                continue; // idempotent
            }

            // Invariant: at most one authentic block per height.
            let conflict = sqlx::query(
                "SELECT 1 FROM blocks WHERE number = ? AND status = 'authentic' AND block_hash <> ?",
            )
            .bind(block.number as i64)
            .bind(hash)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
            if conflict.is_some() {
                return Err(SyncError::Storage(format!(
                    "height {} already has an authentic block",
                    block.number
                )));
            }

            if block.number > 0 {
                let parent = sqlx::query("SELECT status FROM blocks WHERE block_hash = ?")
                    .bind(&block.parent_hash)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                let parent_ok = match parent {
                    Some(row) => parse_status(row.get("status"))? == ChainStatus::Authentic,
                    None => false,
                };
                if !parent_ok {
                    return Err(SyncError::OrphanBlock { hash: hash.clone() });
                }
            }

            Self::set_block_status(&mut tx, hash, ChainStatus::Authentic).await?;
            Self::apply_block_deltas(&mut tx, hash, false).await?;
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))
    }

    async fn mark_abandoned(&self, hashes: &[String]) -> Result<(), SyncError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        for hash in hashes {
            let row = sqlx::query("SELECT status FROM blocks WHERE block_hash = ?")
                .bind(hash)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?
                .ok_or_else(|| SyncError::Other(format!("unknown block {hash}")))?;
            let status = parse_status(row.get("status"))?;

            match status {
                ChainStatus::Abandoned => continue, // idempotent
                ChainStatus::Authentic => {
                    Self::apply_block_deltas(&mut tx, hash, true).await?;
                    Self::set_block_status(&mut tx, hash, ChainStatus::Abandoned).await?;
                }
                ChainStatus::Pending => {
                    Self::set_block_status(&mut tx, hash, ChainStatus::Abandoned).await?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, SyncError> {
        let row = sqlx::query("SELECT * FROM blocks WHERE block_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        row.as_ref().map(Self::block_from_row).transpose()
    }

    async fn block_at(
        &self,
        number: u64,
        status: ChainStatus,
    ) -> Result<Option<Block>, SyncError> {
        let row = sqlx::query("SELECT * FROM blocks WHERE number = ? AND status = ? LIMIT 1")
            .bind(number as i64)
            .bind(status_str(status))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        row.as_ref().map(Self::block_from_row).transpose()
    }

    async fn latest_authentic_number(&self) -> Result<Option<u64>, SyncError> {
        let row = sqlx::query("SELECT MAX(number) AS tip FROM blocks WHERE status = 'authentic'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        let tip: Option<i64> = row.get("tip");
        Ok(tip.map(|n| n as u64))
    }

    async fn transaction_by_hash(&self, hash: &str) -> Result<Option<Transaction>, SyncError> {
        let row = sqlx::query("SELECT * FROM transactions WHERE tx_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        row.as_ref().map(Self::tx_from_row).transpose()
    }

    async fn block_tx_hashes(&self, block_hash: &str) -> Result<Vec<String>, SyncError> {
        let rows = sqlx::query(
            "SELECT tx_hash FROM transactions WHERE block_hash = ? ORDER BY tx_index",
        )
        .bind(block_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("tx_hash")).collect())
    }

    async fn cell_inputs(&self, tx_hash: &str) -> Result<Vec<CellInput>, SyncError> {
        let rows = sqlx::query(
            "SELECT previous_tx_hash, previous_index, args
             FROM cell_inputs WHERE tx_hash = ? ORDER BY input_index",
        )
        .bind(tx_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        rows.iter().map(Self::input_from_row).collect()
    }

    async fn cell_outputs(&self, tx_hash: &str) -> Result<Vec<CellOutput>, SyncError> {
        let rows = sqlx::query(
            "SELECT capacity, data, lock_code_hash, lock_version, lock_args,
                    type_code_hash, type_version, type_args
             FROM cell_outputs WHERE tx_hash = ? ORDER BY output_index",
        )
        .bind(tx_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        rows.iter().map(Self::output_from_row).collect()
    }

    async fn account(&self, address: &str) -> Result<Option<Account>, SyncError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE address_hash = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(row.map(|r| Account {
            address_hash: r.get("address_hash"),
            balance: r.get("balance"),
            cell_consumed: r.get("cell_consumed"),
            transactions_count: r.get("transactions_count"),
        }))
    }

    async fn previous_cell(
        &self,
        out_point: &OutPoint,
    ) -> Result<Option<CellWithOwner>, SyncError> {
        let row = sqlx::query(
            "SELECT capacity, address_hash FROM cell_outputs
             WHERE tx_hash = ? AND output_index = ?",
        )
        .bind(&out_point.tx_hash)
        .bind(out_point.index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(row.map(|r| CellWithOwner {
            capacity: r.get::<i64, _>("capacity") as u64,
            address_hash: r.get("address_hash"),
        }))
    }

    async fn update_display_fields(
        &self,
        tx_hash: &str,
        inputs: Vec<DisplayInput>,
        outputs: Vec<DisplayOutput>,
    ) -> Result<bool, SyncError> {
        let inputs_json =
            serde_json::to_string(&inputs).map_err(|e| SyncError::Storage(e.to_string()))?;
        let outputs_json =
            serde_json::to_string(&outputs).map_err(|e| SyncError::Storage(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE transactions SET display_inputs = ?, display_outputs = ?
             WHERE tx_hash = ? AND status <> 'abandoned'",
        )
        .bind(&inputs_json)
        .bind(&outputs_json)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn cursor(&self, name: &str) -> Result<Option<SyncCursor>, SyncError> {
        let row = sqlx::query("SELECT * FROM sync_cursors WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        row.map(|r| {
            let status: String = r.get("status");
            Ok(SyncCursor {
                name: r.get("name"),
                value: r.get::<i64, _>("value") as u64,
                status: parse_cursor_status(&status)?,
                updated_at: r.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn save_cursor(&self, cursor: SyncCursor) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_cursors (name, value, status, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&cursor.name)
        .bind(cursor.value as i64)
        .bind(cursor.status.to_string())
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn advance_cursor(
        &self,
        name: &str,
        expected: Option<u64>,
        value: u64,
        status: CursorStatus,
    ) -> Result<bool, SyncError> {
        let now = chrono::Utc::now().timestamp();
        let result = match expected {
            Some(expected) => sqlx::query(
                "UPDATE sync_cursors SET value = ?, status = ?, updated_at = ?
                 WHERE name = ? AND value = ?",
            )
            .bind(value as i64)
            .bind(status.to_string())
            .bind(now)
            .bind(name)
            .bind(expected as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?,
            None => sqlx::query(
                "INSERT INTO sync_cursors (name, value, status, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(name)
            .bind(value as i64)
            .bind(status.to_string())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?,
        };
        Ok(result.rows_affected() > 0)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
