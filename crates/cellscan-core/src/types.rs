//! Persisted domain entities and transient decoder output.

use serde::{Deserialize, Serialize};

// ─── ChainStatus ─────────────────────────────────────────────────────────────

/// Canonical-chain membership of a block or transaction.
///
/// Rows are never deleted: a reorg flips status instead, preserving the full
/// audit history of every branch the node ever served us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Ingested but not yet confirmed on the canonical chain.
    Pending,
    /// On the canonical chain.
    Authentic,
    /// Superseded by a reorg.
    Abandoned,
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Authentic => write!(f, "authentic"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// A block header plus the aggregate fields the explorer derives from its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block hash (`0x…`), globally unique across all statuses.
    pub block_hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Block height.
    pub number: u64,
    /// Milliseconds since epoch, as reported by the node.
    pub timestamp: i64,
    /// Compact difficulty, kept opaque (`0x…`).
    pub difficulty: String,
    /// Miner lock identity (`0x…`).
    pub miner_hash: String,
    /// Header version.
    pub version: u32,
    /// Sum of cellbase output capacities (miner reward).
    pub reward: u64,
    /// Sum of transaction fees in the block.
    pub total_transaction_fee: u64,
    /// Sum of all output capacities created by the block.
    pub total_cell_capacity: u64,
    /// Sum of capacities consumed by the block's inputs.
    pub cell_consumed: u64,
    /// Number of transactions in the block.
    pub tx_count: u32,
    /// Number of uncles carried by the block.
    pub uncles_count: u32,
    /// Hashes of the carried uncles.
    pub uncle_block_hashes: Vec<String>,
    pub status: ChainStatus,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.block_hash
    }
}

/// A sibling header referenced by a canonical block. Never a chain-extension
/// target; stored purely for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncleBlock {
    pub block_hash: String,
    pub parent_hash: String,
    pub number: u64,
    pub timestamp: i64,
    pub difficulty: String,
    pub miner_hash: String,
    pub version: u32,
    pub reward: u64,
    /// Hash of the canonical block that carries this uncle.
    pub owner_hash: String,
}

// ─── Transaction and cells ───────────────────────────────────────────────────

/// Reference to a previously created output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: String,
    pub index: u32,
}

/// A transaction row. `block_number` / `block_timestamp` are denormalized from
/// the owning block for query locality, exactly as the read API expects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash (`0x…`), globally unique across all statuses.
    pub tx_hash: String,
    /// Hash of the owning block.
    pub block_hash: String,
    pub block_number: u64,
    pub block_timestamp: i64,
    /// Declared dependencies (out-points this transaction references).
    pub deps: Vec<OutPoint>,
    pub status: ChainStatus,
    pub transaction_fee: u64,
    pub version: u32,
    /// Human-readable input projection, populated out-of-band by the
    /// display-refresh queue. `None` until the first refresh lands.
    pub display_inputs: Option<Vec<DisplayInput>>,
    /// Human-readable output projection, populated out-of-band.
    pub display_outputs: Option<Vec<DisplayOutput>>,
}

/// A consumed cell reference. The cellbase input carries no previous output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInput {
    /// `None` marks the cellbase input.
    pub previous_output: Option<OutPoint>,
    pub args: Vec<String>,
}

impl CellInput {
    pub fn is_cellbase(&self) -> bool {
        self.previous_output.is_none()
    }
}

/// A created cell: capacity locked behind exactly one lock script and at most
/// one type script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOutput {
    pub capacity: u64,
    /// Opaque cell payload (`0x…`).
    pub data: String,
    pub lock_script: Script,
    pub type_script: Option<Script>,
}

/// Code hash + version + arguments, used in both lock and type positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Script {
    pub code_hash: String,
    pub version: u32,
    pub args: Vec<String>,
}

impl Script {
    /// The account address a lock script resolves to: its first argument.
    /// A lock with no args owns no account (burn-style output).
    ///
    /// Meaningful only in the lock position; type scripts never resolve.
    pub fn address_hash(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

// ─── Account ─────────────────────────────────────────────────────────────────

/// Aggregate view of one lock-script owner. Created lazily on first reference,
/// never deleted; a fully-reversed account simply sits at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address_hash: String,
    /// Sum of capacities of currently-unspent authentic cells this address locks.
    pub balance: i64,
    /// Cumulative capacity this address has consumed as inputs.
    pub cell_consumed: i64,
    /// Number of authentic transactions touching this address.
    pub transactions_count: i64,
}

impl Account {
    pub fn new(address_hash: impl Into<String>) -> Self {
        Self {
            address_hash: address_hash.into(),
            balance: 0,
            cell_consumed: 0,
            transactions_count: 0,
        }
    }
}

// ─── Display projections ─────────────────────────────────────────────────────

/// Derived view of one input: who funded it and with how much.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInput {
    pub from_cellbase: bool,
    /// `None` for the cellbase input or when the previous owner is unknown.
    pub address_hash: Option<String>,
    /// `None` for the cellbase input.
    pub capacity: Option<u64>,
}

/// Derived view of one output: recipient and capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayOutput {
    /// `None` when the lock script resolves to no address.
    pub address_hash: Option<String>,
    pub capacity: u64,
}

// ─── Decoder output ──────────────────────────────────────────────────────────

/// One decoded transaction with its ordered inputs and outputs. Transient:
/// owned by the decoder's caller until committed through the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransaction {
    pub transaction: Transaction,
    pub inputs: Vec<CellInput>,
    pub outputs: Vec<CellOutput>,
}

/// A fully decoded block: header aggregates plus ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub block: Block,
    pub uncles: Vec<UncleBlock>,
    pub transactions: Vec<DecodedTransaction>,
}

impl DecodedBlock {
    /// Hashes of every transaction in block order.
    pub fn tx_hashes(&self) -> Vec<String> {
        self.transactions
            .iter()
            .map(|tx| tx.transaction.tx_hash.clone())
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> Block {
        Block {
            block_hash: hash.into(),
            parent_hash: parent.into(),
            number,
            timestamp: (number * 8) as i64,
            difficulty: "0x100".into(),
            miner_hash: "0xminer".into(),
            version: 0,
            reward: 0,
            total_transaction_fee: 0,
            total_cell_capacity: 0,
            cell_consumed: 0,
            tx_count: 0,
            uncles_count: 0,
            uncle_block_hashes: vec![],
            status: ChainStatus::Pending,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = block(100, "0xaaa", "0x000");
        let child = block(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = block(100, "0xaaa", "0x000");
        let b = block(102, "0xccc", "0xaaa"); // gap
        assert!(!b.extends(&a));
    }

    #[test]
    fn lock_script_resolves_first_arg() {
        let lock = Script {
            code_hash: "0xcode".into(),
            version: 0,
            args: vec!["0xabc123".into(), "extra".into()],
        };
        assert_eq!(lock.address_hash(), Some("0xabc123"));

        let burn = Script {
            code_hash: "0xcode".into(),
            version: 0,
            args: vec![],
        };
        assert_eq!(burn.address_hash(), None);
    }

    #[test]
    fn cellbase_input_has_no_previous_output() {
        let cellbase = CellInput {
            previous_output: None,
            args: vec![],
        };
        let normal = CellInput {
            previous_output: Some(OutPoint {
                tx_hash: "0xdead".into(),
                index: 0,
            }),
            args: vec![],
        };
        assert!(cellbase.is_cellbase());
        assert!(!normal.is_cellbase());
    }

    #[test]
    fn status_display() {
        assert_eq!(ChainStatus::Pending.to_string(), "pending");
        assert_eq!(ChainStatus::Authentic.to_string(), "authentic");
        assert_eq!(ChainStatus::Abandoned.to_string(), "abandoned");
    }
}
