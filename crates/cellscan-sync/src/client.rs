//! Chain node client.
//!
//! The node is an opaque request/response data source: `tip()` for the best
//! height it knows, `block_at(height)` for the raw block body. Raw types
//! mirror the node's JSON shape; the decoder turns them into domain entities.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cellscan_core::SyncError;

// ─── Raw wire types ──────────────────────────────────────────────────────────

/// A raw block as served by the node: header, uncles, ordered transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub header: RawHeader,
    #[serde(default)]
    pub uncles: Vec<RawUncleBlock>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHeader {
    pub hash: String,
    #[serde(rename = "parent_hash")]
    pub parent_hash: String,
    pub number: u64,
    pub timestamp: i64,
    pub difficulty: String,
    #[serde(rename = "miner_hash", default)]
    pub miner_hash: String,
    #[serde(default)]
    pub version: u32,
}

/// An uncle as embedded in the owning block's body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUncleBlock {
    pub header: RawHeader,
    #[serde(default)]
    pub reward: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub deps: Vec<RawOutPoint>,
    #[serde(default)]
    pub inputs: Vec<RawInput>,
    #[serde(default)]
    pub outputs: Vec<RawOutput>,
}

/// Previous-output reference. The cellbase input points at the null hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutPoint {
    #[serde(rename = "tx_hash")]
    pub tx_hash: String,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInput {
    #[serde(rename = "previous_output")]
    pub previous_output: Option<RawOutPoint>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutput {
    /// Capacity as the node serializes it: a signed decimal. Negative values
    /// are rejected by the decoder.
    pub capacity: i64,
    #[serde(default)]
    pub data: String,
    pub lock: RawScript,
    #[serde(rename = "type", default)]
    pub type_: Option<RawScript>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScript {
    #[serde(rename = "binary_hash")]
    pub code_hash: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub args: Vec<String>,
}

// ─── ChainClient ─────────────────────────────────────────────────────────────

/// Read access to a chain node. Implementations must be side-effect free on
/// failure so a failed call can always be retried on the next tick.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current best height known to the node.
    async fn tip(&self) -> Result<u64, SyncError>;

    /// Raw block at `height`, or `None` if the node has no block there yet.
    async fn block_at(&self, height: u64) -> Result<Option<RawBlock>, SyncError>;
}

// ─── ScriptedChain ───────────────────────────────────────────────────────────

use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-memory node backed by a scripted sequence of blocks. Used by tests and
/// the demo CLI; re-scripting a height simulates a fork, `set_available(false)`
/// simulates a node outage.
#[derive(Default)]
pub struct ScriptedChain {
    inner: Mutex<ScriptedInner>,
}

#[derive(Default)]
struct ScriptedInner {
    blocks: BTreeMap<u64, RawBlock>,
    available: bool,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ScriptedInner {
                blocks: BTreeMap::new(),
                available: true,
            }),
        }
    }

    /// Script (or re-script) the block at its header height. Re-scripting an
    /// occupied height replaces the old branch from that height up.
    pub fn push_block(&self, block: RawBlock) {
        let mut inner = self.lock();
        let number = block.header.number;
        inner.blocks.split_off(&number);
        inner.blocks.insert(number, block);
    }

    /// Replace the suffix of the chain from `blocks[0].header.number` with an
    /// alternate branch.
    pub fn reorg_to(&self, blocks: Vec<RawBlock>) {
        for block in blocks {
            self.push_block(block);
        }
    }

    /// Toggle node availability; while unavailable every call returns
    /// `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedInner> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn tip(&self) -> Result<u64, SyncError> {
        let inner = self.lock();
        if !inner.available {
            return Err(SyncError::Unavailable("node offline".into()));
        }
        inner
            .blocks
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| SyncError::Unavailable("node has no blocks".into()))
    }

    async fn block_at(&self, height: u64) -> Result<Option<RawBlock>, SyncError> {
        let inner = self.lock();
        if !inner.available {
            return Err(SyncError::Unavailable("node offline".into()));
        }
        Ok(inner.blocks.get(&height).cloned())
    }
}
