//! cellscan-core — foundation for the reorg-consistent explorer ingestion engine.
//!
//! # Architecture
//!
//! ```text
//! SyncLoop (cellscan-sync)
//!     ├── ChainClient       (node tip + raw blocks)
//!     ├── BlockDecoder      (raw → DecodedBlock)
//!     ├── LedgerStore       (blocks / transactions / cells / scripts / accounts)
//!     │       └── account deltas (applied on authentic, reversed on abandoned)
//!     ├── ReorgResolver     (fork-point walk, abandon + re-adopt)
//!     └── DisplayRefreshQueue (deduplicated derived-field recomputation)
//! ```
//!
//! This crate owns the persisted data model, the `LedgerStore` contract its
//! backends implement, and the pure account-aggregation arithmetic shared by
//! those backends. The ingestion loop itself lives in `cellscan-sync`.

pub mod account;
pub mod cursor;
pub mod error;
pub mod ledger;
pub mod types;

pub use account::{AccountDelta, transaction_deltas};
pub use cursor::{CursorStatus, SyncCursor, TIP_CURSOR};
pub use error::SyncError;
pub use ledger::{CellWithOwner, LedgerStore};
pub use types::{
    Account, Block, CellInput, CellOutput, ChainStatus, DecodedBlock, DecodedTransaction,
    DisplayInput, DisplayOutput, OutPoint, Script, Transaction, UncleBlock,
};
