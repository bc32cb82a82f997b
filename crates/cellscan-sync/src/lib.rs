//! Block ingestion for Cellscan.
//!
//! Everything between the chain node and the ledger lives here:
//!
//! - [`client`] — the [`ChainClient`] node interface, its raw wire types, and
//!   the scripted in-memory node used by tests and demos
//! - [`decode`] — pure raw-block → domain-entity decoding
//! - [`coordinator`] — the single-writer [`SyncLoop`] tick machine
//! - [`resolver`] — fork walkback and canonical-suffix swapping
//! - [`jobs`] — the deduplicated [`DisplayRefreshQueue`] worker pool

pub mod client;
pub mod coordinator;
pub mod decode;
pub mod jobs;
pub mod resolver;

pub use client::{ChainClient, RawBlock, ScriptedChain};
pub use coordinator::{SyncConfig, SyncLoop, SyncState, TickOutcome};
pub use decode::decode;
pub use jobs::{DisplayRefreshQueue, EnqueueOutcome};
pub use resolver::{ReorgEvent, ReorgResolver};
