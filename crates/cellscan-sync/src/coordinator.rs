//! The ingestion loop.
//!
//! Each tick compares the node tip against the latest authentic height, then
//! either appends the next block, hands a fork to the [`ReorgResolver`], or
//! does nothing. The persisted cursor is advanced with a compare-and-swap so
//! only one coordinator instance system-wide can move the chain forward.
//!
//! State machine per tick:
//!   `Idle → Fetching → Deciding → {Appending | Resolving} → Idle`

use std::sync::Arc;
use std::time::Duration;

use cellscan_core::cursor::{CursorStatus, TIP_CURSOR};
use cellscan_core::types::{ChainStatus, DecodedBlock};
use cellscan_core::{LedgerStore, SyncCursor, SyncError};

use crate::client::ChainClient;
use crate::decode::decode;
use crate::jobs::DisplayRefreshQueue;
use crate::resolver::{ReorgEvent, ReorgResolver};

// ─── Config and state ────────────────────────────────────────────────────────

/// Tunables for the sync loop. Built with setter chaining:
///
/// ```
/// use cellscan_sync::SyncConfig;
/// let config = SyncConfig::new().poll_interval_ms(500).reorg_window(32);
/// assert_eq!(config.reorg_window, 32);
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    /// Maximum heights the resolver searches below a divergence.
    pub reorg_window: u64,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            poll_interval_ms: 1_000,
            reorg_window: 64,
        }
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn reorg_window(mut self, window: u64) -> Self {
        self.reorg_window = window;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a tick currently is; exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Deciding,
    Appending,
    Resolving,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Deciding => write!(f, "deciding"),
            Self::Appending => write!(f, "appending"),
            Self::Resolving => write!(f, "resolving"),
        }
    }
}

/// What one tick accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Caught up with the node, or another writer holds the cursor.
    Quiescent,
    /// One block appended to the authentic chain.
    Appended { number: u64, hash: String },
    /// A fork was resolved.
    Resolved(ReorgEvent),
}

// ─── SyncLoop ────────────────────────────────────────────────────────────────

/// Single-writer ingestion coordinator.
pub struct SyncLoop<C, S> {
    client: C,
    store: Arc<S>,
    resolver: ReorgResolver,
    config: SyncConfig,
    state: SyncState,
    refresh: Option<Arc<DisplayRefreshQueue>>,
}

impl<C, S> SyncLoop<C, S>
where
    C: ChainClient,
    S: LedgerStore + 'static,
{
    pub fn new(client: C, store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            client,
            resolver: ReorgResolver::new(config.reorg_window),
            store,
            config,
            state: SyncState::Idle,
            refresh: None,
        }
    }

    /// Attach a display-refresh queue; newly authentic blocks get their
    /// transaction sets enqueued fire-and-forget after each commit.
    pub fn with_display_refresh(mut self, queue: Arc<DisplayRefreshQueue>) -> Self {
        self.refresh = Some(queue);
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run one ingestion cycle. Transient failures propagate; nothing was
    /// persisted, so the caller just ticks again.
    pub async fn tick(&mut self) -> Result<TickOutcome, SyncError> {
        self.state = SyncState::Fetching;
        let outcome = self.cycle().await;
        self.state = SyncState::Idle;
        outcome
    }

    async fn cycle(&mut self) -> Result<TickOutcome, SyncError> {
        // Remember the cursor before touching the node; the compare-and-swap
        // below detects any other writer that moves it while we fetch.
        let expected = self.cursor_value().await?;

        let tip = self.client.tip().await?;
        let local = self.store.latest_authentic_number().await?;

        let next = match local {
            Some(h) if tip <= h => return Ok(TickOutcome::Quiescent),
            Some(h) => h + 1,
            None => 0,
        };

        let Some(raw) = self.client.block_at(next).await? else {
            return Ok(TickOutcome::Quiescent);
        };
        let decoded = decode(&raw)?;

        // Claim the cursor before mutating anything; losing the race means
        // another coordinator is mid-cycle on this height.
        let claimed = self
            .store
            .advance_cursor(TIP_CURSOR, expected, next, CursorStatus::Syncing)
            .await?;
        if !claimed {
            tracing::warn!(height = next, "cursor contention, skipping tick");
            return Ok(TickOutcome::Quiescent);
        }

        self.state = SyncState::Deciding;
        let extends_tip = match local {
            None => true, // genesis bootstraps the chain
            Some(h) => match self.store.block_at(h, ChainStatus::Authentic).await? {
                Some(parent) => decoded.block.parent_hash == parent.block_hash,
                None => true,
            },
        };

        let outcome = if extends_tip {
            self.state = SyncState::Appending;
            self.append(decoded).await?
        } else {
            self.state = SyncState::Resolving;
            let event = self.resolver.resolve(&self.client, self.store.as_ref(), decoded).await?;
            if let Some(queue) = &self.refresh {
                for hash in &event.adopted {
                    let tx_hashes = self.store.block_tx_hashes(hash).await?;
                    if !tx_hashes.is_empty() {
                        queue.enqueue(tx_hashes);
                    }
                }
            }
            TickOutcome::Resolved(event)
        };

        let status = if next >= tip {
            CursorStatus::Synced
        } else {
            CursorStatus::Syncing
        };
        self.store
            .save_cursor(SyncCursor::new(TIP_CURSOR, next, status))
            .await?;
        Ok(outcome)
    }

    async fn append(&mut self, decoded: DecodedBlock) -> Result<TickOutcome, SyncError> {
        let number = decoded.block.number;
        let hash = decoded.block.block_hash.clone();
        let tx_hashes = decoded.tx_hashes();

        match self.store.insert_block(&decoded).await {
            Ok(()) => {}
            Err(SyncError::DuplicateHash { .. }) => {
                // A previous cycle died between insert and mark; the pending
                // row is resumed. An already-authentic row would mean the
                // chain moved under us, which latest_authentic_number rules out.
                tracing::debug!(hash = %hash, "block already stored, resuming");
            }
            Err(e) => return Err(e),
        }
        self.store.mark_authentic(&[hash.clone()]).await?;
        tracing::info!(number, hash = %hash, txs = tx_hashes.len(), "block appended");

        if let Some(queue) = &self.refresh {
            if !tx_hashes.is_empty() {
                queue.enqueue(tx_hashes);
            }
        }
        Ok(TickOutcome::Appended { number, hash })
    }

    async fn cursor_value(&self) -> Result<Option<u64>, SyncError> {
        Ok(self.store.cursor(TIP_CURSOR).await?.map(|c| c.value))
    }

    /// Tick until the node reports nothing new. Used by tests and one-shot
    /// catch-up runs.
    pub async fn run_until_synced(&mut self) -> Result<(), SyncError> {
        loop {
            match self.tick().await {
                Ok(TickOutcome::Quiescent) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "transient failure, retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll forever. Transient and malformed-block failures are logged and
    /// retried on the next interval; fatal conditions halt the loop.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.tick().await {
                Ok(TickOutcome::Quiescent) => {}
                Ok(TickOutcome::Appended { number, .. }) => {
                    tracing::debug!(number, "tick appended");
                    continue; // keep draining without sleeping
                }
                Ok(TickOutcome::Resolved(event)) => {
                    tracing::info!(fork_point = event.fork_point, depth = event.depth(), "tick resolved fork");
                    continue;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "ingestion halted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tick failed, will retry");
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}
