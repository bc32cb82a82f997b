//! Sync cursor — the single persisted checkpoint of ingestion progress.
//!
//! The coordinator is the only writer; it advances the cursor with a
//! compare-and-swap through [`crate::ledger::LedgerStore::advance_cursor`] so
//! that at most one ingestion cycle is in flight system-wide. Operational
//! tooling reads the row to report ingestion lag.

use serde::{Deserialize, Serialize};

/// Well-known cursor name tracking the authentic tip.
pub const TIP_CURSOR: &str = "tip_block_number";

/// Whether the cursor's owner believes it has caught up with the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStatus {
    /// Still behind the node's tip.
    Syncing,
    /// Level with the node's tip as of the last tick.
    Synced,
}

impl std::fmt::Display for CursorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
        }
    }
}

/// A named progress value, e.g. `tip_block_number = 1042`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub name: String,
    pub value: u64,
    pub status: CursorStatus,
    /// Unix timestamp of the last update.
    pub updated_at: i64,
}

impl SyncCursor {
    pub fn new(name: impl Into<String>, value: u64, status: CursorStatus) -> Self {
        Self {
            name: name.into(),
            value,
            status,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Advance to a new value, refreshing the timestamp.
    pub fn advance(&mut self, value: u64, status: CursorStatus) {
        self.value = value;
        self.status = status;
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advance() {
        let mut cursor = SyncCursor::new(TIP_CURSOR, 100, CursorStatus::Syncing);
        cursor.advance(101, CursorStatus::Synced);
        assert_eq!(cursor.value, 101);
        assert_eq!(cursor.status, CursorStatus::Synced);
    }

    #[test]
    fn status_display() {
        assert_eq!(CursorStatus::Syncing.to_string(), "syncing");
        assert_eq!(CursorStatus::Synced.to_string(), "synced");
    }
}
