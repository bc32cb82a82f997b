//! cellscan CLI — inspect and exercise the ingestion engine.
//!
//! Usage:
//! ```bash
//! cellscan demo
//! cellscan info
//! cellscan version
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use cellscan_core::cursor::TIP_CURSOR;
use cellscan_core::LedgerStore;
use cellscan_storage::MemoryLedger;
use cellscan_sync::client::{RawBlock, RawHeader, RawInput, RawOutput, RawScript, RawTransaction};
use cellscan_sync::{DisplayRefreshQueue, ScriptedChain, SyncConfig, SyncLoop};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "demo" => cmd_demo(),
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("cellscan {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("cellscan {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe block-explorer ingestion engine\n");
    println!("USAGE:");
    println!("    cellscan <COMMAND>\n");
    println!("COMMANDS:");
    println!("    demo     Ingest a scripted chain, reorg it, and print the ledger");
    println!("    info     Show Cellscan configuration info");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    println!("Cellscan v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default poll interval: 1000 ms");
    println!("  Default reorg lookback window: 64 blocks");
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    println!("  Block statuses: pending, authentic, abandoned");
}

/// Scripted end-to-end run: ingest three blocks, reorg the top two away,
/// then print the resulting accounts and cursor.
fn cmd_demo() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run_demo()) {
        eprintln!("demo failed: {e}");
        process::exit(1);
    }
}

async fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let chain = ScriptedChain::new();
    chain.push_block(cellbase_block(0, "0xgenesis", "0x0", "0xfoundation", 0));
    chain.push_block(cellbase_block(1, "0xa1", "0xgenesis", "0xalice", 1000));
    chain.push_block(cellbase_block(2, "0xa2", "0xa1", "0xalice", 1000));

    let store = Arc::new(MemoryLedger::new());
    let queue = Arc::new(DisplayRefreshQueue::new(
        store.clone() as Arc<dyn LedgerStore>,
        2,
    ));
    let mut sync = SyncLoop::new(chain, store.clone(), SyncConfig::new().reorg_window(16))
        .with_display_refresh(queue.clone());

    sync.run_until_synced().await?;
    tracing::info!("initial chain ingested");

    // Node switches to a competing branch above block 0.
    sync.client().reorg_to(vec![
        cellbase_block(1, "0xb1", "0xgenesis", "0xbob", 600),
        cellbase_block(2, "0xb2", "0xb1", "0xbob", 600),
        cellbase_block(3, "0xb3", "0xb2", "0xbob", 600),
    ]);
    sync.run_until_synced().await?;
    tracing::info!("reorg ingested");

    // Let the display workers drain before reading projections.
    drop(sync);
    if let Ok(queue) = Arc::try_unwrap(queue) {
        queue.close().await;
    }

    println!("ledger after reorg:");
    for address in ["0xalice", "0xbob"] {
        if let Some(account) = store.account(address).await? {
            println!(
                "  {address}: balance={} txs={}",
                account.balance, account.transactions_count
            );
        }
    }
    if let Some(cursor) = store.cursor(TIP_CURSOR).await? {
        println!("  cursor: height={} status={}", cursor.value, cursor.status);
    }
    Ok(())
}

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
            hash: format!("{hash}-cellbase"),
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
