pub mod replay;
pub mod show;
pub mod summary;
pub mod verify;

use anyhow::{Context as _, Result};
use ledger::{JournalEntry, Snapshot, read_entries};
use std::path::Path;

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    Snapshot::load(path).with_context(|| format!("Could not load snapshot {}", path.display()))
}

/// Journal entries in sequence order.
fn load_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    let mut entries = read_entries(path).with_context(|| format!("Could not read journal {}", path.display()))?;
    entries.sort_by_key(|entry| entry.seq);
    Ok(entries)
}
