use super::load_journal;
use crate::Context;
use crate::ui;
use anyhow::Result;
use deploy::ResourceChanges;
use ledger::{JournalEntry, Mutation, Step};
use std::collections::HashSet;
use std::path::Path;

pub fn run(ctx: &Context, path: &Path) -> Result<()> {
    let entries = load_journal(path)?;
    let changes = ResourceChanges::from_entries(&entries);

    if !ctx.quiet {
        ui::header(&format!("{} ({})", path.display(), ui::count(entries.len(), "entry")));
        for (op, count) in changes.iter() {
            println!("  {} {:<20} {count}", ui::op_symbol(op), op.as_str());
        }
        ui::kv("changes", &changes.total_changes().to_string());
        let outputs = entries
            .iter()
            .filter(|entry| matches!(entry.mutation, Mutation::Outputs { .. }))
            .count();
        if outputs > 0 {
            ui::kv("output updates", &outputs.to_string());
        }
    }

    for step in failed(&entries) {
        ui::error(&format!("{} of {} failed", step.op(), step.urn()));
    }
    for step in unfinished(&entries) {
        ui::warn(&format!("{} of {} never finished", step.op(), step.urn()));
    }
    Ok(())
}

fn failed(entries: &[JournalEntry]) -> Vec<&Step> {
    entries
        .iter()
        .filter_map(|entry| match &entry.mutation {
            Mutation::Failure { step, .. } => Some(step),
            _ => None,
        })
        .collect()
}

/// Steps with a `Begin` but no matching end entry.
fn unfinished(entries: &[JournalEntry]) -> Vec<&Step> {
    let ended: HashSet<u64> = entries
        .iter()
        .filter_map(|entry| match &entry.mutation {
            Mutation::Success { begun, .. } | Mutation::Failure { begun, .. } => Some(*begun),
            _ => None,
        })
        .collect();
    entries
        .iter()
        .filter_map(|entry| match &entry.mutation {
            Mutation::Begin { step } if !ended.contains(&entry.seq) => Some(step),
            _ => None,
        })
        .collect()
}
