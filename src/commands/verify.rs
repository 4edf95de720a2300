use super::load_snapshot;
use crate::Context;
use crate::ui;
use anyhow::{Context as _, Result};
use std::path::Path;

pub fn run(ctx: &Context, path: &Path) -> Result<()> {
    let snapshot = load_snapshot(path)?;
    for pending in &snapshot.pending_operations {
        ui::warn(&format!(
            "{:?} of {} was interrupted; the resource may exist without a record",
            pending.kind, pending.resource.urn
        ));
    }
    snapshot
        .verify_integrity()
        .with_context(|| format!("{} failed verification", path.display()))?;

    if !ctx.quiet {
        ui::success(&format!(
            "{} is consistent ({})",
            path.display(),
            ui::count(snapshot.resources.len(), "resource")
        ));
    }
    Ok(())
}
