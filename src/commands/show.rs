use super::load_snapshot;
use crate::Context;
use crate::cli::ShowFormat;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use ledger::{ResourceState, Snapshot, Urn};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub fn run(ctx: &Context, path: &Path, format: Option<ShowFormat>) -> Result<()> {
    let snapshot = load_snapshot(path)?;
    match format.unwrap_or(ctx.config.show.format) {
        ShowFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        ShowFormat::Tree => print_tree(&snapshot, path),
    }
    Ok(())
}

fn print_tree(snapshot: &Snapshot, path: &Path) {
    ui::header(&format!("{} ({})", path.display(), ui::count(snapshot.resources.len(), "resource")));
    ui::kv("version", &snapshot.manifest.version);
    ui::kv("time", &snapshot.manifest.time.to_rfc3339());
    println!();

    for (depth, record) in tree_order(snapshot) {
        let mut line = format!("{}{} {}", "  ".repeat(depth + 1), record.urn.name().bold(), record.ty.dimmed());
        if !record.id.is_empty() {
            line.push_str(&format!(" {}", record.id.cyan()));
        }
        let flags = flags(record);
        if !flags.is_empty() {
            line.push_str(&format!(" {}", format!("[{}]", flags.join(", ")).yellow()));
        }
        println!("{line}");
    }

    for pending in &snapshot.pending_operations {
        ui::warn(&format!("Interrupted {:?} of {}", pending.kind, pending.resource.urn));
    }
}

/// Display parent of a record: its parent, or the owner of a view.
fn display_parent(record: &ResourceState) -> Option<&Urn> {
    record.parent.as_ref().or(record.view_of.as_ref())
}

/// Records in depth-first order under their parents, with their depth.
///
/// Records whose parent is not live in the snapshot are shown at the top
/// level. Records pending deletion never get children.
fn tree_order(snapshot: &Snapshot) -> Vec<(usize, &ResourceState)> {
    let live: HashSet<&Urn> = snapshot.resources.iter().filter(|r| !r.delete).map(|r| &r.urn).collect();
    let mut children: HashMap<&Urn, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (index, record) in snapshot.resources.iter().enumerate() {
        match display_parent(record) {
            Some(parent) if live.contains(parent) => children.entry(parent).or_default().push(index),
            _ => roots.push(index),
        }
    }

    let mut order = Vec::with_capacity(snapshot.resources.len());
    let mut stack: Vec<(usize, usize)> = roots.into_iter().rev().map(|index| (0, index)).collect();
    while let Some((depth, index)) = stack.pop() {
        let record = &snapshot.resources[index];
        order.push((depth, record));
        if record.delete {
            continue;
        }
        if let Some(kids) = children.get(&record.urn) {
            stack.extend(kids.iter().rev().map(|&kid| (depth + 1, kid)));
        }
    }
    order
}

fn flags(record: &ResourceState) -> Vec<&'static str> {
    [
        (record.is_provider(), "provider"),
        (record.view_of.is_some(), "view"),
        (record.protect, "protected"),
        (record.external, "external"),
        (record.retain_on_delete, "retained"),
        (record.taint, "tainted"),
        (record.delete, "pending delete"),
        (record.pending_replacement, "pending replacement"),
    ]
    .into_iter()
    .filter_map(|(set, flag)| set.then_some(flag))
    .collect()
}
