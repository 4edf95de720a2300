//! Run events and change summaries.

use crate::error::Diagnostic;
use ledger::{JournalEntry, Mutation, Step, StepOp};
use std::collections::BTreeMap;

/// Lifecycle state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStatus {
    Pending,
    InProgress,
    Applied,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed | Self::Skipped)
    }
}

/// Receives progress while a deployment runs.
///
/// Every method has a no-op default, so implementors only override what they
/// display. Methods are called from pool threads.
pub trait EventSink: Send + Sync {
    /// Called once before any step runs
    fn on_run_start(&self, _preview: bool) {}

    /// Called when a step starts executing
    fn on_step_start(&self, _step: &Step) {}

    /// Called when a step reaches a terminal status
    fn on_step_done(&self, _step: &Step, _status: StepStatus) {}

    /// Called for every entry appended to the journal
    fn on_journal_entry(&self, _entry: &JournalEntry) {}

    /// Called for each per-resource problem
    fn on_diagnostic(&self, _diagnostic: &Diagnostic) {}

    /// Called once after the run finished
    fn on_run_end(&self, _changes: &ResourceChanges) {}
}

/// Sink that ignores every event.
pub struct NoEvents;

impl EventSink for NoEvents {}

/// Sink that forwards events to the `log` facade.
pub struct LogEvents;

impl EventSink for LogEvents {
    fn on_step_done(&self, step: &Step, status: StepStatus) {
        log::info!("{} {}: {status:?}", step.op(), step.urn());
    }

    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        if diagnostic.is_error() {
            log::error!("{diagnostic}");
        } else {
            log::warn!("{diagnostic}");
        }
    }
}

/// Count of applied steps per operation.
///
/// The parts of a replacement are not counted; its `Replace` marker is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceChanges {
    counts: BTreeMap<StepOp, usize>,
}

impl ResourceChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one applied step.
    pub fn add(&mut self, op: StepOp) {
        if !op.is_replacement_part() {
            *self.counts.entry(op).or_default() += 1;
        }
    }

    /// Changes recorded by the successful steps of a journal.
    pub fn from_entries(entries: &[JournalEntry]) -> Self {
        let mut changes = Self::new();
        for entry in entries {
            if let Mutation::Success { step, .. } = &entry.mutation {
                changes.add(step.op());
            }
        }
        changes
    }

    pub fn count(&self, op: StepOp) -> usize {
        self.counts.get(&op).copied().unwrap_or_default()
    }

    /// Total number of changes, excluding `Same`.
    pub fn total_changes(&self) -> usize {
        self.counts
            .iter()
            .filter(|(op, _)| **op != StepOp::Same)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn merge(&mut self, other: &ResourceChanges) {
        for (op, count) in &other.counts {
            *self.counts.entry(*op).or_default() += count;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StepOp, usize)> + '_ {
        self.counts.iter().map(|(op, count)| (*op, *count))
    }
}
