//! Folding journal entries onto a base snapshot.
//!
//! Records completed during the run are collected in completion order. A step
//! cannot begin before its predecessors have ended, so that order already
//! respects every ordering edge among them. The materialized snapshot merges
//! those records with the untouched base records so that every reference
//! points backwards, which keeps every prefix of a journal valid.

use crate::error::{Error, ReplayError, Result};
use crate::journal::{JournalEntry, Mutation};
use crate::snapshot::{Manifest, OperationKind, PendingOperation, Snapshot};
use crate::state::ResourceState;
use crate::step::Step;
use crate::urn::Urn;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone)]
struct BaseSlot {
    state: ResourceState,
    done: bool,
}

#[derive(Debug, Clone, Copy)]
enum Location {
    New(usize),
    Base(usize),
}

/// Incremental replayer. Entries must be applied in sequence order.
#[derive(Debug, Clone)]
pub struct Replayer {
    manifest: Manifest,
    news: Vec<ResourceState>,
    base: Vec<BaseSlot>,
    base_pending: Vec<PendingOperation>,
    in_flight: BTreeMap<u64, Step>,
    aliases: HashMap<Urn, Urn>,
    latest: u64,
}

impl Replayer {
    pub fn new(base: &Snapshot) -> Self {
        Self {
            manifest: base.manifest.clone(),
            news: Vec::new(),
            base: base
                .resources
                .iter()
                .map(|state| BaseSlot {
                    state: state.clone(),
                    done: false,
                })
                .collect(),
            base_pending: base.pending_operations.clone(),
            in_flight: BTreeMap::new(),
            aliases: HashMap::new(),
            latest: 0,
        }
    }

    /// Sequence number of the last applied entry.
    pub fn latest(&self) -> u64 {
        self.latest
    }

    /// Apply the next entry.
    pub fn apply(&mut self, entry: &JournalEntry) -> Result<()> {
        let expected = self.latest + 1;
        if entry.seq < expected {
            return Err(Error::DuplicateSequence { seq: entry.seq });
        }
        if entry.seq > expected {
            return Err(Error::SequenceGap {
                previous: self.latest,
                next: entry.seq,
            });
        }

        match &entry.mutation {
            Mutation::Begin { step } => {
                self.in_flight.insert(entry.seq, step.clone());
            }
            Mutation::Failure { begun, .. } => {
                self.finish_operation(entry.seq, *begun)?;
            }
            Mutation::Success { begun, step } => {
                self.finish_operation(entry.seq, *begun)?;
                self.apply_success(step)?;
            }
            Mutation::Outputs { urn, outputs } => {
                let location = self.locate_live(urn).ok_or_else(|| Error::UnknownResource {
                    op: "outputs".to_string(),
                    urn: urn.clone(),
                    id: String::new(),
                })?;
                self.state_mut(location).outputs = outputs.clone();
            }
        }

        self.latest = entry.seq;
        Ok(())
    }

    fn finish_operation(&mut self, seq: u64, begun: u64) -> Result<()> {
        self.in_flight
            .remove(&begun)
            .map(|_| ())
            .ok_or(Error::UnmatchedEnd { seq, begun })
    }

    fn apply_success(&mut self, step: &Step) -> Result<()> {
        let op = step.op();
        match step {
            Step::Same { old, new }
            | Step::Update { old, new }
            | Step::ReadReplacement { old, new } => {
                let location = self.locate(old, op.as_str())?;
                self.supersede(location, new);
            }
            Step::Read { old, new } => match old {
                Some(old) => {
                    let location = self.locate(old, op.as_str())?;
                    self.supersede(location, new);
                }
                None => self.push(new),
            },
            Step::Create { new } | Step::Import { new } => self.push(new),
            Step::CreateReplacement { old, new } | Step::ImportReplacement { old, new } => {
                let location = self.locate(old, op.as_str())?;
                if self.state(location).pending_replacement {
                    self.remove(location);
                } else {
                    self.state_mut(location).delete = true;
                }
                self.push(new);
            }
            Step::Delete { old } | Step::DeleteReplaced { old } => {
                let location = self.locate(old, op.as_str())?;
                if old.pending_replacement {
                    self.state_mut(location).pending_replacement = true;
                } else {
                    self.remove(location);
                }
            }
            Step::ReadDiscard { old } | Step::DiscardReplaced { old } => {
                let location = self.locate(old, op.as_str())?;
                self.remove(location);
            }
            Step::Refresh { old, new } => {
                let location = self.locate(old, op.as_str())?;
                match new {
                    Some(new) => *self.state_mut(location) = new.as_ref().clone(),
                    None => {
                        self.remove(location);
                        self.forget(&old.urn);
                    }
                }
            }
            Step::Replace { .. } => {}
        }
        Ok(())
    }

    fn matches(candidate: &ResourceState, target: &ResourceState) -> bool {
        candidate.urn == target.urn && candidate.id == target.id && candidate.delete == target.delete
    }

    /// Find the record a step consumes, matching URN, ID and the
    /// pending-delete flag (a replacement and its predecessor share a URN).
    fn locate(&self, target: &ResourceState, op: &str) -> Result<Location> {
        if let Some(i) = self.news.iter().rposition(|r| Self::matches(r, target)) {
            return Ok(Location::New(i));
        }
        if let Some(i) = self
            .base
            .iter()
            .position(|slot| !slot.done && Self::matches(&slot.state, target))
        {
            return Ok(Location::Base(i));
        }
        Err(Error::UnknownResource {
            op: op.to_string(),
            urn: target.urn.clone(),
            id: target.id.clone(),
        })
    }

    fn locate_live(&self, urn: &Urn) -> Option<Location> {
        self.news
            .iter()
            .rposition(|r| &r.urn == urn && !r.delete)
            .map(Location::New)
            .or_else(|| {
                self.base
                    .iter()
                    .position(|slot| !slot.done && &slot.state.urn == urn && !slot.state.delete)
                    .map(Location::Base)
            })
    }

    fn state(&self, location: Location) -> &ResourceState {
        match location {
            Location::New(i) => &self.news[i],
            Location::Base(i) => &self.base[i].state,
        }
    }

    fn state_mut(&mut self, location: Location) -> &mut ResourceState {
        match location {
            Location::New(i) => &mut self.news[i],
            Location::Base(i) => &mut self.base[i].state,
        }
    }

    fn remove(&mut self, location: Location) {
        match location {
            Location::New(i) => {
                self.news.remove(i);
            }
            Location::Base(i) => self.base[i].done = true,
        }
    }

    /// Replace a consumed record with its successor. Records produced earlier
    /// in this run are updated in place so nothing created after them moves
    /// ahead of them.
    fn supersede(&mut self, location: Location, new: &ResourceState) {
        match location {
            Location::New(i) => {
                self.record_aliases(new);
                self.news[i] = new.clone();
            }
            Location::Base(i) => {
                self.base[i].done = true;
                self.push(new);
            }
        }
    }

    fn push(&mut self, new: &ResourceState) {
        self.record_aliases(new);
        self.news.push(new.clone());
    }

    fn record_aliases(&mut self, new: &ResourceState) {
        for alias in &new.aliases {
            if alias != &new.urn {
                self.aliases.insert(alias.clone(), new.urn.clone());
            }
        }
    }

    fn forget(&mut self, urn: &Urn) {
        self.news.iter_mut().for_each(|r| r.forget(urn));
        self.base.iter_mut().for_each(|slot| slot.state.forget(urn));
    }

    /// Materialize the snapshot as of the last applied entry.
    pub fn snapshot(&self) -> Snapshot {
        let normalize = |mut state: ResourceState| {
            if !self.aliases.is_empty() {
                state.rewrite_references(|urn| self.aliases.get(urn).cloned());
            }
            state
        };
        let news: Vec<ResourceState> = self.news.iter().cloned().map(normalize).collect();
        let remaining: Vec<ResourceState> = self
            .base
            .iter()
            .filter(|slot| !slot.done)
            .map(|slot| normalize(slot.state.clone()))
            .collect();

        let mut pending_operations: Vec<PendingOperation> = self
            .base_pending
            .iter()
            .filter(|op| op.kind == OperationKind::Creating)
            .cloned()
            .collect();
        pending_operations.extend(self.in_flight.values().filter_map(pending_operation));

        Snapshot {
            manifest: self.manifest.clone(),
            resources: merge(remaining, news),
            pending_operations,
        }
    }
}

/// Interleave untouched base records with records produced by the run,
/// keeping the relative order of each list and emitting a record only once
/// everything it refers to has been emitted. Base records win ties so an
/// unchanged snapshot keeps its layout.
fn merge(base: Vec<ResourceState>, news: Vec<ResourceState>) -> Vec<ResourceState> {
    let mut emitted_urns: HashSet<Urn> = HashSet::new();
    let mut emitted_providers: HashSet<(Urn, String)> = HashSet::new();
    let ready = |state: &ResourceState, urns: &HashSet<Urn>, providers: &HashSet<(Urn, String)>| {
        state.parent.as_ref().is_none_or(|p| urns.contains(p))
            && state
                .provider
                .as_ref()
                .is_none_or(|p| providers.contains(&(p.urn.clone(), p.id.clone())))
            && state
                .dependencies
                .iter()
                .chain(state.property_dependencies.values().flatten())
                .all(|d| urns.contains(d))
    };

    let mut result = Vec::with_capacity(base.len() + news.len());
    let mut base = base.into_iter().peekable();
    let mut news = news.into_iter().peekable();
    loop {
        let from_base = match (base.peek(), news.peek()) {
            (None, None) => break,
            (Some(b), _) if ready(b, &emitted_urns, &emitted_providers) => true,
            (_, Some(n)) if ready(n, &emitted_urns, &emitted_providers) => false,
            // nothing is ready: the inputs are inconsistent, let verification report it
            (_, news_head) => news_head.is_none(),
        };
        let next = if from_base { base.next() } else { news.next() };
        let Some(state) = next else { break };
        emitted_urns.insert(state.urn.clone());
        if !state.id.is_empty() {
            emitted_providers.insert((state.urn.clone(), state.id.clone()));
        }
        result.push(state);
    }
    result
}

fn pending_operation(step: &Step) -> Option<PendingOperation> {
    let kind = match step {
        Step::Create { .. } | Step::CreateReplacement { .. } => OperationKind::Creating,
        Step::Update { .. } => OperationKind::Updating,
        Step::Delete { .. } | Step::DeleteReplaced { .. } => OperationKind::Deleting,
        Step::Read { .. } | Step::ReadReplacement { .. } | Step::Refresh { .. } => {
            OperationKind::Reading
        }
        Step::Import { .. } | Step::ImportReplacement { .. } => OperationKind::Importing,
        Step::Same { .. }
        | Step::Replace { .. }
        | Step::ReadDiscard { .. }
        | Step::DiscardReplaced { .. } => return None,
    };
    let resource = step.new_state().or_else(|| step.old())?.clone();
    Some(PendingOperation { resource, kind })
}

/// Fold `entries` onto `base` in sequence order and verify the result.
///
/// Entries may arrive in any order; they are sorted first. On failure the
/// error carries the snapshot folded up to the failing entry.
pub fn replay(base: &Snapshot, entries: &[JournalEntry]) -> std::result::Result<Snapshot, ReplayError> {
    let mut sorted: Vec<&JournalEntry> = entries.iter().collect();
    sorted.sort_by_key(|entry| entry.seq);

    let mut replayer = Replayer::new(base);
    for entry in sorted {
        if let Err(err) = replayer.apply(entry) {
            log::debug!("Replay stopped at entry {}: {err}", entry.seq);
            return Err(ReplayError::with_partial(err, replayer.snapshot()));
        }
    }

    let snapshot = replayer.snapshot();
    if let Err(err) = snapshot.verify_integrity() {
        return Err(ReplayError::with_partial(err.into(), snapshot));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::property::property_map;
    use crate::urn::{ProviderRef, provider_type};
    use proptest::prelude::*;

    fn provider() -> ResourceState {
        let ty = provider_type("pkgA");
        let mut state = ResourceState::new(Urn::new("s", "p", None, &ty, "default"), ty, true);
        state.id = "prov-id".to_string();
        state
    }

    fn custom(name: &str, id: &str) -> ResourceState {
        let mut state = ResourceState::new(Urn::new("s", "p", None, "pkgA:m:typA", name), "pkgA:m:typA", true);
        state.id = id.to_string();
        state.provider = Some(ProviderRef::new(provider().urn, "prov-id"));
        state.inputs = property_map([("foo", "bar")]);
        state
    }

    fn boxed(state: &ResourceState) -> Box<ResourceState> {
        Box::new(state.clone())
    }

    /// Journal `step` as a successful begin/end pair.
    fn apply(journal: &Journal, step: Step) {
        let begun = journal.begin(step.clone()).unwrap();
        journal.end(begun, step, true).unwrap();
    }

    fn assert_prefixes_valid(base: &Snapshot, entries: &[JournalEntry]) {
        for k in 0..=entries.len() {
            let snapshot = replay(base, &entries[..k])
                .unwrap_or_else(|e| panic!("prefix {k} failed: {e}"));
            snapshot.verify_integrity().unwrap();
        }
    }

    #[test]
    fn test_empty_journal_returns_base() {
        let base = Snapshot::new(vec![provider(), custom("a", "a1")]);
        let snapshot = replay(&base, &[]).unwrap();
        assert_eq!(snapshot, base);
    }

    #[test]
    fn test_create_before_replace_sequence() {
        let base = Snapshot::new(vec![provider(), custom("a", "a1")]);
        let old = custom("a", "a1");
        let mut new = custom("a", "a2");
        new.inputs = property_map([("foo", "baz")]);
        let mut condemned = old.clone();
        condemned.delete = true;

        let journal = Journal::new();
        apply(&journal, Step::CreateReplacement { old: boxed(&old), new: boxed(&new) });
        apply(&journal, Step::Replace { old: boxed(&old), new: boxed(&new) });

        let midway = replay(&base, &journal.entries()).unwrap();
        assert_eq!(midway.resources.len(), 3);
        assert!(midway.resources.iter().any(|r| r.delete && r.id == "a1"));

        apply(&journal, Step::DeleteReplaced { old: boxed(&condemned) });
        let entries = journal.entries();
        assert_prefixes_valid(&base, &entries);

        let snapshot = replay(&base, &entries).unwrap();
        assert_eq!(snapshot.resources.len(), 2);
        assert_eq!(snapshot.get(&old.urn).unwrap().id, "a2");
    }

    #[test]
    fn test_delete_before_replace_keeps_dependents_valid() {
        let a = custom("a", "a1");
        let mut b = custom("b", "b1");
        b.dependencies.push(a.urn.clone());
        let base = Snapshot::new(vec![provider(), a.clone(), b.clone()]);

        let mut a_doomed = a.clone();
        a_doomed.pending_replacement = true;
        let mut b_doomed = b.clone();
        b_doomed.pending_replacement = true;
        let a_new = custom("a", "a2");
        let mut b_new = custom("b", "b2");
        b_new.dependencies.push(a.urn.clone());

        let journal = Journal::new();
        apply(&journal, Step::DeleteReplaced { old: boxed(&b_doomed) });
        apply(&journal, Step::DeleteReplaced { old: boxed(&a_doomed) });
        apply(&journal, Step::Replace { old: boxed(&a), new: boxed(&a_new) });
        apply(&journal, Step::CreateReplacement { old: boxed(&a), new: boxed(&a_new) });
        apply(&journal, Step::Replace { old: boxed(&b), new: boxed(&b_new) });
        apply(&journal, Step::CreateReplacement { old: boxed(&b), new: boxed(&b_new) });

        let entries = journal.entries();
        assert_prefixes_valid(&base, &entries);

        let after_deletes = replay(&base, &entries[..4]).unwrap();
        assert!(after_deletes.resources.iter().all(|r| !r.is_provider() == r.pending_replacement));

        let snapshot = replay(&base, &entries).unwrap();
        let ids: Vec<&str> = snapshot.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["prov-id", "a2", "b2"]);
        assert!(snapshot.resources.iter().all(|r| !r.pending_replacement));
    }

    #[test]
    fn test_unfinished_create_becomes_pending_operation() {
        let base = Snapshot::new(vec![provider()]);
        let journal = Journal::new();
        journal.begin(Step::Create { new: boxed(&custom("a", "")) }).unwrap();

        let snapshot = replay(&base, &journal.entries()).unwrap();
        assert_eq!(snapshot.resources.len(), 1);
        assert_eq!(snapshot.pending_operations.len(), 1);
        assert_eq!(snapshot.pending_operations[0].kind, OperationKind::Creating);

        // carried forward by a later replay that never touches it
        let again = replay(&snapshot, &[]).unwrap();
        assert_eq!(again.pending_operations.len(), 1);
    }

    #[test]
    fn test_failure_leaves_state_untouched() {
        let base = Snapshot::new(vec![provider(), custom("a", "a1")]);
        let old = custom("a", "a1");
        let new = custom("a", "a1");
        let journal = Journal::new();
        let begun = journal.begin(Step::Update { old: boxed(&old), new: boxed(&new) }).unwrap();
        journal
            .end(begun, Step::Update { old: boxed(&old), new: boxed(&new) }, false)
            .unwrap();

        let snapshot = replay(&base, &journal.entries()).unwrap();
        assert_eq!(snapshot.resources, base.resources);
        assert!(snapshot.pending_operations.is_empty());
    }

    #[test]
    fn test_unknown_resource_returns_partial() {
        let base = Snapshot::new(vec![provider(), custom("a", "a1")]);
        let journal = Journal::new();
        apply(&journal, Step::Create { new: boxed(&custom("b", "b1")) });
        apply(&journal, Step::Delete { old: boxed(&custom("ghost", "g1")) });

        let err = replay(&base, &journal.entries()).unwrap_err();
        assert!(matches!(err.source, Error::UnknownResource { .. }));
        let partial = err.partial.expect("partial snapshot");
        assert!(partial.get(&custom("b", "b1").urn).is_some());
    }

    #[test]
    fn test_sequence_gap_rejected() {
        let base = Snapshot::new(vec![provider()]);
        let journal = Journal::new();
        apply(&journal, Step::Create { new: boxed(&custom("a", "a1")) });
        let mut entries = journal.entries();
        entries[1].seq = 5;
        let err = replay(&base, &entries).unwrap_err();
        assert!(matches!(err.source, Error::SequenceGap { previous: 1, next: 5 }));
        assert!(err.partial.is_some());
    }

    #[test]
    fn test_outputs_patch_recorded_resource() {
        let base = Snapshot::new(vec![provider()]);
        let journal = Journal::new();
        let a = custom("a", "a1");
        apply(&journal, Step::Create { new: boxed(&a) });
        journal
            .record_outputs(a.urn.clone(), property_map([("answer", 42)]))
            .unwrap();

        let snapshot = replay(&base, &journal.entries()).unwrap();
        assert_eq!(snapshot.get(&a.urn).unwrap().outputs["answer"], 42);
    }

    #[test]
    fn test_refresh_removal_strips_references() {
        let a = custom("a", "a1");
        let mut b = custom("b", "b1");
        b.dependencies.push(a.urn.clone());
        let base = Snapshot::new(vec![provider(), a.clone(), b]);

        let journal = Journal::new();
        apply(&journal, Step::Refresh { old: boxed(&a), new: None });
        let snapshot = replay(&base, &journal.entries()).unwrap();
        assert!(snapshot.get(&a.urn).is_none());
        assert!(snapshot.resources.iter().all(|r| r.dependencies.is_empty()));
    }

    #[test]
    fn test_alias_normalizes_references() {
        let old = custom("old-name", "a1");
        let mut child = custom("child", "c1");
        child.dependencies.push(old.urn.clone());
        let base = Snapshot::new(vec![provider(), old.clone(), child.clone()]);

        let mut renamed = custom("new-name", "a1");
        renamed.aliases.push(old.urn.clone());
        let journal = Journal::new();
        apply(&journal, Step::Same { old: boxed(&old), new: boxed(&renamed) });

        let snapshot = replay(&base, &journal.entries()).unwrap();
        let child = snapshot.get(&child.urn).unwrap();
        assert_eq!(child.dependencies, vec![renamed.urn.clone()]);
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// One resource's worth of journaled work, emitted as begin/end pairs.
    struct Chain {
        steps: Vec<(Step, bool)>,
        next: usize,
        begun: Option<u64>,
    }

    impl Chain {
        fn new(steps: Vec<(Step, bool)>) -> Self {
            Self { steps, next: 0, begun: None }
        }

        fn is_done(&self) -> bool {
            self.next == self.steps.len()
        }

        fn advance(&mut self, journal: &Journal) {
            let (step, success) = self.steps[self.next].clone();
            match self.begun.take() {
                None => self.begun = Some(journal.begin(step).unwrap()),
                Some(begun) => {
                    journal.end(begun, step, success).unwrap();
                    self.next += 1;
                }
            }
        }
    }

    fn chain_for(action: u8, index: usize) -> (Option<ResourceState>, Chain) {
        let name = format!("r{index}");
        let old = custom(&name, &format!("{name}-1"));
        let mut updated = old.clone();
        updated.outputs = property_map([("rev", 2)]);
        let replacement = custom(&name, &format!("{name}-2"));
        let mut condemned = old.clone();
        condemned.delete = true;
        let mut doomed = old.clone();
        doomed.pending_replacement = true;

        let steps = match action {
            0 => vec![(Step::Same { old: boxed(&old), new: boxed(&old) }, true)],
            1 => vec![(Step::Update { old: boxed(&old), new: boxed(&updated) }, true)],
            2 => vec![
                (Step::CreateReplacement { old: boxed(&old), new: boxed(&replacement) }, true),
                (Step::Replace { old: boxed(&old), new: boxed(&replacement) }, true),
                (Step::DeleteReplaced { old: boxed(&condemned) }, true),
            ],
            3 => vec![(Step::Delete { old: boxed(&old) }, true)],
            4 => vec![
                (Step::DeleteReplaced { old: boxed(&doomed) }, true),
                (Step::Replace { old: boxed(&old), new: boxed(&replacement) }, true),
                (Step::CreateReplacement { old: boxed(&old), new: boxed(&replacement) }, true),
            ],
            5 => vec![(Step::Update { old: boxed(&old), new: boxed(&updated) }, false)],
            _ => {
                let fresh = custom(&format!("new{index}"), &format!("new{index}-1"));
                return (None, Chain::new(vec![(Step::Create { new: boxed(&fresh) }, true)]));
            }
        };
        (Some(old), Chain::new(steps))
    }

    /// Build a base snapshot and an interleaved journal from random choices.
    fn scenario(actions: &[u8], picks: &[prop::sample::Index]) -> (Snapshot, Vec<JournalEntry>) {
        let mut resources = vec![provider()];
        let mut chains = Vec::new();
        for (i, action) in actions.iter().enumerate() {
            let (old, chain) = chain_for(*action, i);
            resources.extend(old);
            chains.push(chain);
        }

        let journal = Journal::new();
        for pick in picks {
            let live: Vec<usize> = (0..chains.len()).filter(|i| !chains[*i].is_done()).collect();
            if live.is_empty() {
                break;
            }
            chains[live[pick.index(live.len())]].advance(&journal);
        }
        for chain in &mut chains {
            while !chain.is_done() {
                chain.advance(&journal);
            }
        }
        (Snapshot::new(resources), journal.into_entries())
    }

    proptest! {
        #[test]
        fn prop_every_prefix_verifies(
            actions in prop::collection::vec(0u8..7, 1..8),
            picks in prop::collection::vec(any::<prop::sample::Index>(), 0..48),
        ) {
            let (base, entries) = scenario(&actions, &picks);
            for k in 0..=entries.len() {
                let result = replay(&base, &entries[..k]);
                prop_assert!(result.is_ok(), "prefix {} failed: {:?}", k, result.err());
            }
        }

        #[test]
        fn prop_arrival_order_does_not_matter(
            actions in prop::collection::vec(0u8..7, 1..8),
            picks in prop::collection::vec(any::<prop::sample::Index>(), 0..48),
            rotation in any::<prop::sample::Index>(),
        ) {
            let (base, entries) = scenario(&actions, &picks);
            let mut arrived = entries.clone();
            arrived.reverse();
            let by = rotation.index(arrived.len());
            arrived.rotate_left(by);

            let in_order = replay(&base, &entries).unwrap();
            let out_of_order = replay(&base, &arrived).unwrap();
            prop_assert_eq!(in_order, out_of_order);
        }
    }
}
