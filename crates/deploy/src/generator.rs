//! Step generation: decide what to do about each registration.
//!
//! The generator compares a goal with the record the prior snapshot holds for
//! it and emits the ordered steps that converge one into the other. It runs
//! on the deployment loop only and never mutates the prior snapshot; what it
//! has decided so far lives in its own sets.

use crate::error::{Diagnostic, DiagnosticKind, Error, Result};
use crate::goal::{Goal, ReadGoal};
use crate::graph::{DependencyGraph, delete_order};
use crate::provider::{DiffChanges, DiffRequest, DiffResponse, MigrateRequest, Provider};
use crate::registry::ProviderRegistry;
use crate::views::view_state;
use ledger::{ResourceState, Snapshot, Step, StepOp, Urn, changed_keys, is_provider_type};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What a registration turned into.
#[derive(Debug)]
pub enum Generated {
    /// Steps to run, in order
    Steps(Vec<Step>),
    /// Nothing runs; the registration is answered with this problem
    Rejected(Diagnostic),
}

impl Generated {
    fn steps(steps: Vec<Step>) -> Result<Self> {
        Ok(Generated::Steps(steps))
    }
}

/// A delete-phase step and the deletes that must finish before it.
#[derive(Debug)]
pub struct PlannedDelete {
    pub index: usize,
    pub step: Step,
    /// Indexes of other planned deletes
    pub after: Vec<usize>,
}

pub struct StepGenerator {
    prior: Snapshot,
    live: HashMap<Urn, usize>,
    graph: DependencyGraph,
    registry: Arc<ProviderRegistry>,
    /// URNs registered during this run
    registered: HashSet<Urn>,
    /// Prior records claimed by a registration
    seen: HashSet<Urn>,
    /// Prior records deleted ahead of a delete-before-replace
    condemned: HashSet<Urn>,
    /// Predecessors of create-before-replace replacements
    deferred: Vec<ResourceState>,
    diagnostics: Vec<Diagnostic>,
}

impl StepGenerator {
    pub fn new(prior: Snapshot, registry: Arc<ProviderRegistry>) -> Self {
        let live = prior
            .resources
            .iter()
            .enumerate()
            .filter(|(_, record)| !record.delete)
            .map(|(index, record)| (record.urn.clone(), index))
            .collect();
        let graph = DependencyGraph::new(&prior.resources);
        Self {
            prior,
            live,
            graph,
            registry,
            registered: HashSet::new(),
            seen: HashSet::new(),
            condemned: HashSet::new(),
            deferred: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn prior(&self) -> &Snapshot {
        &self.prior
    }

    /// Diagnostics raised outside of a registration, such as protected deletes.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn live_record(&self, urn: &Urn) -> Option<&ResourceState> {
        self.live.get(urn).map(|&index| &self.prior.resources[index])
    }

    /// Prior record for a goal: by URN first, then through its aliases.
    fn find_old(&self, goal: &Goal) -> Option<ResourceState> {
        std::iter::once(&goal.urn)
            .chain(&goal.aliases)
            .filter(|urn| !self.seen.contains(*urn))
            .find_map(|urn| self.live_record(urn))
            .cloned()
    }

    fn duplicate(urn: &Urn) -> Diagnostic {
        Diagnostic::error(
            urn,
            DiagnosticKind::DuplicateUrn,
            "duplicate resource URN; each resource needs a unique type and name within its parent",
        )
    }

    fn old_views(&self, old: &ResourceState) -> Vec<crate::provider::ViewState> {
        self.prior
            .views_of(&old.urn)
            .filter(|view| view.delete == old.delete)
            .map(view_state)
            .collect()
    }

    /// Generate the steps for one registration.
    pub fn generate(&mut self, goal: &Goal) -> Result<Generated> {
        if !self.registered.insert(goal.urn.clone()) {
            return Ok(Generated::Rejected(Self::duplicate(&goal.urn)));
        }

        let mut new = goal.to_state();
        let Some(old) = self.find_old(goal) else {
            return match &goal.import_id {
                Some(id) => {
                    log::debug!("Importing {} as {id}", goal.urn);
                    new.id = id.clone();
                    Generated::steps(vec![Step::Import { new: Box::new(new) }])
                }
                None => {
                    log::debug!("Creating {}", goal.urn);
                    Generated::steps(vec![Step::Create { new: Box::new(new) }])
                }
            };
        };
        self.seen.insert(old.urn.clone());

        if old.pending_replacement || self.condemned.contains(&old.urn) {
            log::debug!("Re-creating {} deleted ahead of a replacement", goal.urn);
            let mut old = old;
            old.pending_replacement = true;
            return Generated::steps(vec![
                Step::Replace {
                    old: Box::new(old.clone()),
                    new: Box::new(new.clone()),
                },
                Step::CreateReplacement {
                    old: Box::new(old),
                    new: Box::new(new),
                },
            ]);
        }

        new.created = old.created;
        new.modified = old.modified;

        match (goal.import_id.clone(), old.import_id.clone()) {
            (Some(id), Some(recorded)) if id == recorded => {
                return Generated::steps(vec![Self::same(old.clone(), &old, new, &[])]);
            }
            (Some(id), _) => {
                if old.protect {
                    return Ok(Generated::Rejected(Diagnostic::protected(&old.urn)));
                }
                log::debug!("Re-importing {} as {id}", goal.urn);
                new.id = id;
                new.created = None;
                new.modified = None;
                let mut replaced = old.clone();
                replaced.delete = true;
                // a read record is only forgotten; a managed one is deleted
                let retire = if old.external {
                    Step::DiscardReplaced {
                        old: Box::new(replaced),
                    }
                } else {
                    Step::DeleteReplaced {
                        old: Box::new(replaced),
                    }
                };
                return Generated::steps(vec![
                    Step::ImportReplacement {
                        old: Box::new(old.clone()),
                        new: Box::new(new.clone()),
                    },
                    Step::Replace {
                        old: Box::new(old),
                        new: Box::new(new),
                    },
                    retire,
                ]);
            }
            (None, Some(recorded)) => {
                return Ok(Generated::Rejected(Diagnostic::error(
                    &goal.urn,
                    DiagnosticKind::InvalidImportReplace,
                    format!(
                        "resource was imported as {recorded}; replacing it after import requires a new import ID"
                    ),
                )));
            }
            (None, None) => {}
        }

        if old.external {
            log::debug!("Taking ownership of external resource {}", goal.urn);
            new.created = None;
            new.modified = None;
            let mut relinquished = old.clone();
            relinquished.delete = true;
            self.deferred.push(relinquished);
            return Generated::steps(vec![
                Step::CreateReplacement {
                    old: Box::new(old.clone()),
                    new: Box::new(new.clone()),
                },
                Step::Replace {
                    old: Box::new(old),
                    new: Box::new(new),
                },
            ]);
        }

        if old.custom != goal.custom {
            log::debug!("Replacing {}: component/custom kind changed", goal.urn);
            if old.protect {
                return Ok(Generated::Rejected(Diagnostic::protected(&old.urn)));
            }
            return Generated::steps(self.delete_before_replace(old, new, false));
        }

        if is_provider_type(&goal.ty) {
            let diff = self.registry.diff(&old, &new);
            return Generated::steps(vec![self.update_or_same(old, new, &diff)]);
        }

        if !goal.custom {
            let diff = if old.inputs == new.inputs {
                DiffResponse::none()
            } else {
                DiffResponse {
                    changes: DiffChanges::Some,
                    changed_keys: changed_keys(&old.inputs, &new.inputs),
                    ..DiffResponse::default()
                }
            };
            return Generated::steps(vec![self.update_or_same(old, new, &diff)]);
        }

        self.generate_custom(goal, old, new)
    }

    fn generate_custom(&mut self, goal: &Goal, old: ResourceState, mut new: ResourceState) -> Result<Generated> {
        let provider = self.registry.provider_of(&new)?;

        // stands in for the old record while diffing
        let mut prior = old.clone();
        if old.ty != new.ty || old.version != new.version {
            log::debug!(
                "Migrating {} from {} {:?} to {} {:?}",
                goal.urn,
                old.ty,
                old.version,
                new.ty,
                new.version
            );
            let migrated = provider
                .migrate(MigrateRequest {
                    urn: new.urn.clone(),
                    old_type: old.ty.clone(),
                    new_type: new.ty.clone(),
                    id: old.id.clone(),
                    old_inputs: old.inputs.clone(),
                    old_outputs: old.outputs.clone(),
                    old_property_dependencies: old.property_dependencies.clone(),
                    old_version: old.version.clone(),
                })
                .map_err(|e| Error::provider(&new.urn, "migrate", e))?;
            if !migrated.id.is_empty() {
                prior.id = migrated.id;
            }
            prior.inputs = migrated.inputs;
            prior.outputs = migrated.outputs;
            prior.property_dependencies = migrated.property_dependencies;
        }

        for key in &goal.ignore_changes {
            match prior.inputs.get(key) {
                Some(value) => new.inputs.insert(key.clone(), value.clone()),
                None => new.inputs.remove(key),
            };
        }

        if old.taint {
            let diff = self.diff(provider.as_ref(), &old, &prior, &new, true)?;
            log::debug!("Replacing tainted resource {}", goal.urn);
            let dbr = goal.delete_before_replace.unwrap_or(diff.delete_before_replace);
            return Ok(self.replace(old, new, dbr));
        }

        let mut diff = match (&old.provider, &new.provider) {
            (Some(before), Some(after)) if before != after => DiffResponse::replace(&["provider"]),
            _ => self.diff(provider.as_ref(), &old, &prior, &new, false)?,
        };

        if diff.changes == DiffChanges::Some && !goal.replace_on_changes.is_empty() {
            let replace_all = goal.replace_on_changes.iter().any(|key| key == "*");
            for key in diff.all_changed_keys() {
                if (replace_all || goal.replace_on_changes.contains(&key)) && !diff.replace_keys.contains(&key) {
                    diff.replace_keys.push(key);
                }
            }
        }

        if diff.changes == DiffChanges::Some && !diff.all_replace_keys().is_empty() {
            log::debug!("Replacing {} (keys {:?})", goal.urn, diff.all_replace_keys());
            let dbr = goal.delete_before_replace.unwrap_or(diff.delete_before_replace);
            return Ok(self.replace(old, new, dbr));
        }

        new.id = prior.id.clone();
        if diff.changes == DiffChanges::None {
            return Generated::steps(vec![Self::same(old, &prior, new, &diff.stable_keys)]);
        }
        log::debug!("Updating {} (keys {:?})", goal.urn, diff.all_changed_keys());
        new.outputs = prior.outputs.clone();
        Generated::steps(vec![Step::Update {
            old: Box::new(old),
            new: Box::new(new),
        }])
    }

    /// Ask the provider for a diff. Unchanged inputs short-circuit to no
    /// changes unless `force` is set.
    fn diff(
        &self,
        provider: &dyn Provider,
        old: &ResourceState,
        prior: &ResourceState,
        new: &ResourceState,
        force: bool,
    ) -> Result<DiffResponse> {
        if !force && prior.inputs == new.inputs {
            return Ok(DiffResponse::none());
        }
        let mut diff = provider
            .diff(DiffRequest {
                urn: new.urn.clone(),
                id: prior.id.clone(),
                old_inputs: prior.inputs.clone(),
                old_outputs: prior.outputs.clone(),
                new_inputs: new.inputs.clone(),
                ignore_changes: new.ignore_changes.clone(),
                old_views: self.old_views(old),
            })
            .map_err(|e| Error::provider(&new.urn, "diff", e))?;
        if diff.changes == DiffChanges::Unknown {
            diff.changes = DiffChanges::Some;
            if diff.changed_keys.is_empty() {
                diff.changed_keys = changed_keys(&prior.inputs, &new.inputs);
            }
        }
        Ok(diff)
    }

    fn same(old: ResourceState, prior: &ResourceState, mut new: ResourceState, stable_keys: &[String]) -> Step {
        new.id = prior.id.clone();
        new.outputs = prior.outputs.clone();
        for key in stable_keys {
            if let Some(value) = new.inputs.get(key) {
                new.outputs.insert(key.clone(), value.clone());
            }
        }
        Step::Same {
            old: Box::new(old),
            new: Box::new(new),
        }
    }

    fn update_or_same(&self, old: ResourceState, mut new: ResourceState, diff: &DiffResponse) -> Step {
        if diff.changes == DiffChanges::None {
            let prior = old.clone();
            return Self::same(old, &prior, new, &diff.stable_keys);
        }
        new.id = old.id.clone();
        new.outputs = old.outputs.clone();
        Step::Update {
            old: Box::new(old),
            new: Box::new(new),
        }
    }

    fn replace(&mut self, old: ResourceState, mut new: ResourceState, delete_first: bool) -> Generated {
        if old.protect {
            return Generated::Rejected(Diagnostic::protected(&old.urn));
        }
        new.created = None;
        new.modified = None;
        if delete_first {
            let dependents = self.dependents(&old);
            if let Some(protected) = dependents.iter().find(|dependent| dependent.protect) {
                return Generated::Rejected(Diagnostic::protected(&protected.urn));
            }
            let mut steps: Vec<Step> = dependents
                .into_iter()
                .rev()
                .map(|mut dependent| {
                    log::debug!("Deleting {} ahead of replacing {}", dependent.urn, old.urn);
                    self.condemned.insert(dependent.urn.clone());
                    dependent.pending_replacement = true;
                    Step::DeleteReplaced {
                        old: Box::new(dependent),
                    }
                })
                .collect();
            steps.extend(self.delete_before_replace(old, new, true));
            return Generated::Steps(steps);
        }

        let mut doomed = old.clone();
        doomed.delete = true;
        self.deferred.push(doomed);
        Generated::Steps(vec![
            Step::CreateReplacement {
                old: Box::new(old.clone()),
                new: Box::new(new.clone()),
            },
            Step::Replace {
                old: Box::new(old),
                new: Box::new(new),
            },
        ])
    }

    /// Live prior records that transitively depend on `old` and have not
    /// been registered or deleted yet, in snapshot order.
    fn dependents(&self, old: &ResourceState) -> Vec<ResourceState> {
        self.graph
            .dependents_of(&old.urn)
            .into_iter()
            .map(|index| &self.prior.resources[index])
            .filter(|record| !self.seen.contains(&record.urn) && !self.condemned.contains(&record.urn))
            .cloned()
            .collect()
    }

    fn delete_before_replace(&self, old: ResourceState, mut new: ResourceState, keep_timestamps: bool) -> Vec<Step> {
        if !keep_timestamps {
            new.created = None;
            new.modified = None;
        }
        let mut doomed = old;
        doomed.pending_replacement = true;
        let doomed = Box::new(doomed);
        let new = Box::new(new);
        vec![
            Step::DeleteReplaced { old: doomed.clone() },
            Step::Replace {
                old: doomed.clone(),
                new: new.clone(),
            },
            Step::CreateReplacement { old: doomed, new },
        ]
    }

    /// Generate the steps for reading an external resource.
    pub fn generate_read(&mut self, goal: &ReadGoal) -> Generated {
        if !self.registered.insert(goal.urn.clone()) {
            return Generated::Rejected(Self::duplicate(&goal.urn));
        }
        let new = Box::new(goal.to_state());
        let Some(old) = self.live_record(&goal.urn).cloned() else {
            return Generated::Steps(vec![Step::Read { old: None, new }]);
        };
        self.seen.insert(old.urn.clone());
        let old = Box::new(old);
        if !old.external && old.id != goal.id {
            log::debug!("Relinquishing {} in favour of external {}", old.urn, goal.id);
            return Generated::Steps(vec![
                Step::ReadReplacement {
                    old: old.clone(),
                    new: new.clone(),
                },
                Step::Replace { old, new },
            ]);
        }
        Generated::Steps(vec![Step::Read { old: Some(old), new }])
    }

    /// Refresh steps for every prior record a provider can read.
    pub fn generate_refreshes(&self) -> Vec<Step> {
        self.prior
            .resources
            .iter()
            .filter(|record| {
                record.custom
                    && !record.is_provider()
                    && !record.is_view()
                    && !record.pending_replacement
                    && !record.id.is_empty()
            })
            .map(|record| Step::Refresh {
                old: Box::new(record.clone()),
                new: Some(Box::new(record.clone())),
            })
            .collect()
    }

    /// Steps for everything the program no longer declares, in submission
    /// order. Each delete waits for the deletes of the records that refer to
    /// its resource.
    pub fn generate_deletes(&mut self) -> Vec<PlannedDelete> {
        let mut steps: Vec<Step> = Vec::new();
        let mut kept: Vec<ResourceState> = Vec::new();
        for record in &self.prior.resources {
            if record.is_view() {
                continue;
            }
            let old = Box::new(record.clone());
            let step = if record.delete {
                if record.external {
                    Step::ReadDiscard { old }
                } else {
                    Step::DeleteReplaced { old }
                }
            } else if self.seen.contains(&record.urn) {
                continue;
            } else if record.pending_replacement || self.condemned.contains(&record.urn) {
                Step::DiscardReplaced { old }
            } else if record.protect {
                self.diagnostics.push(Diagnostic::protected(&record.urn));
                kept.push(record.clone());
                continue;
            } else if record.external {
                Step::ReadDiscard { old }
            } else {
                Step::Delete { old }
            };
            steps.push(step);
        }

        // whatever a protected record still refers to stays too
        let mut next = 0;
        while next < kept.len() {
            for urn in kept[next].predecessors() {
                if let Some(pos) = steps
                    .iter()
                    .position(|step| step.op() == StepOp::Delete && step.urn() == &urn)
                    && let Some(record) = steps.remove(pos).old().cloned()
                {
                    log::warn!("Keeping {urn}: protected resource {} refers to it", kept[next].urn);
                    kept.push(record);
                }
            }
            next += 1;
        }

        for doomed in self.deferred.drain(..) {
            let old = Box::new(doomed);
            steps.push(if old.external {
                Step::ReadDiscard { old }
            } else {
                Step::DeleteReplaced { old }
            });
        }

        let records: Vec<ResourceState> = steps
            .iter()
            .filter_map(|step| step.old().cloned())
            .collect();
        let (order, mut waits) = delete_order(&records);
        let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|index| {
                slots[index].take().map(|step| PlannedDelete {
                    index,
                    step,
                    after: std::mem::take(&mut waits[index]),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticHost;
    use crate::testing::{FakeProvider, custom_goal, custom_record, provider_goal, provider_record};
    use ledger::property_map;
    use serde_json::json;

    fn bare_generator(records: Vec<ResourceState>, provider: Arc<FakeProvider>) -> StepGenerator {
        let prior = Snapshot::new(records);
        let registry = ProviderRegistry::new(Arc::new(StaticHost::new().with("pkg", provider)), &prior);
        StepGenerator::new(prior, Arc::new(registry))
    }

    /// Generator whose default provider has already been registered.
    fn generator(records: Vec<ResourceState>, provider: Arc<FakeProvider>) -> StepGenerator {
        let mut generator = bare_generator(records, provider);
        let generated = generator.generate(&provider_goal()).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::Same]);
        generator
    }

    fn ops(generated: &Generated) -> Vec<StepOp> {
        match generated {
            Generated::Steps(steps) => steps.iter().map(Step::op).collect(),
            Generated::Rejected(diag) => panic!("unexpected rejection: {diag}"),
        }
    }

    fn rejection(generated: Generated) -> Diagnostic {
        match generated {
            Generated::Rejected(diag) => diag,
            Generated::Steps(steps) => panic!("expected rejection, got {} steps", steps.len()),
        }
    }

    #[test]
    fn test_no_prior_record_creates() {
        let mut generator = generator(vec![provider_record()], Arc::new(FakeProvider::default()));
        let generated = generator.generate(&custom_goal("a", json!({"foo": "bar"}))).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::Create]);
    }

    #[test]
    fn test_no_prior_record_with_import_id_imports() {
        let mut generator = generator(vec![provider_record()], Arc::new(FakeProvider::default()));
        let mut goal = custom_goal("a", json!({"foo": "bar"}));
        goal.import_id = Some("imported-id".to_string());
        let generated = generator.generate(&goal).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::Import]);
    }

    #[test]
    fn test_unchanged_inputs_are_same_and_carry_outputs() {
        let mut old = custom_record("a", "a-1", json!({"foo": "bar"}));
        old.outputs = property_map([("arn", json!("arn:a"))]);
        let mut generator = generator(vec![provider_record(), old], Arc::new(FakeProvider::default()));
        let generated = generator.generate(&custom_goal("a", json!({"foo": "bar"}))).unwrap();
        let Generated::Steps(steps) = generated else { panic!("rejected") };
        assert_eq!(steps[0].op(), StepOp::Same);
        let new = steps[0].new_state().unwrap();
        assert_eq!(new.id, "a-1");
        assert_eq!(new.outputs.get("arn"), Some(&json!("arn:a")));
    }

    #[test]
    fn test_changed_inputs_update() {
        let old = custom_record("a", "a-1", json!({"foo": "bar"}));
        let mut generator = generator(vec![provider_record(), old], Arc::new(FakeProvider::default()));
        let generated = generator.generate(&custom_goal("a", json!({"foo": "baz"}))).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::Update]);
    }

    #[test]
    fn test_replace_keys_create_before_delete() {
        let old = custom_record("a", "a-1", json!({"foo": "bar"}));
        let provider = Arc::new(FakeProvider::default().replace_on(&["foo"]));
        let mut generator = generator(vec![provider_record(), old], provider);
        let generated = generator.generate(&custom_goal("a", json!({"foo": "baz"}))).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::CreateReplacement, StepOp::Replace]);

        let deletes = generator.generate_deletes();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].step.op(), StepOp::DeleteReplaced);
        assert!(deletes[0].step.old().unwrap().delete);
    }

    #[test]
    fn test_delete_before_replace_deletes_dependents_first() {
        let a = custom_record("a", "a-1", json!({"foo": "bar"}));
        let mut b = custom_record("b", "b-1", json!({}));
        b.dependencies.push(a.urn.clone());
        let mut c = custom_record("c", "c-1", json!({}));
        c.property_dependencies.insert("x".to_string(), vec![b.urn.clone()]);
        let provider = Arc::new(FakeProvider::default().replace_on(&["foo"]).delete_before_replace());
        let mut generator = generator(vec![provider_record(), a, b, c], provider);

        let Generated::Steps(steps) = generator.generate(&custom_goal("a", json!({"foo": "baz"}))).unwrap() else {
            panic!("rejected")
        };
        let described: Vec<(StepOp, &str)> = steps.iter().map(|s| (s.op(), s.urn().name())).collect();
        assert_eq!(
            described,
            vec![
                (StepOp::DeleteReplaced, "c"),
                (StepOp::DeleteReplaced, "b"),
                (StepOp::DeleteReplaced, "a"),
                (StepOp::Replace, "a"),
                (StepOp::CreateReplacement, "a"),
            ]
        );
        assert!(steps.iter().all(|s| s.old().unwrap().pending_replacement));

        // dependents come back as replacements when they register again
        let generated = generator.generate(&custom_goal("b", json!({}))).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::Replace, StepOp::CreateReplacement]);

        // and the ones that never do are forgotten
        let deletes = generator.generate_deletes();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].step.op(), StepOp::DiscardReplaced);
        assert_eq!(deletes[0].step.urn().name(), "c");
    }

    #[test]
    fn test_explicit_option_overrides_provider_dbr_hint() {
        let old = custom_record("a", "a-1", json!({"foo": "bar"}));
        let provider = Arc::new(FakeProvider::default().replace_on(&["foo"]).delete_before_replace());
        let mut generator = generator(vec![provider_record(), old], provider);
        let mut goal = custom_goal("a", json!({"foo": "baz"}));
        goal.delete_before_replace = Some(false);
        let generated = generator.generate(&goal).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::CreateReplacement, StepOp::Replace]);
    }

    #[test]
    fn test_taint_forces_replace_even_without_diff() {
        let mut old = custom_record("a", "a-1", json!({"foo": "bar"}));
        old.taint = true;
        let provider = Arc::new(FakeProvider::default().without_diff());
        let mut generator = generator(vec![provider_record(), old], provider.clone());
        let Generated::Steps(steps) = generator.generate(&custom_goal("a", json!({"foo": "bar"}))).unwrap() else {
            panic!("rejected")
        };
        let ops: Vec<StepOp> = steps.iter().map(Step::op).collect();
        assert_eq!(ops, vec![StepOp::CreateReplacement, StepOp::Replace]);
        assert!(!steps[0].new_state().unwrap().taint);
        assert_eq!(provider.calls(), vec!["diff:a"]);
    }

    #[test]
    fn test_component_to_custom_replaces_without_diff() {
        let mut old = ResourceState::new(custom_goal("a", json!({})).urn, "pkg:m:T", false);
        old.inputs = property_map([("foo", json!("bar"))]);
        let provider = Arc::new(FakeProvider::default());
        let mut generator = generator(vec![provider_record(), old], provider.clone());
        let generated = generator.generate(&custom_goal("a", json!({"foo": "bar"}))).unwrap();
        assert_eq!(
            ops(&generated),
            vec![StepOp::DeleteReplaced, StepOp::Replace, StepOp::CreateReplacement]
        );
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_version_change_migrates_before_diff() {
        let mut old = custom_record("a", "a-1", json!({"foo": "bar"}));
        old.version = Some("1.0.0".to_string());
        let provider = Arc::new(FakeProvider::default());
        let mut generator = generator(vec![provider_record(), old], provider.clone());
        let mut goal = custom_goal("a", json!({"foo": "bar"}));
        goal.version = Some("2.0.0".to_string());
        let generated = generator.generate(&goal).unwrap();
        assert_eq!(ops(&generated), vec![StepOp::Same]);
        assert_eq!(provider.calls(), vec!["migrate:a:1.0.0"]);
    }

    #[test]
    fn test_protected_replace_is_rejected() {
        let mut old = custom_record("a", "a-1", json!({"foo": "bar"}));
        old.protect = true;
        let provider = Arc::new(FakeProvider::default().replace_on(&["foo"]));
        let mut generator = generator(vec![provider_record(), old], provider);
        let diag = rejection(generator.generate(&custom_goal("a", json!({"foo": "baz"}))).unwrap());
        assert_eq!(diag.kind, DiagnosticKind::ProtectViolation);
        // the record is still claimed, so it is not deleted either
        assert!(generator.generate_deletes().is_empty());
    }

    #[test]
    fn test_protected_unseen_records_are_reported_not_deleted() {
        let mut a = custom_record("a", "a-1", json!({}));
        a.protect = true;
        let mut b = custom_record("b", "b-1", json!({}));
        b.protect = true;
        let mut generator = bare_generator(vec![provider_record(), a, b], Arc::new(FakeProvider::default()));
        // the provider both of them use stays as well
        assert!(generator.generate_deletes().is_empty());
        assert_eq!(generator.take_diagnostics().len(), 2);
    }

    #[test]
    fn test_duplicate_urn_rejected() {
        let mut generator = generator(vec![provider_record()], Arc::new(FakeProvider::default()));
        generator.generate(&custom_goal("a", json!({}))).unwrap();
        let diag = rejection(generator.generate(&custom_goal("a", json!({}))).unwrap());
        assert_eq!(diag.kind, DiagnosticKind::DuplicateUrn);
    }

    #[test]
    fn test_import_id_rules() {
        let mut old = custom_record("a", "a-1", json!({"foo": "bar"}));
        old.import_id = Some("a-1".to_string());
        let records = vec![provider_record(), old];

        let mut same = generator(records.clone(), Arc::new(FakeProvider::default()));
        let mut goal = custom_goal("a", json!({"foo": "bar"}));
        goal.import_id = Some("a-1".to_string());
        assert_eq!(ops(&same.generate(&goal).unwrap()), vec![StepOp::Same]);

        let mut changed = generator(records.clone(), Arc::new(FakeProvider::default()));
        goal.import_id = Some("a-2".to_string());
        let Generated::Steps(steps) = changed.generate(&goal).unwrap() else {
            panic!("rejected")
        };
        let described: Vec<StepOp> = steps.iter().map(Step::op).collect();
        assert_eq!(described, vec![StepOp::ImportReplacement, StepOp::Replace, StepOp::DeleteReplaced]);
        let deleted = steps[2].old().unwrap();
        assert_eq!(deleted.id, "a-1");
        assert!(deleted.delete);

        let mut dropped = generator(records, Arc::new(FakeProvider::default()));
        goal.import_id = None;
        let diag = rejection(dropped.generate(&goal).unwrap());
        assert_eq!(diag.kind, DiagnosticKind::InvalidImportReplace);
    }

    #[test]
    fn test_import_over_read_record_discards_it() {
        let mut old = custom_record("ext", "ext-id", json!({}));
        old.external = true;
        let records = vec![provider_record(), old];

        let provider = Arc::new(FakeProvider::default());
        let mut imported = generator(records.clone(), provider.clone());
        let mut goal = custom_goal("ext", json!({}));
        goal.import_id = Some("ext-id".to_string());
        let Generated::Steps(steps) = imported.generate(&goal).unwrap() else {
            panic!("rejected")
        };
        let described: Vec<StepOp> = steps.iter().map(Step::op).collect();
        assert_eq!(described, vec![StepOp::ImportReplacement, StepOp::Replace, StepOp::DiscardReplaced]);
        assert_eq!(steps[0].new_state().unwrap().id, "ext-id");
        assert!(imported.generate_deletes().is_empty());
        assert!(provider.calls().is_empty());

        // without an import ID the program takes ownership by creating it
        let mut owned = generator(records, Arc::new(FakeProvider::default()));
        goal.import_id = None;
        assert_eq!(
            ops(&owned.generate(&goal).unwrap()),
            vec![StepOp::CreateReplacement, StepOp::Replace]
        );
    }

    #[test]
    fn test_alias_claims_old_record() {
        let old = custom_record("old", "a-1", json!({"foo": "bar"}));
        let mut generator = generator(vec![provider_record(), old.clone()], Arc::new(FakeProvider::default()));
        let mut goal = custom_goal("new", json!({"foo": "bar"}));
        goal.aliases.push(old.urn.clone());
        let Generated::Steps(steps) = generator.generate(&goal).unwrap() else {
            panic!("rejected")
        };
        assert_eq!(steps[0].op(), StepOp::Same);
        assert_eq!(steps[0].old().unwrap().urn, old.urn);
        assert_eq!(steps[0].new_state().unwrap().urn.name(), "new");
        let deletes = generator.generate_deletes();
        assert!(deletes.iter().all(|d| d.step.urn() != &old.urn));
    }

    #[test]
    fn test_ignore_changes_keeps_old_value() {
        let old = custom_record("a", "a-1", json!({"foo": "bar", "tags": "x"}));
        let mut generator = generator(vec![provider_record(), old], Arc::new(FakeProvider::default()));
        let mut goal = custom_goal("a", json!({"foo": "bar", "tags": "y"}));
        goal.ignore_changes.push("tags".to_string());
        let Generated::Steps(steps) = generator.generate(&goal).unwrap() else {
            panic!("rejected")
        };
        assert_eq!(steps[0].op(), StepOp::Same);
        assert_eq!(steps[0].new_state().unwrap().inputs.get("tags"), Some(&json!("x")));
    }

    #[test]
    fn test_replace_on_changes_forces_replacement() {
        let old = custom_record("a", "a-1", json!({"size": 1}));
        let mut generator = generator(vec![provider_record(), old], Arc::new(FakeProvider::default()));
        let mut goal = custom_goal("a", json!({"size": 2}));
        goal.replace_on_changes.push("size".to_string());
        assert_eq!(
            ops(&generator.generate(&goal).unwrap()),
            vec![StepOp::CreateReplacement, StepOp::Replace]
        );
    }

    #[test]
    fn test_read_with_different_id_relinquishes() {
        let old = custom_record("a", "a-1", json!({}));
        let mut generator = generator(vec![provider_record(), old.clone()], Arc::new(FakeProvider::default()));
        let goal = ReadGoal {
            urn: old.urn.clone(),
            ty: old.ty.clone(),
            id: "ext-9".to_string(),
            inputs: Default::default(),
            parent: None,
            provider: old.provider.clone(),
            dependencies: Vec::new(),
            version: None,
        };
        assert_eq!(
            ops(&generator.generate_read(&goal)),
            vec![StepOp::ReadReplacement, StepOp::Replace]
        );
    }

    #[test]
    fn test_unseen_records_deleted_children_first() {
        let parent = custom_record("p", "p-1", json!({}));
        let mut child = custom_record("c", "c-1", json!({}));
        child.parent = Some(parent.urn.clone());
        let mut generator = generator(vec![provider_record(), parent, child], Arc::new(FakeProvider::default()));
        generator.generate(&custom_goal("zzz", json!({}))).unwrap();
        let deletes = generator.generate_deletes();
        let names: Vec<&str> = deletes.iter().map(|d| d.step.urn().name()).collect();
        assert_eq!(names, vec!["c", "p"]);
        assert_eq!(deletes[1].after, vec![deletes[0].index]);
    }
}
