//! Views: resources a provider reports as side effects of its owner's steps.
//!
//! Providers publish [`ViewStep`]s while handling an owner's call. The
//! manager turns them into ordinary [`Step`]s and splits them around the
//! owner's own journal entry: removals go before it so a view never outlives
//! its owner, and additions go after it so a view never precedes its owner.

use crate::provider::{Status, ViewOp, ViewState, ViewStep};
use ledger::{ResourceState, Snapshot, Step, StepOp, Urn};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A view step plus the error its provider reported, if any.
#[derive(Debug, Clone)]
pub struct ViewChange {
    pub step: Step,
    pub error: Option<String>,
}

impl ViewChange {
    fn ok(step: Step) -> Self {
        Self { step, error: None }
    }
}

/// View steps to journal around one owner step.
#[derive(Debug, Default)]
pub struct ViewPlan {
    pub before: Vec<ViewChange>,
    pub after: Vec<ViewChange>,
    /// Published view steps dropped because the owner was never recorded
    pub discarded: usize,
}

/// Provider-facing state of a recorded view.
pub fn view_state(record: &ResourceState) -> ViewState {
    ViewState {
        ty: record.ty.clone(),
        name: record.urn.name().to_string(),
        inputs: record.inputs.clone(),
        outputs: record.outputs.clone(),
    }
}

fn view_record(owner: &ResourceState, view: &ViewState) -> ResourceState {
    let mut record = ResourceState::new(Urn::view(&owner.urn, &view.ty, &view.name), view.ty.clone(), false);
    record.inputs = view.inputs.clone();
    record.outputs = view.outputs.clone();
    record.provider = owner.provider.clone();
    record.view_of = Some(owner.urn.clone());
    record
}

/// Tracks the views recorded for each owner during a run.
#[derive(Debug, Default)]
pub struct ViewManager {
    recorded: Mutex<HashMap<Urn, Vec<ResourceState>>>,
}

impl ViewManager {
    pub fn new(base: &Snapshot) -> Self {
        let mut recorded: HashMap<Urn, Vec<ResourceState>> = HashMap::new();
        for record in &base.resources {
            if let Some(owner) = &record.view_of {
                recorded.entry(owner.clone()).or_default().push(record.clone());
            }
        }
        Self {
            recorded: Mutex::new(recorded),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Urn, Vec<ResourceState>>> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recorded views belonging to this exact owner record.
    ///
    /// An owner and its pending-delete predecessor share a URN; views follow
    /// the owner record with the same pending-delete flag.
    pub fn views_of(&self, owner: &ResourceState) -> Vec<ResourceState> {
        self.lock()
            .get(&owner.urn)
            .map(|views| {
                views
                    .iter()
                    .filter(|view| view.delete == owner.delete)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Views handed to the provider as `old_views` for an owner call.
    pub fn old_views(&self, owner: Option<&ResourceState>) -> Vec<ViewState> {
        owner
            .map(|owner| self.views_of(owner).iter().map(view_state).collect())
            .unwrap_or_default()
    }

    /// Turn what a provider published during `owner_step` into view steps,
    /// and add the steps the owner's operation implies for its other views.
    pub fn plan(&self, owner_step: &Step, published: Vec<ViewStep>, owner_ok: bool) -> ViewPlan {
        let op = owner_step.op();
        let creates_owner = matches!(
            op,
            StepOp::Create | StepOp::CreateReplacement | StepOp::Import | StepOp::ImportReplacement
        );
        if !owner_ok && creates_owner {
            if !published.is_empty() {
                log::warn!(
                    "Discarding {} view step(s) published by failed {op} of {}",
                    published.len(),
                    owner_step.urn()
                );
            }
            return ViewPlan {
                discarded: published.len(),
                ..ViewPlan::default()
            };
        }

        let Some(owner) = owner_step.new_state().or_else(|| owner_step.old()) else {
            return ViewPlan::default();
        };
        let current = owner_step.old().map(|old| self.views_of(old)).unwrap_or_default();
        let find = |view: &ViewState| {
            current
                .iter()
                .find(|record| record.ty == view.ty && record.urn.name() == view.name)
                .cloned()
        };

        let mut plan = ViewPlan::default();
        let mut mentioned: HashSet<Urn> = HashSet::new();

        for published in published {
            let Some(identity) = published.new.as_ref().or(published.old.as_ref()) else {
                log::warn!("Ignoring view step without state published by {}", owner.urn);
                continue;
            };
            let old = find(identity);
            if let Some(old) = &old {
                mentioned.insert(old.urn.clone());
            }
            let error = published.error.clone().or_else(|| {
                (published.status != Status::Ok)
                    .then(|| format!("provider reported status {}", published.status.as_str()))
            });
            let new = published.new.as_ref().map(|view| Box::new(view_record(owner, view)));

            let (before, after): (Vec<Step>, Vec<Step>) = match (published.op, old, new) {
                (ViewOp::Delete, Some(old), _) => (vec![Step::Delete { old: Box::new(old) }], vec![]),
                (ViewOp::Delete, None, _) => {
                    log::warn!("Ignoring delete of unknown view {} of {}", identity.name, owner.urn);
                    continue;
                }
                (_, _, None) => {
                    log::warn!("Ignoring view step without new state published by {}", owner.urn);
                    continue;
                }
                (ViewOp::Create, Some(old), Some(new)) if op == StepOp::CreateReplacement => (
                    vec![],
                    vec![Step::CreateReplacement {
                        old: Box::new(old),
                        new,
                    }],
                ),
                (ViewOp::Create | ViewOp::Update, Some(old), Some(new)) => (
                    vec![],
                    vec![Step::Update {
                        old: Box::new(old),
                        new,
                    }],
                ),
                (ViewOp::Same, Some(old), Some(new)) => (
                    vec![],
                    vec![Step::Same {
                        old: Box::new(old),
                        new,
                    }],
                ),
                (ViewOp::Replace, Some(mut old), Some(new)) => {
                    old.pending_replacement = true;
                    let old = Box::new(old);
                    (
                        vec![Step::DeleteReplaced { old: old.clone() }],
                        vec![
                            Step::Replace {
                                old: old.clone(),
                                new: new.clone(),
                            },
                            Step::CreateReplacement { old, new },
                        ],
                    )
                }
                (_, None, Some(new)) => (vec![], vec![Step::Create { new }]),
            };

            let wrap = |step| ViewChange {
                step,
                error: error.clone(),
            };
            plan.before.extend(before.into_iter().map(wrap));
            plan.after.extend(after.into_iter().map(wrap));
        }

        let unmentioned = current.into_iter().filter(|view| !mentioned.contains(&view.urn));
        match op {
            StepOp::Same | StepOp::Update => {
                plan.after.extend(unmentioned.map(|view| {
                    ViewChange::ok(Step::Same {
                        old: Box::new(view.clone()),
                        new: Box::new(view),
                    })
                }));
            }
            StepOp::Delete | StepOp::DeleteReplaced => {
                plan.before.extend(unmentioned.map(|view| {
                    let old = Box::new(view);
                    ViewChange::ok(if old.delete {
                        Step::DeleteReplaced { old }
                    } else {
                        Step::Delete { old }
                    })
                }));
            }
            _ => {}
        }
        plan
    }

    /// Record the effect of a view step that was applied.
    pub fn applied(&self, step: &Step) {
        let Some(owner) = step
            .new_state()
            .or_else(|| step.old())
            .and_then(|state| state.view_of.clone())
        else {
            return;
        };
        let mut recorded = self.lock();
        let views = recorded.entry(owner).or_default();
        let position = |views: &[ResourceState], target: &ResourceState| {
            views
                .iter()
                .position(|view| view.urn == target.urn && view.delete == target.delete)
        };

        match step {
            Step::Create { new } => views.push(new.as_ref().clone()),
            Step::CreateReplacement { old, new } => {
                if let Some(i) = position(views, old) {
                    if views[i].pending_replacement {
                        views.remove(i);
                    } else {
                        views[i].delete = true;
                    }
                }
                views.push(new.as_ref().clone());
            }
            Step::Update { old, new } | Step::Same { old, new } => match position(views, old) {
                Some(i) => views[i] = new.as_ref().clone(),
                None => views.push(new.as_ref().clone()),
            },
            Step::Delete { old } | Step::DeleteReplaced { old } => {
                if let Some(i) = position(views, old) {
                    if old.pending_replacement {
                        views[i].pending_replacement = true;
                    } else {
                        views.remove(i);
                    }
                }
            }
            Step::Replace { .. }
            | Step::Read { .. }
            | Step::ReadReplacement { .. }
            | Step::ReadDiscard { .. }
            | Step::Import { .. }
            | Step::ImportReplacement { .. }
            | Step::Refresh { .. }
            | Step::DiscardReplaced { .. } => {}
        }
    }
}
