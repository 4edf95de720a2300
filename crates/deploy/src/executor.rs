//! Step execution: provider calls, journaling and view bookkeeping.
//!
//! Every step is journaled as a `Begin` before its provider call and as a
//! `Success` or `Failure` after it. View steps a provider publishes during the
//! call are journaled around the owner's end entry. Preview runs call no
//! mutating provider method and write no journal.

use crate::error::{Diagnostic, DiagnosticKind, Error};
use crate::events::{EventSink, ResourceChanges, StepStatus};
use crate::provider::{
    CreateRequest, DeleteRequest, DiffChanges, DiffRequest, Provider, ReadRequest, ReadResponse, Status,
    UpdateRequest, ViewPublisher,
};
use crate::registry::ProviderRegistry;
use crate::scheduler::ChainResult;
use crate::views::{ViewChange, ViewManager};
use chrono::Utc;
use ledger::{Journal, JournalEntry, Mutation, ResourceState, Step, StepOp, changed_keys};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How a provider call ended.
enum Called {
    Ok,
    /// The resource changed but the provider reported a problem; the step is
    /// recorded and then the run stops.
    Partial(Error),
    /// This resource failed; the rest of the run continues.
    Failed(String),
    /// The run stops.
    Fatal(Error),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StepExecutor {
    journal: Arc<Journal>,
    registry: Arc<ProviderRegistry>,
    views: ViewManager,
    events: Arc<dyn EventSink>,
    preview: bool,
    cancel: Arc<AtomicBool>,
    error: Mutex<Option<Error>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
    applied: Mutex<Vec<Step>>,
    changes: Mutex<ResourceChanges>,
}

impl StepExecutor {
    pub fn new(
        journal: Arc<Journal>,
        registry: Arc<ProviderRegistry>,
        views: ViewManager,
        events: Arc<dyn EventSink>,
        preview: bool,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            journal,
            registry,
            views,
            events,
            preview,
            cancel,
            error: Mutex::new(None),
            diagnostics: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            changes: Mutex::new(ResourceChanges::new()),
        }
    }

    pub fn is_preview(&self) -> bool {
        self.preview
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Stop the run. The first fatal error is kept; later ones are logged.
    pub fn fail(&self, error: Error) {
        self.cancel.store(true, Ordering::SeqCst);
        let mut slot = lock(&self.error);
        if slot.is_none() {
            log::error!("{error}");
            *slot = Some(error);
        } else {
            log::error!("Additional error after cancellation: {error}");
        }
    }

    pub fn take_error(&self) -> Option<Error> {
        lock(&self.error).take()
    }

    pub fn diagnose(&self, diagnostic: Diagnostic) {
        self.events.on_diagnostic(&diagnostic);
        lock(&self.diagnostics).push(diagnostic);
    }

    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *lock(&self.diagnostics))
    }

    /// Steps applied so far, with the states their providers returned.
    pub fn take_applied(&self) -> Vec<Step> {
        std::mem::take(&mut *lock(&self.applied))
    }

    pub fn changes(&self) -> ResourceChanges {
        lock(&self.changes).clone()
    }

    /// Append to the journal and notify the event sink.
    pub fn append(&self, mutation: Mutation) -> Result<u64, Error> {
        let seq = self.journal.append(mutation.clone())?;
        self.events.on_journal_entry(&JournalEntry { seq, mutation });
        Ok(seq)
    }

    /// Run a chain's steps in order, stopping at the first one that fails.
    pub fn run_chain(&self, steps: Vec<Step>) -> ChainResult {
        let mut latest: Option<ResourceState> = None;
        for mut step in steps {
            if self.is_cancelled() {
                return ChainResult::Cancelled;
            }
            if step.op() == StepOp::Replace
                && let (Some(state), Some(new)) = (&latest, step.new_state_mut())
            {
                *new = state.clone();
            }

            let op = step.op();
            let urn = step.urn().clone();
            match self.run_step(&mut step) {
                Ok(()) => {
                    if op != StepOp::Replace {
                        latest = step.new_state().cloned().or(latest);
                    }
                    self.applied(step);
                }
                Err(message) => {
                    self.events.on_step_done(&step, StepStatus::Failed);
                    return ChainResult::Failed { op, urn, message };
                }
            }
        }
        ChainResult::Applied { state: latest }
    }

    fn applied(&self, step: Step) {
        self.events.on_step_done(&step, StepStatus::Applied);
        lock(&self.changes).add(step.op());
        lock(&self.applied).push(step);
    }

    fn begin(&self, step: &Step) -> Result<Option<u64>, Error> {
        self.events.on_step_start(step);
        if self.preview {
            return Ok(None);
        }
        self.append(Mutation::Begin { step: step.clone() }).map(Some)
    }

    fn end(&self, begun: Option<u64>, step: &Step, success: bool) -> Result<(), Error> {
        if let Some(begun) = begun {
            let step = step.clone();
            self.append(if success {
                Mutation::Success { begun, step }
            } else {
                Mutation::Failure { begun, step }
            })?;
        }
        Ok(())
    }

    fn run_step(&self, step: &mut Step) -> Result<(), String> {
        let begun = self.begin(step).map_err(|e| self.abort(e))?;

        let publisher = ViewPublisher::new();
        let called = self.call(step, &publisher);
        let recorded = matches!(called, Called::Ok | Called::Partial(_));
        let plan = self.views.plan(step, publisher.take(), recorded);

        if recorded {
            for change in plan.before {
                self.record_view(change)?;
            }
        }
        self.end(begun, step, recorded).map_err(|e| self.abort(e))?;
        if recorded {
            for change in plan.after {
                self.record_view(change)?;
            }
        }

        match called {
            Called::Ok => Ok(()),
            Called::Partial(error) => {
                self.fail(error);
                Ok(())
            }
            Called::Failed(message) => Err(message),
            Called::Fatal(error) => Err(self.abort(error)),
        }
    }

    fn abort(&self, error: Error) -> String {
        let message = error.to_string();
        self.fail(error);
        message
    }

    fn record_view(&self, change: ViewChange) -> Result<(), String> {
        let ViewChange { step, error } = change;
        let begun = self.begin(&step).map_err(|e| self.abort(e))?;
        self.end(begun, &step, error.is_none()).map_err(|e| self.abort(e))?;
        match error {
            None => {
                self.views.applied(&step);
                self.applied(step);
            }
            Some(message) => {
                log::warn!("{} of view {} failed: {message}", step.op(), step.urn());
                self.events.on_step_done(&step, StepStatus::Failed);
            }
        }
        Ok(())
    }

    fn provider(&self, state: &ResourceState) -> Result<Arc<dyn Provider>, Called> {
        self.registry.provider_of(state).map_err(Called::Fatal)
    }

    fn settle(state: &ResourceState, op: &'static str, status: Status, changed: bool) -> Called {
        match status {
            Status::Ok => Called::Ok,
            Status::PartialFailure if changed => Called::Partial(Error::ProviderStatus {
                urn: state.urn.clone(),
                op,
                status: status.as_str(),
                message: "the resource was changed but did not finish initializing".to_string(),
            }),
            _ => Called::Fatal(Error::ProviderStatus {
                urn: state.urn.clone(),
                op,
                status: status.as_str(),
                message: "the state of the resource is unknown".to_string(),
            }),
        }
    }

    fn call(&self, step: &mut Step, views: &ViewPublisher) -> Called {
        let result = match step {
            Step::Same { .. } | Step::Replace { .. } | Step::ReadDiscard { .. } | Step::DiscardReplaced { .. } => {
                Ok(Called::Ok)
            }
            Step::Create { new } | Step::CreateReplacement { new, .. } => self.create(new, views),
            Step::Update { old, new } => self.update(old, new, views),
            Step::Delete { old } | Step::DeleteReplaced { old } => self.delete(old, views),
            Step::Read { new, .. } | Step::ReadReplacement { new, .. } => self.read(new, views),
            Step::Import { new } | Step::ImportReplacement { new, .. } => self.import(new, views),
            Step::Refresh { old, new } => self.refresh(old, new, views),
        };
        result.unwrap_or_else(|called| called)
    }

    fn create(&self, new: &mut ResourceState, views: &ViewPublisher) -> Result<Called, Called> {
        if new.is_provider() {
            new.id = self.registry.create(new).map_err(Called::Fatal)?;
            return Ok(Called::Ok);
        }
        if !new.custom || self.preview {
            return Ok(Called::Ok);
        }
        let provider = self.provider(new)?;
        let response = provider
            .create(CreateRequest {
                urn: new.urn.clone(),
                inputs: new.inputs.clone(),
                timeout: new.custom_timeouts.create,
                views: views.clone(),
            })
            .map_err(|e| Called::Fatal(Error::provider(&new.urn, "create", e)))?;
        if response.id.is_empty() {
            return Err(Called::Fatal(Error::ProviderStatus {
                urn: new.urn.clone(),
                op: "create",
                status: response.status.as_str(),
                message: "provider returned an empty ID".to_string(),
            }));
        }
        let now = Utc::now();
        new.id = response.id;
        new.outputs = response.outputs;
        new.created = Some(now);
        new.modified = Some(now);
        Ok(Self::settle(new, "create", response.status, true))
    }

    fn update(&self, old: &ResourceState, new: &mut ResourceState, views: &ViewPublisher) -> Result<Called, Called> {
        if new.is_provider() {
            self.registry.update(old, new).map_err(Called::Fatal)?;
            return Ok(Called::Ok);
        }
        if !new.custom || self.preview {
            return Ok(Called::Ok);
        }
        let provider = self.provider(new)?;
        let response = provider
            .update(UpdateRequest {
                urn: new.urn.clone(),
                id: new.id.clone(),
                old_inputs: old.inputs.clone(),
                old_outputs: old.outputs.clone(),
                new_inputs: new.inputs.clone(),
                ignore_changes: new.ignore_changes.clone(),
                timeout: new.custom_timeouts.update,
                old_views: self.views.old_views(Some(old)),
                views: views.clone(),
            })
            .map_err(|e| Called::Fatal(Error::provider(&new.urn, "update", e)))?;
        new.outputs = response.outputs;
        new.modified = Some(Utc::now());
        Ok(Self::settle(new, "update", response.status, true))
    }

    fn delete(&self, old: &ResourceState, views: &ViewPublisher) -> Result<Called, Called> {
        if old.is_provider() {
            if !self.preview {
                self.registry.delete(old);
            }
            return Ok(Called::Ok);
        }
        if !old.custom || self.preview {
            return Ok(Called::Ok);
        }
        if old.retain_on_delete {
            log::info!("Retaining {} ({}); only the record is removed", old.urn, old.id);
            return Ok(Called::Ok);
        }
        let provider = self.provider(old)?;
        let status = provider
            .delete(DeleteRequest {
                urn: old.urn.clone(),
                id: old.id.clone(),
                inputs: old.inputs.clone(),
                outputs: old.outputs.clone(),
                timeout: old.custom_timeouts.delete,
                old_views: self.views.old_views(Some(old)),
                views: views.clone(),
            })
            .map_err(|e| Called::Fatal(Error::provider(&old.urn, "delete", e)))?;
        Ok(Self::settle(old, "delete", status, false))
    }

    fn read_existing(
        &self,
        state: &ResourceState,
        known: Option<&ResourceState>,
        views: &ViewPublisher,
    ) -> Result<ReadResponse, Called> {
        let provider = self.provider(state)?;
        provider
            .read(ReadRequest {
                urn: state.urn.clone(),
                id: state.id.clone(),
                inputs: known.map(|k| k.inputs.clone()),
                outputs: known.map(|k| k.outputs.clone()),
                old_views: self.views.old_views(known),
                views: views.clone(),
            })
            .map_err(|e| Called::Fatal(Error::provider(&state.urn, "read", e)))
    }

    fn read(&self, new: &mut ResourceState, views: &ViewPublisher) -> Result<Called, Called> {
        let response = self.read_existing(new, None, views)?;
        if response.id.is_empty() {
            return Err(Called::Failed(format!("resource {} does not exist", new.id)));
        }
        new.id = response.id;
        new.outputs = response.outputs;
        if !response.inputs.is_empty() {
            new.inputs = response.inputs;
        }
        Ok(Self::settle(new, "read", response.status, true))
    }

    fn import(&self, new: &mut ResourceState, views: &ViewPublisher) -> Result<Called, Called> {
        let response = self.read_existing(new, None, views)?;
        if response.id.is_empty() {
            return Err(Called::Failed(format!("resource {} to import does not exist", new.id)));
        }

        let provider = self.provider(new)?;
        let diff = provider
            .diff(DiffRequest {
                urn: new.urn.clone(),
                id: response.id.clone(),
                old_inputs: response.inputs.clone(),
                old_outputs: response.outputs.clone(),
                new_inputs: new.inputs.clone(),
                ignore_changes: new.ignore_changes.clone(),
                old_views: Vec::new(),
            })
            .map_err(|e| Called::Fatal(Error::provider(&new.urn, "diff", e)))?;
        let mismatched = match diff.changes {
            DiffChanges::None => Vec::new(),
            DiffChanges::Some => diff.all_changed_keys(),
            DiffChanges::Unknown => changed_keys(&response.inputs, &new.inputs),
        };
        if diff.changes == DiffChanges::Some || !mismatched.is_empty() {
            self.diagnose(Diagnostic::error(
                &new.urn,
                DiagnosticKind::ImportMismatch,
                format!(
                    "inputs to import do not match the existing resource {} (differing: {})",
                    response.id,
                    mismatched.join(", ")
                ),
            ));
            return Err(Called::Failed("mismatched import inputs".to_string()));
        }

        let now = Utc::now();
        new.id = response.id;
        new.inputs = response.inputs;
        new.outputs = response.outputs;
        new.created = Some(now);
        new.modified = Some(now);
        Ok(Self::settle(new, "import", response.status, true))
    }

    fn refresh(
        &self,
        old: &ResourceState,
        new: &mut Option<Box<ResourceState>>,
        views: &ViewPublisher,
    ) -> Result<Called, Called> {
        let response = self.read_existing(old, Some(old), views)?;
        if response.id.is_empty() {
            log::info!("{} ({}) no longer exists", old.urn, old.id);
            *new = None;
            return Ok(Called::Ok);
        }
        let Some(state) = new.as_mut() else {
            return Ok(Called::Ok);
        };
        state.id = response.id;
        state.outputs = response.outputs;
        if !response.inputs.is_empty() {
            state.inputs = response.inputs;
        }
        Ok(Self::settle(state, "refresh", response.status, true))
    }
}
