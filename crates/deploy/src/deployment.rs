//! One deployment run: refresh, registration loop, deletes, and the result.
//!
//! The loop owns the intake and the step generator and handles one program
//! request at a time. Registration chains run on the scheduler's pool; only
//! provider resources run inline so they are loaded before anything uses
//! them. Once the program has exited and every chain has finished, records
//! the program no longer declares are deleted, and the journal is replayed
//! onto the base snapshot to produce the new one.

use crate::error::{Diagnostic, DiagnosticKind, Error, RegistrationError, Result};
use crate::events::{EventSink, NoEvents, ResourceChanges};
use crate::executor::StepExecutor;
use crate::generator::{Generated, PlannedDelete, StepGenerator};
use crate::goal::{ReadGoal, RegisterResource, RegisterResponse, Transform};
use crate::intake::{Intake, Prepared};
use crate::monitor::{Reply, Request, ResourceMonitor};
use crate::provider::{ConstructRequest, ProviderHost};
use crate::registry::{ProviderRegistry, default_provider_name};
use crate::scheduler::{Chain, ChainId, ChainResult, Scheduler};
use crate::views::ViewManager;
use ledger::{
    Journal, JournalEntry, JournalPersister, Manifest, PropertyMap, ProviderRef, ResourceState, Snapshot, Step, Urn,
    is_provider_type, package_of, replay,
};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, Scope};

/// Options for a deployment run.
#[derive(Debug, Clone)]
pub struct DeploymentOptions {
    pub stack: String,
    pub project: String,
    /// Maximum number of steps running at once
    pub parallel: usize,
    /// Plan only: no mutating provider calls and no journal
    pub dry_run: bool,
    /// Read every managed resource back from its provider before the program runs
    pub refresh: bool,
    /// Requests the program can queue before `register` blocks on sending
    pub queue_capacity: usize,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            stack: String::new(),
            project: String::new(),
            parallel: 4,
            dry_run: false,
            refresh: false,
            queue_capacity: 16,
        }
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunResult {
    /// New snapshot; after a failure, the state as of the last journaled entry
    pub snapshot: Snapshot,
    pub entries: Vec<JournalEntry>,
    /// Applied steps in completion order
    pub steps: Vec<Step>,
    pub diagnostics: Vec<Diagnostic>,
    pub changes: ResourceChanges,
    /// Error that stopped the run
    pub error: Option<Error>,
}

impl RunResult {
    /// No fatal error and no error diagnostics.
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

pub struct Deployment {
    base: Snapshot,
    host: Arc<dyn ProviderHost>,
    options: DeploymentOptions,
    events: Arc<dyn EventSink>,
    journal: Arc<Journal>,
    stack_transforms: Vec<Transform>,
    cancel: Arc<AtomicBool>,
}

impl Deployment {
    pub fn new(base: Snapshot, host: Arc<dyn ProviderHost>, options: DeploymentOptions) -> Self {
        Self {
            base,
            host,
            options,
            events: Arc::new(NoEvents),
            journal: Arc::new(Journal::new()),
            stack_transforms: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Persist every journal entry as it is appended.
    pub fn with_journal(mut self, persister: Box<dyn JournalPersister>) -> Self {
        self.journal = Arc::new(Journal::with_persister(persister));
        self
    }

    /// Transform applied to every registration after its own and inherited ones.
    pub fn with_stack_transform(mut self, transform: Transform) -> Self {
        self.stack_transforms.push(transform);
        self
    }

    /// Flag that stops the run when set. Steps already running finish.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run `program` against the base snapshot.
    pub fn run<F>(self, program: F) -> RunResult
    where
        F: FnOnce(&ResourceMonitor) -> anyhow::Result<()> + Send,
    {
        let preview = self.options.dry_run;
        self.events.on_run_start(preview);
        log::info!(
            "{} stack {} of {} ({} resources)",
            if preview { "Previewing" } else { "Deploying" },
            self.options.stack,
            self.options.project,
            self.base.resources.len()
        );

        let mut diagnostics = Vec::new();
        for pending in &self.base.pending_operations {
            let message = format!(
                "a {:?} operation was interrupted; the resource may exist without a record",
                pending.kind
            );
            log::warn!("{}: {message}", pending.resource.urn);
            let diagnostic = Diagnostic::warning(&pending.resource.urn, DiagnosticKind::PendingOperation, message);
            self.events.on_diagnostic(&diagnostic);
            diagnostics.push(diagnostic);
        }

        if let Err(e) = self.base.verify_integrity() {
            return RunResult {
                snapshot: self.base.clone(),
                entries: Vec::new(),
                steps: Vec::new(),
                diagnostics,
                changes: ResourceChanges::new(),
                error: Some(Error::Ledger(e.into())),
            };
        }

        let registry = Arc::new(ProviderRegistry::new(Arc::clone(&self.host), &self.base));
        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&self.journal),
            Arc::clone(&registry),
            ViewManager::new(&self.base),
            Arc::clone(&self.events),
            preview,
            Arc::clone(&self.cancel),
        ));
        let scheduler = match Scheduler::new(Arc::clone(&executor), self.options.parallel) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                return RunResult {
                    snapshot: self.base.clone(),
                    entries: Vec::new(),
                    steps: Vec::new(),
                    diagnostics,
                    changes: ResourceChanges::new(),
                    error: Some(e),
                };
            }
        };

        let mut steps = Vec::new();
        let prior = if self.options.refresh {
            match self.refresh(&registry, &scheduler, &executor) {
                Ok((prior, refreshed)) => {
                    steps.extend(refreshed);
                    prior
                }
                Err(e) => {
                    executor.fail(e);
                    self.base.clone()
                }
            }
        } else {
            self.base.clone()
        };

        let intake = Intake::new(self.options.stack.clone(), self.options.project.clone())
            .with_stack_transforms(self.stack_transforms.clone());
        let generator = StepGenerator::new(prior, Arc::clone(&registry));
        let (tx, rx) = sync_channel(self.options.queue_capacity.max(1));
        let mut driver = Driver {
            intake,
            generator,
            registry,
            scheduler: Arc::clone(&scheduler),
            executor: Arc::clone(&executor),
            monitor: ResourceMonitor::new(tx),
            chains: HashMap::new(),
            defaults: HashMap::new(),
            converged: Arc::new(Mutex::new(HashSet::new())),
            incomplete: Arc::new(AtomicBool::new(false)),
            constructs: 0,
            program_done: false,
        };

        let program_error = thread::scope(|scope| {
            let program_monitor = driver.monitor.clone();
            let program_thread = scope.spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| program(&program_monitor)));
                program_monitor.program_exited();
                result
            });

            while !(driver.program_done && driver.constructs == 0) {
                let Ok(request) = rx.recv() else {
                    break;
                };
                driver.handle(request, scope);
            }
            drop(rx);

            match program_thread.join() {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(Error::Program(e)),
                Ok(Err(_)) | Err(_) => Some(Error::ProgramPanicked),
            }
        });
        scheduler.wait_idle();

        if let Some(e) = &program_error {
            log::error!("{e}");
        }
        let clean = program_error.is_none() && !executor.is_cancelled() && !driver.incomplete.load(Ordering::SeqCst);
        if clean {
            driver.delete_phase();
        } else {
            log::info!("Skipping deletes because the run did not complete");
        }

        let preview_snapshot = preview.then(|| driver.generator.prior().clone());
        drop(driver);

        let mut error = executor.take_error().or(program_error);
        let entries = self.journal.entries();
        let mut snapshot = match preview_snapshot {
            Some(prior) => prior,
            None => match replay(&self.base, &entries) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let partial = e.partial.map(|partial| *partial);
                    error = error.or(Some(Error::Ledger(e.source)));
                    partial.unwrap_or_else(|| self.base.clone())
                }
            },
        };
        snapshot.manifest = Manifest::new();

        steps.extend(executor.take_applied());
        diagnostics.extend(executor.take_diagnostics());
        let changes = executor.changes();
        self.events.on_run_end(&changes);
        if error.is_none() {
            log::info!("{} changes", changes.total_changes());
        }
        RunResult {
            snapshot,
            entries,
            steps,
            diagnostics,
            changes,
            error,
        }
    }

    /// Read every managed resource back and return the refreshed snapshot
    /// plus the applied refresh steps.
    fn refresh(
        &self,
        registry: &Arc<ProviderRegistry>,
        scheduler: &Arc<Scheduler>,
        executor: &StepExecutor,
    ) -> Result<(Snapshot, Vec<Step>)> {
        let generator = StepGenerator::new(self.base.clone(), Arc::clone(registry));
        let refreshes = generator.generate_refreshes();
        log::info!("Refreshing {} resources", refreshes.len());
        for step in refreshes {
            scheduler.submit(Chain::new(vec![step]));
        }
        scheduler.wait_idle();
        if let Some(error) = executor.take_error() {
            return Err(error);
        }

        let refreshed = executor.take_applied();
        let scratch = Journal::new();
        for step in &refreshed {
            let begun = scratch.begin(step.clone())?;
            scratch.end(begun, step.clone(), true)?;
        }
        let prior = replay(&self.base, &scratch.entries()).map_err(|e| Error::Ledger(e.source))?;
        Ok((prior, refreshed))
    }
}

/// State of the registration loop.
struct Driver {
    intake: Intake,
    generator: StepGenerator,
    registry: Arc<ProviderRegistry>,
    scheduler: Arc<Scheduler>,
    executor: Arc<StepExecutor>,
    /// Kept for construct calls; the loop ends on `ProgramExited`, not on disconnect
    monitor: ResourceMonitor,
    chains: HashMap<Urn, ChainId>,
    defaults: HashMap<String, ProviderRef>,
    /// Resources whose chain applied
    converged: Arc<Mutex<HashSet<Urn>>>,
    /// Set when a registration chain did not apply
    incomplete: Arc<AtomicBool>,
    constructs: usize,
    program_done: bool,
}

type RegisterReply = Reply<std::result::Result<RegisterResponse, RegistrationError>>;

impl Driver {
    fn handle<'scope>(&mut self, request: Request, scope: &'scope Scope<'scope, '_>) {
        match request {
            Request::ProgramExited => self.program_done = true,
            Request::Constructed { urn, result, reply } => {
                self.constructs -= 1;
                let answer = match result {
                    Ok(response) => {
                        self.intake.note_external(&response.urn, None);
                        Ok(RegisterResponse {
                            urn: response.urn,
                            id: String::new(),
                            outputs: response.outputs,
                        })
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        self.executor.fail(Error::provider(&urn, "construct", e));
                        Err(RegistrationError::Failed {
                            urn,
                            op: ledger::StepOp::Create,
                            message,
                        })
                    }
                };
                let _ = reply.send(answer);
            }
            _ if self.executor.is_cancelled() => Self::refuse(request),
            Request::Register { args, reply } if args.remote => self.construct(args, reply, scope),
            Request::Register { args, reply } => self.register(args, reply),
            Request::Read { args, reply } => match self.intake.prepare_read(args) {
                Ok(goal) => self.read(goal, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Request::Outputs { urn, outputs, reply } => {
                let _ = reply.send(self.outputs(urn, outputs));
            }
            Request::Invoke {
                token,
                args,
                provider,
                reply,
            } => {
                let _ = reply.send(self.invoke(&token, args, provider));
            }
        }
    }

    fn refuse(request: Request) {
        match request {
            Request::Register { reply, .. } | Request::Read { reply, .. } => {
                let _ = reply.send(Err(RegistrationError::Cancelled));
            }
            Request::Outputs { reply, .. } => {
                let _ = reply.send(Err(RegistrationError::Cancelled));
            }
            Request::Invoke { reply, .. } => {
                let _ = reply.send(Err(anyhow::Error::new(RegistrationError::Cancelled)));
            }
            Request::Constructed { .. } | Request::ProgramExited => {}
        }
    }

    fn register(&mut self, args: RegisterResource, reply: RegisterReply) {
        let Prepared { mut goal, diagnostics } = match self.intake.prepare(args) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        for diagnostic in diagnostics {
            self.executor.diagnose(diagnostic);
        }

        if goal.custom && !is_provider_type(&goal.ty) && goal.provider.is_none() {
            match self.default_provider(package_of(&goal.ty)) {
                Ok(reference) => {
                    self.intake.set_provider(&goal.urn, reference.clone());
                    goal.provider = Some(reference);
                }
                Err(e) => {
                    self.executor.fail(e);
                    let _ = reply.send(Err(RegistrationError::Cancelled));
                    return;
                }
            }
        }

        match self.generator.generate(&goal) {
            Ok(Generated::Steps(steps)) => self.submit(&goal.to_state(), is_provider_type(&goal.ty), steps, reply),
            Ok(Generated::Rejected(diagnostic)) => {
                self.executor.diagnose(diagnostic.clone());
                let _ = reply.send(Err(RegistrationError::Diagnostic(diagnostic)));
            }
            Err(e) => {
                self.executor.fail(e);
                let _ = reply.send(Err(RegistrationError::Cancelled));
            }
        }
    }

    fn read(&mut self, mut goal: ReadGoal, reply: RegisterReply) {
        if goal.provider.is_none() {
            match self.default_provider(package_of(&goal.ty)) {
                Ok(reference) => goal.provider = Some(reference),
                Err(e) => {
                    self.executor.fail(e);
                    let _ = reply.send(Err(RegistrationError::Cancelled));
                    return;
                }
            }
        }
        match self.generator.generate_read(&goal) {
            Generated::Steps(steps) => self.submit(&goal.to_state(), false, steps, reply),
            Generated::Rejected(diagnostic) => {
                self.executor.diagnose(diagnostic.clone());
                let _ = reply.send(Err(RegistrationError::Diagnostic(diagnostic)));
            }
        }
    }

    /// Submit a registration's chain behind the chains of its predecessors.
    fn submit(&mut self, state: &ResourceState, inline: bool, steps: Vec<Step>, reply: RegisterReply) {
        let urn = state.urn.clone();
        let after: Vec<ChainId> = state
            .predecessors()
            .iter()
            .filter_map(|predecessor| self.chains.get(predecessor).copied())
            .collect();
        let chain = Chain::new(steps).after(after);

        if inline {
            let (id, result) = self.scheduler.run_to_completion(chain);
            self.chains.insert(urn.clone(), id);
            let _ = reply.send(self.answer(&urn, result));
            return;
        }

        let converged = Arc::clone(&self.converged);
        let incomplete = Arc::clone(&self.incomplete);
        let key = urn.clone();
        let id = self.scheduler.submit(chain.on_done(move |result| {
            let _ = reply.send(answer(&key, result, &converged, &incomplete));
        }));
        self.chains.insert(urn, id);
    }

    fn answer(&self, urn: &Urn, result: ChainResult) -> std::result::Result<RegisterResponse, RegistrationError> {
        answer(urn, result, &self.converged, &self.incomplete)
    }

    /// Reference to the default provider for `package`, registering it on first use.
    fn default_provider(&mut self, package: &str) -> Result<ProviderRef> {
        if let Some(reference) = self.defaults.get(package) {
            return Ok(reference.clone());
        }
        let load_error = |message: String| Error::ProviderLoad {
            package: package.to_string(),
            source: anyhow::anyhow!(message),
        };

        let args = RegisterResource::provider(package, default_provider_name(package));
        let Prepared { goal, .. } = self.intake.prepare(args).map_err(|e| load_error(e.to_string()))?;
        let steps = match self.generator.generate(&goal)? {
            Generated::Steps(steps) => steps,
            Generated::Rejected(diagnostic) => return Err(load_error(diagnostic.to_string())),
        };
        let (id, result) = self.scheduler.run_to_completion(Chain::new(steps));
        self.chains.insert(goal.urn.clone(), id);
        match result {
            ChainResult::Applied { state: Some(state) } => {
                log::debug!("Default provider for {package} is {}", state.urn);
                self.converged
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(state.urn.clone());
                let reference = ProviderRef::new(state.urn, state.id);
                self.defaults.insert(package.to_string(), reference.clone());
                Ok(reference)
            }
            other => Err(load_error(format!("default provider did not load: {other:?}"))),
        }
    }

    fn construct<'scope>(&mut self, args: RegisterResource, reply: RegisterReply, scope: &'scope Scope<'scope, '_>) {
        let urn = Urn::new(
            self.intake.stack(),
            self.intake.project(),
            args.options.parent.as_ref().map(Urn::qualified_type),
            &args.ty,
            &args.name,
        );
        let reference = match args.options.provider.clone() {
            Some(reference) => Ok(reference),
            None => self.default_provider(package_of(&args.ty)),
        };
        let provider = match reference.and_then(|reference| self.registry.get(&urn, &reference)) {
            Ok(provider) => provider,
            Err(e) => {
                self.executor.fail(e);
                let _ = reply.send(Err(RegistrationError::Cancelled));
                return;
            }
        };

        log::debug!("Constructing remote component {urn}");
        self.constructs += 1;
        let monitor = self.monitor.clone();
        scope.spawn(move || {
            let result = provider.construct(ConstructRequest {
                ty: args.ty,
                name: args.name,
                parent: args.options.parent.clone(),
                inputs: args.inputs,
                options: args.options,
                monitor: monitor.clone(),
            });
            monitor.constructed(urn, result, reply);
        });
    }

    fn outputs(&self, urn: Urn, outputs: PropertyMap) -> std::result::Result<(), RegistrationError> {
        let converged = self
            .converged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&urn);
        if !converged {
            return Err(RegistrationError::Invalid {
                name: urn.name().to_string(),
                message: format!("cannot register outputs for {urn}: it was not registered successfully"),
            });
        }
        if self.executor.is_preview() {
            return Ok(());
        }
        self.executor
            .append(ledger::Mutation::Outputs { urn, outputs })
            .map(|_| ())
            .map_err(|e| {
                self.executor.fail(e);
                RegistrationError::Cancelled
            })
    }

    fn invoke(&mut self, token: &str, args: PropertyMap, provider: Option<ProviderRef>) -> anyhow::Result<PropertyMap> {
        let reference = match provider {
            Some(reference) => reference,
            None => self.default_provider(package_of(token))?,
        };
        let provider = self.registry.get(&reference.urn, &reference)?;
        provider.invoke(token, args)
    }

    fn delete_phase(&mut self) {
        for diagnostic in self.generator.take_diagnostics() {
            self.executor.diagnose(diagnostic);
        }
        let planned = self.generator.generate_deletes();
        for diagnostic in self.generator.take_diagnostics() {
            self.executor.diagnose(diagnostic);
        }
        log::info!("Deleting {} resources no longer declared", planned.len());

        let mut submitted: HashMap<usize, ChainId> = HashMap::new();
        for PlannedDelete { index, step, after } in planned {
            let after: Vec<ChainId> = after.iter().filter_map(|i| submitted.get(i).copied()).collect();
            let id = self.scheduler.submit(Chain::new(vec![step]).after(after));
            submitted.insert(index, id);
        }
        self.scheduler.wait_idle();
    }
}

fn answer(
    urn: &Urn,
    result: ChainResult,
    converged: &Mutex<HashSet<Urn>>,
    incomplete: &AtomicBool,
) -> std::result::Result<RegisterResponse, RegistrationError> {
    match result {
        ChainResult::Applied { state } => {
            converged
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(urn.clone());
            Ok(match state {
                Some(state) => RegisterResponse::from_state(&state),
                None => RegisterResponse {
                    urn: urn.clone(),
                    id: String::new(),
                    outputs: PropertyMap::new(),
                },
            })
        }
        other => {
            incomplete.store(true, Ordering::SeqCst);
            Err(match other {
                ChainResult::Failed { op, urn, message } => RegistrationError::Failed { urn, op, message },
                ChainResult::Skipped => RegistrationError::Skipped { urn: urn.clone() },
                _ => RegistrationError::Cancelled,
            })
        }
    }
}
