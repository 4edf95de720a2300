//! Chain scheduling on a bounded worker pool.
//!
//! The steps generated for one registration form a chain that runs
//! sequentially. A chain starts once every chain it waits on has finished;
//! if any of them did not apply, the chain is skipped without running.

use crate::error::{Error, Result};
use crate::executor::StepExecutor;
use ledger::{ResourceState, Step, StepOp, Urn};
use std::collections::HashMap;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

pub type ChainId = usize;

/// How a chain ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainResult {
    /// Every step applied; carries the record the chain produced, if any
    Applied { state: Option<ResourceState> },
    Failed { op: StepOp, urn: Urn, message: String },
    /// A chain it waited on did not apply
    Skipped,
    /// The run was cancelled before the chain finished
    Cancelled,
}

impl ChainResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ChainResult::Applied { .. })
    }
}

type Reply = Box<dyn FnOnce(ChainResult) + Send>;

/// Steps of one registration plus the chains they wait on.
pub struct Chain {
    steps: Vec<Step>,
    after: Vec<ChainId>,
    reply: Option<Reply>,
}

impl Chain {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            after: Vec::new(),
            reply: None,
        }
    }

    pub fn after(mut self, chains: impl IntoIterator<Item = ChainId>) -> Self {
        self.after.extend(chains);
        self
    }

    /// Called from the worker thread once the chain reaches a terminal state.
    pub fn on_done(mut self, reply: impl FnOnce(ChainResult) + Send + 'static) -> Self {
        self.reply = Some(Box::new(reply));
        self
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("steps", &self.steps.len())
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

enum Readiness {
    Ready,
    Blocked,
    Doomed,
}

#[derive(Default)]
struct Board {
    next: ChainId,
    /// Terminal chains and whether they applied
    finished: HashMap<ChainId, bool>,
    waiting: Vec<(ChainId, Chain)>,
    /// Chains dispatched or being skipped but not yet finished
    running: usize,
}

impl Board {
    fn readiness(&self, after: &[ChainId]) -> Readiness {
        let mut ready = true;
        for id in after {
            match self.finished.get(id) {
                Some(false) => return Readiness::Doomed,
                Some(true) => {}
                None => ready = false,
            }
        }
        if ready { Readiness::Ready } else { Readiness::Blocked }
    }
}

pub struct Scheduler {
    pool: rayon::ThreadPool,
    executor: Arc<StepExecutor>,
    board: Mutex<Board>,
    idle: Condvar,
}

impl Scheduler {
    pub fn new(executor: Arc<StepExecutor>, parallel: usize) -> Result<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallel.max(1))
            .thread_name(|i| format!("converge-step-{i}"))
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;
        Ok(Arc::new(Self {
            pool,
            executor,
            board: Mutex::new(Board::default()),
            idle: Condvar::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a chain. It starts as soon as the chains it waits on applied.
    pub fn submit(self: &Arc<Self>, chain: Chain) -> ChainId {
        let (id, readiness) = {
            let mut board = self.lock();
            let id = board.next;
            board.next += 1;
            let readiness = board.readiness(&chain.after);
            match readiness {
                Readiness::Blocked => {
                    board.waiting.push((id, chain));
                    return id;
                }
                Readiness::Ready | Readiness::Doomed => board.running += 1,
            }
            (id, readiness)
        };
        match readiness {
            Readiness::Ready => self.dispatch(id, chain),
            _ => self.finish(id, chain.reply, ChainResult::Skipped),
        }
        id
    }

    /// Submit a chain and block until it finishes.
    pub fn run_to_completion(self: &Arc<Self>, chain: Chain) -> (ChainId, ChainResult) {
        let (tx, rx) = sync_channel(1);
        let id = self.submit(chain.on_done(move |result| {
            let _ = tx.send(result);
        }));
        (id, rx.recv().unwrap_or(ChainResult::Cancelled))
    }

    fn dispatch(self: &Arc<Self>, id: ChainId, chain: Chain) {
        let this = Arc::clone(self);
        self.pool.spawn(move || {
            let Chain { steps, reply, .. } = chain;
            let result = this.executor.run_chain(steps);
            this.finish(id, reply, result);
        });
    }

    fn finish(self: &Arc<Self>, id: ChainId, reply: Option<Reply>, result: ChainResult) {
        let applied = result.is_applied();
        if let Some(reply) = reply {
            reply(result);
        }

        let (ready, doomed) = {
            let mut board = self.lock();
            board.finished.insert(id, applied);
            board.running -= 1;
            let mut ready = Vec::new();
            let mut doomed = Vec::new();
            for (waiting_id, chain) in std::mem::take(&mut board.waiting) {
                match board.readiness(&chain.after) {
                    Readiness::Ready => {
                        board.running += 1;
                        ready.push((waiting_id, chain));
                    }
                    Readiness::Doomed => {
                        board.running += 1;
                        doomed.push((waiting_id, chain));
                    }
                    Readiness::Blocked => board.waiting.push((waiting_id, chain)),
                }
            }
            (ready, doomed)
        };

        for (waiting_id, chain) in ready {
            self.dispatch(waiting_id, chain);
        }
        for (waiting_id, chain) in doomed {
            log::debug!("Skipping chain {waiting_id}: a chain it waits on did not apply");
            self.finish(waiting_id, chain.reply, ChainResult::Skipped);
        }
        self.idle.notify_all();
    }

    /// Block until every submitted chain has finished.
    pub fn wait_idle(&self) {
        let mut board = self.lock();
        while board.running > 0 || !board.waiting.is_empty() {
            board = self.idle.wait(board).unwrap_or_else(PoisonError::into_inner);
        }
    }
}
