//! Group scheduler and result streaming.
//!
//! Operators sharing a group id form one sequential pull chain. An input
//! belonging to another group is run on a worker thread that pumps its
//! tuples into a bounded channel; when every worker slot is taken the group
//! is pulled inline by its consumer instead. Cancellation is cooperative:
//! sources and channel waits check a shared flag.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::query::binding::{BindingContext, SharedBindings};
use crate::query::context::{CancelToken, GroupId, QueryContext};
use crate::query::errors::ExecutionError;
use crate::query::operators::{lower, BoxTupleStream, Operator, TupleStream};
use crate::query::planner::PhysicalPlan;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::value::{ColumnDef, Columns, Tuple};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const MIN_BACKOFF: Duration = Duration::from_micros(50);
const MAX_BACKOFF: Duration = Duration::from_millis(5);

/// Cancellation seen by one execution: the query's token plus a token owned
/// by the result stream.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancelScope {
    query: CancelToken,
    local: CancelToken,
}

impl CancelScope {
    fn new(query: CancelToken) -> Self {
        Self {
            query,
            local: CancelToken::new(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.local.is_cancelled() || self.query.is_cancelled()
    }

    pub(crate) fn check(&self) -> std::result::Result<(), ExecutionError> {
        if self.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Stops this execution without touching the query's token.
    pub(crate) fn cancel(&self) {
        self.local.cancel();
    }
}

#[derive(Debug)]
struct WorkerPool {
    max: usize,
    active: AtomicUsize,
}

struct WorkerPermit(Arc<WorkerPool>);

impl WorkerPool {
    fn try_acquire(self: &Arc<Self>) -> Option<WorkerPermit> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.max).then_some(n + 1))
            .ok()
            .map(|_| WorkerPermit(Arc::clone(self)))
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

type Workers = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Per-execution state handed to lowering.
pub(crate) struct ExecutionEnv {
    bindings: SharedBindings,
    cancel: CancelScope,
    pool: Arc<WorkerPool>,
    channel_capacity: usize,
    spill_dir: Option<PathBuf>,
    rows_affected: Arc<AtomicU64>,
    workers: Workers,
}

impl ExecutionEnv {
    /// `bindings` is this execution's own snapshot of the context's
    /// bindings; sub-query results land there and nowhere else.
    fn new(ctx: &QueryContext, bindings: BindingContext) -> Self {
        let execution = &ctx.config().execution;
        Self {
            bindings: bindings.shared(),
            cancel: CancelScope::new(ctx.cancel_token().clone()),
            pool: Arc::new(WorkerPool {
                max: execution.max_workers,
                active: AtomicUsize::new(0),
            }),
            channel_capacity: execution.channel_capacity.max(1),
            spill_dir: execution.spill_dir.clone(),
            rows_affected: Arc::new(AtomicU64::new(0)),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn bindings(&self) -> &SharedBindings {
        &self.bindings
    }

    pub(crate) fn cancel(&self) -> &CancelScope {
        &self.cancel
    }

    pub(crate) fn spill_dir(&self) -> Option<&Path> {
        self.spill_dir.as_deref()
    }

    pub(crate) fn rows_affected(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.rows_affected)
    }

    /// Runs a foreign group's operator on a worker and returns the consuming
    /// end of its channel, or the operator itself when no worker is free.
    pub(crate) fn connect(&self, operator: Operator) -> std::result::Result<BoxTupleStream, ExecutionError> {
        let group = operator.group_id;
        let Some(permit) = self.pool.try_acquire() else {
            trace!(group, "executor.group.inline");
            return Ok(operator.into_stream());
        };
        let (tx, rx) = sync_channel(self.channel_capacity);
        let cancel = self.cancel.clone();
        let stream = operator.into_stream();
        let handle = thread::Builder::new()
            .name(format!("tessera-group-{group}"))
            .spawn(move || {
                let _permit = permit;
                pump(stream, tx, cancel, group);
            })?;
        self.workers.lock().push(handle);
        Ok(Box::new(ChannelStream {
            rx,
            cancel: self.cancel.clone(),
            group,
            finished: false,
        }))
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        join_all(&self.workers);
    }
}

fn join_all(workers: &Workers) {
    let handles: Vec<_> = workers.lock().drain(..).collect();
    for handle in handles {
        if handle.join().is_err() {
            warn!("executor.group.panicked");
        }
    }
}

/// `Ok(None)` marks the end of a group's output.
type Message = std::result::Result<Option<Tuple>, ExecutionError>;

fn pump(mut stream: BoxTupleStream, tx: SyncSender<Message>, cancel: CancelScope, group: GroupId) {
    debug!(group, "executor.group.started");
    let mut produced = 0u64;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let message = stream.try_next();
        let last = !matches!(message, Ok(Some(_)));
        if let Err(err) = &message {
            if !err.is_cancelled() {
                warn!(group, error = %err, "executor.group.failed");
            }
        }
        if !send(&tx, message, &cancel) || last {
            break;
        }
        produced += 1;
    }
    debug!(group, produced, "executor.group.finished");
}

/// Sends with exponential backoff while the channel is full. Returns
/// `false` once the consumer is gone or the execution was cancelled.
fn send(tx: &SyncSender<Message>, mut message: Message, cancel: &CancelScope) -> bool {
    let mut backoff = MIN_BACKOFF;
    loop {
        match tx.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                message = back;
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

struct ChannelStream {
    rx: Receiver<Message>,
    cancel: CancelScope,
    group: GroupId,
    finished: bool,
}

impl TupleStream for ChannelStream {
    fn try_next(&mut self) -> std::result::Result<Option<Tuple>, ExecutionError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(Some(tuple))) => return Ok(Some(tuple)),
                Ok(other) => {
                    self.finished = true;
                    return other;
                }
                Err(RecvTimeoutError::Timeout) => self.cancel.check()?,
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    self.cancel.check()?;
                    return Err(ExecutionError::WorkerLost { group: self.group });
                }
            }
        }
    }
}

/// Runs physical plans.
#[derive(Clone, Copy, Debug, Default)]
pub struct Executor;

impl Executor {
    /// Creates an executor.
    pub fn new() -> Self {
        Self
    }

    /// Starts executing a private copy of `plan` and returns its lazy result
    /// stream.
    ///
    /// Fails with a binding error when a parameter is still unbound, and with
    /// an execution error when the query was already cancelled or an operator
    /// could not be set up.
    pub fn execute(&self, plan: &PhysicalPlan, ctx: &QueryContext) -> Result<ResultStream> {
        let root = plan.instantiate();
        let bindings = ctx.bindings().read().copy();
        root.bind(&bindings)?;
        ctx.cancel_token().check()?;
        let env = ExecutionEnv::new(ctx, bindings);
        let operator = match lower(&root, &env) {
            Ok(operator) => operator,
            Err(err) => {
                env.shutdown();
                return Err(err.into());
            }
        };
        debug!(
            query = ctx.query_id(),
            digest = plan.digest,
            root = operator.name,
            groups = root.groups().len(),
            "executor.execute"
        );
        Ok(ResultStream {
            columns: Arc::clone(&operator.columns),
            stream: operator.into_stream(),
            cancel: env.cancel.clone(),
            workers: Arc::clone(&env.workers),
            rows_affected: env.rows_affected(),
            query_id: ctx.query_id().to_string(),
            produced: 0,
            done: false,
        })
    }
}

/// Lazy, cancellable sequence of result tuples.
///
/// After an error or a cancellation the stream yields that error once and
/// then ends. Dropping the stream cancels and joins every worker group.
pub struct ResultStream {
    columns: Columns,
    stream: BoxTupleStream,
    cancel: CancelScope,
    workers: Workers,
    rows_affected: Arc<AtomicU64>,
    query_id: String,
    produced: u64,
    done: bool,
}

impl ResultStream {
    /// Columns of every tuple the stream yields.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Requests cancellation; the next pull yields
    /// [`ExecutionError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Rows inserted, updated or deleted so far by sink operators.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected.load(Ordering::SeqCst)
    }

    fn finish(&mut self) {
        self.done = true;
        self.cancel.cancel();
        debug!(query = %self.query_id, rows = self.produced, "executor.stream.done");
    }
}

impl Iterator for ResultStream {
    type Item = std::result::Result<Tuple, ExecutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(err) = self.cancel.check() {
            self.finish();
            return Some(Err(err));
        }
        let timer = profile_timer();
        let next = self.stream.try_next();
        record_profile_timer(QueryProfileKind::StreamIter, timer);
        match next {
            Ok(Some(tuple)) => {
                self.produced += 1;
                Some(Ok(tuple))
            }
            Ok(None) => {
                self.finish();
                None
            }
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(query = %self.query_id, error = %err, "executor.stream.failed");
                }
                self.finish();
                Some(Err(err))
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        join_all(&self.workers);
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("query_id", &self.query_id)
            .field("columns", &self.columns)
            .field("produced", &self.produced)
            .field("done", &self.done)
            .finish()
    }
}
