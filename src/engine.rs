//! The flow engine: routing, workers, timers, and the inbound loop.
//!
//! [`FlowEngine`] wraps a [`FlowPipeline`] with one worker per active flow
//! (so events for a flow are applied strictly in arrival order), a global
//! concurrency limit, an in-process timer [`Scheduler`], and a dead-letter
//! list for events that could not be processed.
//!
//! [`FlowEngine::start`] runs the inbound loop in the background: it consumes
//! a stream of [`InboundRecord`]s, fires due timers on every tick, sweeps the
//! fiber cache, and stops when [`EngineHandle::shutdown`] is called.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore, watch};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, FlowEvent, InboundRecord};
use crate::checkpoint::CheckpointSummary;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::Services;
use crate::dispatch::WaitingForDispatcher;
use crate::error::FlowError;
use crate::flow::FlowRegistry;
use crate::identity::{FlowIdentity, PartyId};
use crate::pipeline::{FlowPipeline, FlowPipelineBuilder, ProcessOutcome, RecoveryReport};
use crate::scheduler::{Scheduler, SchedulingBus};
use crate::store::CheckpointStore;
use crate::worker::{ProcessResult, WorkerConfig, WorkerHandle};

/// An inbound record that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The record as received.
    pub record: InboundRecord,
    /// Human-readable error message.
    pub error: String,
    /// Whether redelivering the record later may succeed.
    pub transient: bool,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// What [`FlowEngine::submit`] did with a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// An event was processed by its flow.
    Flow(ProcessOutcome),
    /// A listing was published.
    Listed(Vec<CheckpointSummary>),
}

/// Append one dead letter to the JSONL log at `path`.
///
/// Creates the file and its parent directory if needed.
///
/// # Errors
///
/// Returns `io::Error` if file I/O fails.
fn append_dead_letter(path: &Path, letter: &DeadLetter) -> io::Result<()> {
    use std::io::Write;
    let json = serde_json::to_string(letter).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

struct EngineInner {
    pipeline: Arc<FlowPipeline>,
    scheduler: Arc<Scheduler>,
    workers: RwLock<HashMap<FlowIdentity, WorkerHandle>>,
    permits: Arc<Semaphore>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    dead_letter_log: Option<PathBuf>,
}

/// Durable flow engine.
///
/// `Clone` is cheap: all state is shared behind an `Arc`.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    /// Start building an engine for the flows in `registry`.
    pub fn builder(registry: FlowRegistry) -> FlowEngineBuilder {
        FlowEngineBuilder::new(registry)
    }

    /// The underlying pipeline.
    pub fn pipeline(&self) -> &FlowPipeline {
        &self.inner.pipeline
    }

    /// The in-process timer scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    // --- Routing ---

    /// Get a live worker for `identity`, spawning one if needed.
    async fn worker(&self, identity: &FlowIdentity) -> WorkerHandle {
        {
            let workers = self.inner.workers.read().await;
            if let Some(handle) = workers.get(identity)
                && handle.is_alive()
            {
                return handle.clone();
            }
        }

        let mut workers = self.inner.workers.write().await;
        if let Some(handle) = workers.get(identity)
            && handle.is_alive()
        {
            return handle.clone();
        }
        debug!(flow = %identity, "spawning worker");
        let config = WorkerConfig {
            idle_timeout: self.inner.pipeline.config().worker_idle_timeout,
        };
        let handle = WorkerHandle::spawn(
            identity.clone(),
            Arc::clone(&self.inner.pipeline),
            Arc::clone(&self.inner.permits),
            config,
        );
        workers.insert(identity.clone(), handle.clone());
        handle
    }

    /// Queue `event` on the flow's worker, respawning it once if it exited.
    async fn enqueue(
        &self,
        identity: &FlowIdentity,
        event: FlowEvent,
    ) -> Result<tokio::sync::oneshot::Receiver<ProcessResult>, FlowError> {
        match self.worker(identity).await.enqueue(event.clone()).await {
            Err(FlowError::WorkerGone) => self.worker(identity).await.enqueue(event).await,
            other => other,
        }
    }

    /// Process one inbound record and wait for the result.
    ///
    /// Events for the same flow are applied in submission order. Failures
    /// are returned and also recorded as dead letters.
    ///
    /// # Errors
    ///
    /// Whatever [`FlowPipeline::process`] or [`FlowPipeline::list_flows`]
    /// returned.
    pub async fn submit(&self, record: InboundRecord) -> Result<Handled, FlowError> {
        let result = match &record {
            InboundRecord::Flow { identity, event } => match self.enqueue(identity, event.clone()).await {
                Ok(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(FlowError::WorkerGone))
                    .map(Handled::Flow),
                Err(err) => Err(err),
            },
            InboundRecord::ListFlows { party } => self
                .inner
                .pipeline
                .list_flows(party.clone())
                .await
                .map(Handled::Listed),
        };
        if let Err(err) = &result {
            self.dead_letter(record, err);
        }
        result
    }

    /// Process one event for `identity` and wait for the outcome.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn process(&self, identity: &FlowIdentity, event: FlowEvent) -> Result<ProcessOutcome, FlowError> {
        match self
            .submit(InboundRecord::Flow {
                identity: identity.clone(),
                event,
            })
            .await?
        {
            Handled::Flow(outcome) => Ok(outcome),
            Handled::Listed(_) => Err(FlowError::Configuration("flow event answered with a listing".into())),
        }
    }

    /// Hand a record to its worker without waiting for the outcome.
    ///
    /// The outcome is awaited on a separate task; failures become dead
    /// letters.
    async fn dispatch(&self, record: InboundRecord) {
        match record {
            InboundRecord::Flow { identity, event } => match self.enqueue(&identity, event.clone()).await {
                Ok(rx) => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = rx.await.unwrap_or_else(|_| Err(FlowError::WorkerGone)) {
                            engine.dead_letter(InboundRecord::Flow { identity, event }, &err);
                        }
                    });
                }
                Err(err) => self.dead_letter(InboundRecord::Flow { identity, event }, &err),
            },
            InboundRecord::ListFlows { party } => {
                if let Err(err) = self.inner.pipeline.list_flows(party.clone()).await {
                    self.dead_letter(InboundRecord::ListFlows { party }, &err);
                }
            }
        }
    }

    fn dead_letter(&self, record: InboundRecord, err: &FlowError) {
        let letter = DeadLetter {
            record,
            error: err.to_string(),
            transient: err.is_transient(),
            at: self.inner.pipeline.now(),
        };
        error!(error = %err, transient = letter.transient, "inbound record dead-lettered");
        if let Some(path) = &self.inner.dead_letter_log
            && let Err(io_err) = append_dead_letter(path, &letter)
        {
            warn!(error = %io_err, path = %path.display(), "failed to write dead-letter log");
        }
        self.lock_dead_letters().push(letter);
    }

    fn lock_dead_letters(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetter>> {
        self.inner
            .dead_letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Records that could not be processed, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_dead_letters().clone()
    }

    /// Remove and return the recorded dead letters.
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.lock_dead_letters())
    }

    // --- Timers and maintenance ---

    /// Deliver `TimerFired` to every flow whose wakeup is due, waiting for
    /// each to be processed.
    ///
    /// # Returns
    ///
    /// The number of wakeups delivered.
    pub async fn fire_due_timers(&self) -> usize {
        let due = self.inner.scheduler.due(self.inner.pipeline.now());
        let fired = due.len();
        for (identity, at) in due {
            // Failures are already dead-lettered by `submit`.
            let _ = self
                .submit(InboundRecord::Flow {
                    identity,
                    event: FlowEvent::TimerFired { at },
                })
                .await;
        }
        fired
    }

    /// One tick of the background loop.
    async fn tick(&self) {
        for (identity, at) in self.inner.scheduler.due(self.inner.pipeline.now()) {
            self.dispatch(InboundRecord::Flow {
                identity,
                event: FlowEvent::TimerFired { at },
            })
            .await;
        }
        let swept = self.inner.pipeline.cache().sweep_idle();
        if swept > 0 {
            debug!(swept, "idle fibers evicted");
        }
        self.inner
            .workers
            .write()
            .await
            .retain(|_, handle| handle.is_alive());
    }

    /// Crash recovery: republish stored outboxes, finish pending deletions,
    /// and arm the wakeups waiting flows need.
    ///
    /// Call once on startup, before [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Store and bus errors once retries are spent.
    pub async fn recover(&self) -> Result<RecoveryReport, FlowError> {
        let report = self.inner.pipeline.recover().await?;
        for (identity, at) in &report.wakeups {
            self.inner.scheduler.schedule(identity.clone(), *at);
        }
        Ok(report)
    }

    /// Evict the cached fibers of every flow owned by one of `parties`, e.g.
    /// after a partition reassignment.
    pub fn evict_parties<'a>(&self, parties: impl IntoIterator<Item = &'a PartyId>) -> usize {
        let evicted = self.inner.pipeline.evict_parties(parties);
        info!(evicted, "fibers evicted for reassigned parties");
        evicted
    }

    /// Status and last error of a flow.
    ///
    /// # Errors
    ///
    /// Store errors once retries are spent.
    pub async fn status(&self, identity: &FlowIdentity) -> Result<Option<CheckpointSummary>, FlowError> {
        self.inner.pipeline.status(identity).await
    }

    /// Summaries of stored flows, optionally for one party.
    ///
    /// # Errors
    ///
    /// Store errors once retries are spent.
    pub async fn list_flows(&self, party: Option<&PartyId>) -> Result<Vec<CheckpointSummary>, FlowError> {
        self.inner.pipeline.list(party).await
    }

    /// Number of registered workers, including ones that have just exited.
    pub async fn worker_count(&self) -> usize {
        self.inner.workers.read().await.len()
    }

    async fn stop_workers(&self) {
        let workers: Vec<_> = self.inner.workers.write().await.drain().map(|(_, h)| h).collect();
        for handle in workers {
            handle.shutdown().await;
        }
    }

    // --- Background loop ---

    /// Run the inbound loop in the background.
    ///
    /// Records from `inbound` are routed to their flows' workers without
    /// waiting for each to finish, so different flows progress concurrently.
    /// When `inbound` ends the loop keeps firing timers until shut down.
    ///
    /// # Returns
    ///
    /// A handle for shutting the loop down.
    pub fn start<S>(&self, inbound: S) -> EngineHandle
    where
        S: Stream<Item = InboundRecord> + Send + Unpin + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(self.clone(), inbound, shutdown_rx));
        EngineHandle {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("pipeline", &self.inner.pipeline)
            .field("scheduled", &self.inner.scheduler.len())
            .finish_non_exhaustive()
    }
}

async fn run_loop<S>(engine: FlowEngine, mut inbound: S, mut shutdown_rx: watch::Receiver<bool>)
where
    S: Stream<Item = InboundRecord> + Send + Unpin + 'static,
{
    let mut tick = tokio::time::interval(engine.inner.pipeline.config().timer_tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut inbound_open = true;
    info!("engine loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            record = inbound.next(), if inbound_open => match record {
                Some(record) => engine.dispatch(record).await,
                None => {
                    info!("inbound stream ended");
                    inbound_open = false;
                }
            },
            _ = tick.tick() => engine.tick().await,
        }
    }

    engine.stop_workers().await;
    info!("engine loop stopped");
}

/// Handle to a running engine loop.
///
/// Dropping the handle does not stop the loop; call
/// [`shutdown`](EngineHandle::shutdown).
#[derive(Clone)]
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Returns `true` until the loop has been told to stop.
    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Workers finish the events already queued to them. Calling `shutdown`
    /// more than once is safe.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task
            && let Err(err) = join_handle.await
        {
            error!(error = %err, "engine loop task panicked");
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// --- Builder ---

/// Builder for [`FlowEngine`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use flowfold::{
///     Flow, FlowContext, FlowEngine, FlowFailure, FlowRegistry, FlowResume, FlowStep,
///     InMemoryCheckpointStore, InMemoryEventBus,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Hello;
///
/// impl Flow for Hello {
///     const NAME: &'static str = "hello";
///
///     fn resume(&mut self, _ctx: &mut FlowContext<'_>, _input: FlowResume) -> Result<FlowStep, FlowFailure> {
///         Ok(FlowStep::Complete(serde_json::json!("hi")))
///     }
/// }
///
/// let engine = FlowEngine::builder(FlowRegistry::new().register::<Hello>())
///     .store(Arc::new(InMemoryCheckpointStore::new()))
///     .bus(Arc::new(InMemoryEventBus::new()))
///     .build()
///     .unwrap();
/// assert!(engine.scheduler().is_empty());
/// ```
pub struct FlowEngineBuilder {
    pipeline: FlowPipelineBuilder,
    scheduler: Arc<Scheduler>,
    max_concurrency: usize,
    dead_letter_log: Option<PathBuf>,
}

impl FlowEngineBuilder {
    /// Create a builder for the flows in `registry`.
    pub fn new(registry: FlowRegistry) -> Self {
        Self {
            pipeline: FlowPipelineBuilder::new(registry),
            scheduler: Arc::new(Scheduler::new()),
            max_concurrency: EngineConfig::default().max_concurrency,
            dead_letter_log: None,
        }
    }

    /// Set the checkpoint store.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn store<S: CheckpointStore>(mut self, store: Arc<S>) -> Self {
        self.pipeline = self.pipeline.store(store);
        self
    }

    /// Set the event bus. Published `ScheduleWakeup` records also arm the
    /// engine's own scheduler.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn bus<B: EventBus>(mut self, bus: Arc<B>) -> Self {
        let bus = SchedulingBus::new(bus, Arc::clone(&self.scheduler));
        self.pipeline = self.pipeline.bus(Arc::new(bus));
        self
    }

    /// Set the clock.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.pipeline = self.pipeline.clock(clock);
        self
    }

    /// Set the services available to flows.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn services(mut self, services: Services) -> Self {
        self.pipeline = self.pipeline.services(services);
        self
    }

    /// Replace the waiting-for dispatcher.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn dispatcher(mut self, dispatcher: WaitingForDispatcher) -> Self {
        self.pipeline = self.pipeline.dispatcher(dispatcher);
        self
    }

    /// Set the configuration.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.max_concurrency = config.max_concurrency;
        self.pipeline = self.pipeline.config(config);
        self
    }

    /// Also append dead letters to a JSONL file.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn dead_letter_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.dead_letter_log = Some(path.into());
        self
    }

    /// Validate the assembly and build the engine.
    ///
    /// # Errors
    ///
    /// [`FlowError::Configuration`] for an invalid assembly (see
    /// [`FlowPipelineBuilder::build`]) or a zero concurrency limit.
    pub fn build(self) -> Result<FlowEngine, FlowError> {
        if self.max_concurrency == 0 {
            return Err(FlowError::Configuration("max_concurrency must be at least 1".into()));
        }
        let pipeline = self.pipeline.build()?;
        Ok(FlowEngine {
            inner: Arc::new(EngineInner {
                pipeline: Arc::new(pipeline),
                scheduler: self.scheduler,
                workers: RwLock::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(self.max_concurrency)),
                dead_letters: Mutex::new(Vec::new()),
                dead_letter_log: self.dead_letter_log,
            }),
        })
    }
}

impl std::fmt::Debug for FlowEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngineBuilder")
            .field("pipeline", &self.pipeline)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}
