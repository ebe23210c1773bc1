//! Per-flow worker that serializes event processing for one identity.
//!
//! Each active [`FlowIdentity`] gets its own tokio task fed by a bounded
//! `mpsc` channel, so events for one flow are processed strictly in arrival
//! order while different flows run concurrently (bounded by a shared
//! semaphore). The worker exits when told to, when every handle is dropped,
//! or after an idle timeout; the engine respawns it on the next event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{Instrument, debug, debug_span};

use crate::bus::FlowEvent;
use crate::error::FlowError;
use crate::identity::FlowIdentity;
use crate::pipeline::{FlowPipeline, ProcessOutcome};

/// Capacity of each worker's inbound channel.
const CHANNEL_CAPACITY: usize = 32;

/// Reply carried back to the submitter.
pub(crate) type ProcessResult = Result<ProcessOutcome, FlowError>;

/// Configuration for a worker loop.
pub(crate) struct WorkerConfig {
    /// How long the worker waits for a message before shutting down.
    pub idle_timeout: Duration,
}

/// Messages sent from [`WorkerHandle`] to the worker loop.
pub(crate) enum WorkerMessage {
    /// Process one event for the worker's flow.
    Process {
        /// The event.
        event: FlowEvent,
        /// Channel to send the outcome back on.
        reply: oneshot::Sender<ProcessResult>,
    },
    /// Stop after the messages already queued.
    Shutdown,
}

/// Runs one flow's worker loop.
///
/// On idle timeout the channel is closed first and anything that slipped in
/// is still processed, so an accepted event is never dropped.
///
/// # Arguments
///
/// * `identity` - The flow this worker serves.
/// * `pipeline` - Shared pipeline doing the actual work.
/// * `permits` - Global concurrency limit.
/// * `rx` - Receiving end of the worker's channel.
/// * `config` - Worker configuration (idle timeout).
async fn run_worker(
    identity: FlowIdentity,
    pipeline: Arc<FlowPipeline>,
    permits: Arc<Semaphore>,
    mut rx: mpsc::Receiver<WorkerMessage>,
    config: WorkerConfig,
) {
    loop {
        match tokio::time::timeout(config.idle_timeout, rx.recv()).await {
            Ok(Some(WorkerMessage::Process { event, reply })) => {
                let result = process(&identity, &pipeline, &permits, event).await;
                // The submitter may have stopped waiting.
                let _ = reply.send(result);
            }
            Ok(Some(WorkerMessage::Shutdown)) | Ok(None) => break,
            Err(_elapsed) => {
                debug!(flow = %identity, "worker idle, shutting down");
                rx.close();
                while let Ok(message) = rx.try_recv() {
                    if let WorkerMessage::Process { event, reply } = message {
                        let result = process(&identity, &pipeline, &permits, event).await;
                        let _ = reply.send(result);
                    }
                }
                break;
            }
        }
    }
}

async fn process(
    identity: &FlowIdentity,
    pipeline: &FlowPipeline,
    permits: &Semaphore,
    event: FlowEvent,
) -> ProcessResult {
    let Ok(_permit) = permits.acquire().await else {
        return Err(FlowError::WorkerGone);
    };
    pipeline.process(identity, event).await
}

/// Async handle to a running flow worker.
///
/// Cheap to clone; all clones feed the same worker.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    sender: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    /// Spawn a worker for `identity` on the current runtime.
    pub(crate) fn spawn(
        identity: FlowIdentity,
        pipeline: Arc<FlowPipeline>,
        permits: Arc<Semaphore>,
        config: WorkerConfig,
    ) -> Self {
        let (sender, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let span = debug_span!("flow_worker", flow = %identity);
        tokio::spawn(run_worker(identity, pipeline, permits, rx, config).instrument(span));
        Self { sender }
    }

    /// Queue an event without waiting for it to be processed.
    ///
    /// Waits only for channel capacity.
    ///
    /// # Returns
    ///
    /// A receiver for the processing outcome.
    ///
    /// # Errors
    ///
    /// [`FlowError::WorkerGone`] if the worker has exited.
    pub(crate) async fn enqueue(&self, event: FlowEvent) -> Result<oneshot::Receiver<ProcessResult>, FlowError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Process { event, reply })
            .await
            .map_err(|_| FlowError::WorkerGone)?;
        Ok(rx)
    }

    /// Queue an event and wait for its outcome.
    ///
    /// # Errors
    ///
    /// [`FlowError::WorkerGone`] if the worker exited before replying;
    /// otherwise whatever [`FlowPipeline::process`] returned.
    pub(crate) async fn process(&self, event: FlowEvent) -> ProcessResult {
        let rx = self.enqueue(event).await?;
        rx.await.map_err(|_| FlowError::WorkerGone)?
    }

    /// Ask the worker to stop once its queue is drained.
    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(WorkerMessage::Shutdown).await;
    }

    /// Returns `true` if the worker is still accepting messages.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::context::FlowContext;
    use crate::error::FlowFailure;
    use crate::flow::{Flow, FlowIORequest, FlowRegistry, FlowResume, FlowStep};
    use crate::pipeline::Disposition;
    use crate::store::InMemoryCheckpointStore;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use uuid::Uuid;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Napper {
        naps: u32,
    }

    impl Flow for Napper {
        const NAME: &'static str = "napper";

        fn resume(&mut self, _ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
            match input {
                FlowResume::Start { .. } => Ok(FlowStep::Suspend(FlowIORequest::ForceCheckpoint)),
                FlowResume::Wakeup => {
                    self.naps += 1;
                    Ok(FlowStep::Suspend(FlowIORequest::ForceCheckpoint))
                }
                other => Err(FlowFailure::new(format!("unexpected {}", other.kind()))),
            }
        }
    }

    fn pipeline() -> Arc<FlowPipeline> {
        Arc::new(
            FlowPipeline::builder(FlowRegistry::new().register::<Napper>())
                .store(Arc::new(InMemoryCheckpointStore::new()))
                .bus(Arc::new(InMemoryEventBus::new()))
                .build()
                .expect("pipeline"),
        )
    }

    fn spawn(idle: Duration) -> (WorkerHandle, FlowIdentity) {
        let identity = FlowIdentity::new("alice", Uuid::from_u128(1));
        let handle = WorkerHandle::spawn(
            identity.clone(),
            pipeline(),
            Arc::new(Semaphore::new(4)),
            WorkerConfig { idle_timeout: idle },
        );
        (handle, identity)
    }

    fn start() -> FlowEvent {
        FlowEvent::Start {
            flow_name: "napper".into(),
            args: Value::Null,
        }
    }

    #[tokio::test]
    async fn events_are_processed_in_order() {
        let (handle, identity) = spawn(Duration::from_secs(60));
        let first = handle.enqueue(start()).await.expect("enqueue");
        let second = handle.enqueue(FlowEvent::Wakeup).await.expect("enqueue");
        let third = handle.enqueue(FlowEvent::Wakeup).await.expect("enqueue");

        let outcomes = [
            first.await.expect("reply").expect("first"),
            second.await.expect("reply").expect("second"),
            third.await.expect("reply").expect("third"),
        ];
        assert!(outcomes.iter().all(|o| o.identity == identity));
        assert_eq!(
            outcomes.iter().map(|o| o.version).collect::<Vec<_>>(),
            vec![Some(1), Some(2), Some(3)]
        );
        assert!(outcomes.iter().all(|o| o.disposition == Disposition::Suspended));
    }

    #[tokio::test]
    async fn process_returns_pipeline_outcome() {
        let (handle, _) = spawn(Duration::from_secs(60));
        let outcome = handle.process(start()).await.expect("start");
        assert_eq!(outcome.disposition, Disposition::Suspended);
        let inspected = handle.process(FlowEvent::Inspect).await.expect("inspect");
        assert_eq!(inspected.disposition, Disposition::Inspected);
        assert_eq!(inspected.published, 1);
    }

    #[tokio::test]
    async fn idle_worker_exits_and_reports_gone() {
        let (handle, _) = spawn(Duration::from_millis(20));
        assert!(handle.is_alive());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_alive());
        let err = handle.process(FlowEvent::Wakeup).await.unwrap_err();
        assert!(matches!(err, FlowError::WorkerGone));
    }

    #[tokio::test]
    async fn shutdown_drains_queue_first() {
        let (handle, _) = spawn(Duration::from_secs(60));
        let queued = handle.enqueue(start()).await.expect("enqueue");
        handle.shutdown().await;
        let outcome = queued.await.expect("reply").expect("processed");
        assert_eq!(outcome.version, Some(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_alive());
        assert!(outcome.published > 0);
    }
}
