//! Flow pipeline: the transactional orchestrator.
//!
//! For every inbound event the pipeline obtains the flow's fiber (cache hit,
//! cold load from the checkpoint store, or a fresh start), applies the
//! event's session and external-event bookkeeping, consults the
//! waiting-for dispatcher, runs the fiber, and turns the result into one
//! [`Transition`]. The transition is computed without any I/O, then
//! committed write-ahead:
//!
//! 1. save the new checkpoint, whose `outbox` carries every record the
//!    transition produced;
//! 2. update the fiber cache (terminal fibers are evicted);
//! 3. publish the outbox (the bus deduplicates by record id);
//! 4. delete the checkpoint of a `COMPLETED` or `KILLED` flow.
//!
//! A crash between 1 and 3 is repaired by republishing the stored outbox on
//! the next cold load or on [`FlowPipeline::recover`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::bus::{
    ControlResponse, EventBus, FlowEvent, FlowStatusRecord, OutboundPayload, OutboundRecord, Outbox, RecordId,
    SessionEnvelope, SessionMessage, topics,
};
use crate::cache::FiberCache;
use crate::checkpoint::{CheckpointSummary, FlowCheckpoint, FlowErrorKind, FlowErrorRecord, FlowStatus, WaitingFor};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::Services;
use crate::dispatch::{Dispatch, WaitingForDispatcher};
use crate::error::{FlowError, SessionError, StoreError};
use crate::external::{ExternalEventManager, ResponseAction};
use crate::fiber::{FiberYield, FlowFiber};
use crate::flow::{FlowIORequest, FlowRegistry, FlowResume};
use crate::identity::{FlowIdentity, PartyId, SessionId, derived_uuid};
use crate::retry::retry_transient;
use crate::session::SessionManager;
use crate::store::CheckpointStore;

// --- Transition model ---

/// What the pipeline found for a flow before applying an event.
#[derive(Debug, Clone)]
pub enum Resident {
    /// No checkpoint exists and none was ever deleted.
    Absent,
    /// The flow finished and its checkpoint was deleted; only the tombstone
    /// with its last version remains.
    Finished {
        /// Version of the deleted checkpoint.
        version: u64,
    },
    /// A non-terminal flow with a working fiber.
    Live(FlowFiber),
    /// A finished flow whose checkpoint is still stored.
    Terminal(FlowCheckpoint),
    /// A non-terminal checkpoint whose state cannot be restored, or a stored
    /// checkpoint whose bytes do not decode at all.
    Unrestorable {
        /// The stored checkpoint, or a placeholder carrying only the stored
        /// version if it does not decode.
        checkpoint: FlowCheckpoint,
        /// Why restoring failed.
        reason: String,
    },
}

impl Resident {
    /// The checkpoint behind this resident, if any.
    pub fn checkpoint(&self) -> Option<&FlowCheckpoint> {
        match self {
            Self::Absent | Self::Finished { .. } => None,
            Self::Live(fiber) => Some(fiber.checkpoint()),
            Self::Terminal(checkpoint) | Self::Unrestorable { checkpoint, .. } => Some(checkpoint),
        }
    }
}

/// How an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The flow ran and suspended on a new wait condition.
    Suspended,
    /// The wait condition still holds, but session or external-request
    /// bookkeeping changed and was persisted.
    Updated,
    /// Nothing to do; nothing persisted.
    Ignored,
    /// The flow finished with a result.
    Completed,
    /// The flow failed.
    Failed,
    /// The flow was killed.
    Killed,
    /// A failed flow's checkpoint was removed.
    CleanedUp,
    /// A checkpoint summary was published.
    Inspected,
    /// The request could not be applied; a rejection was published.
    Rejected,
}

#[derive(Debug, Clone)]
enum Next {
    Unchanged,
    Fiber(FlowFiber),
    Checkpoint(FlowCheckpoint),
}

/// The outcome of applying one event, before anything is persisted.
///
/// Produced by [`FlowPipeline::transition`], which performs no I/O: the same
/// resident, event, and instant always yield an equal checkpoint with an
/// equal outbox. Control replies are not persisted and each gets a fresh
/// record id, so a repeated control request is answered again.
#[derive(Debug, Clone)]
pub struct Transition {
    disposition: Disposition,
    next: Next,
    ephemeral: Vec<OutboundRecord>,
    delete: bool,
}

impl Transition {
    fn unchanged(disposition: Disposition) -> Self {
        Self {
            disposition,
            next: Next::Unchanged,
            ephemeral: Vec::new(),
            delete: false,
        }
    }

    fn reply(disposition: Disposition, response: ControlResponse) -> Self {
        Self {
            ephemeral: vec![control_record(response)],
            ..Self::unchanged(disposition)
        }
    }

    fn live(disposition: Disposition, mut fiber: FlowFiber, out: Outbox) -> Self {
        fiber.checkpoint_mut().outbox = out.into_records();
        Self {
            next: Next::Fiber(fiber),
            ..Self::unchanged(disposition)
        }
    }

    fn finished(disposition: Disposition, mut checkpoint: FlowCheckpoint, out: Outbox, delete: bool) -> Self {
        checkpoint.outbox = out.into_records();
        Self {
            next: Next::Checkpoint(checkpoint),
            delete,
            ..Self::unchanged(disposition)
        }
    }

    /// How the event was handled.
    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// The checkpoint version to persist, if the event produced one.
    pub fn checkpoint(&self) -> Option<&FlowCheckpoint> {
        match &self.next {
            Next::Unchanged => None,
            Next::Fiber(fiber) => Some(fiber.checkpoint()),
            Next::Checkpoint(checkpoint) => Some(checkpoint),
        }
    }

    /// Every record the commit will publish: the checkpoint outbox first,
    /// then replies that are not persisted.
    pub fn records(&self) -> impl Iterator<Item = &OutboundRecord> {
        self.checkpoint()
            .map(|cp| cp.outbox.iter())
            .into_iter()
            .flatten()
            .chain(self.ephemeral.iter())
    }

    /// Returns `true` if the commit deletes the checkpoint.
    pub fn deletes_checkpoint(&self) -> bool {
        self.delete
    }
}

/// Result of [`FlowPipeline::process`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// The flow the event was addressed to.
    pub identity: FlowIdentity,
    /// How the event was handled.
    pub disposition: Disposition,
    /// Version persisted by this event, if any.
    pub version: Option<u64>,
    /// Flow status after this event, if a checkpoint was written.
    pub status: Option<FlowStatus>,
    /// Number of records published.
    pub published: usize,
}

/// Result of [`FlowPipeline::recover`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Checkpoints inspected.
    pub checkpoints: usize,
    /// Outbox records republished.
    pub republished: usize,
    /// Leftover `COMPLETED`/`KILLED` checkpoints deleted.
    pub deleted: usize,
    /// Wakeups the caller should arm, for flows waiting on time.
    pub wakeups: Vec<(FlowIdentity, DateTime<Utc>)>,
}

fn control_record(response: ControlResponse) -> OutboundRecord {
    OutboundRecord {
        id: RecordId(Uuid::new_v4()),
        topic: topics::CONTROL_RESPONSES.to_owned(),
        key: None,
        payload: OutboundPayload::Control(response),
    }
}

/// Acknowledge a sequenced message addressed to a finished flow so its
/// sender stops resending it.
fn reack_finished(identity: &FlowIdentity, version: u64, envelope: &SessionEnvelope) -> Transition {
    let Some(seq) = envelope.message.seq() else {
        return Transition::unchanged(Disposition::Ignored);
    };
    let scope = format!("finished-ack/{}", envelope.session);
    let record = OutboundRecord {
        id: RecordId(derived_uuid(&scope, identity, version, seq)),
        topic: topics::SESSIONS.to_owned(),
        key: Some(envelope.source.clone()),
        payload: OutboundPayload::Session(SessionEnvelope {
            session: envelope.session,
            source: identity.clone(),
            destination: envelope.source.clone(),
            message: SessionMessage::Ack { seq },
        }),
    };
    Transition {
        ephemeral: vec![record],
        ..Transition::unchanged(Disposition::Ignored)
    }
}

/// Stand-in for a stored checkpoint whose bytes do not decode.
fn unreadable(identity: &FlowIdentity, version: u64, now: DateTime<Utc>) -> FlowCheckpoint {
    let mut checkpoint = FlowCheckpoint::new(identity.clone(), UNREADABLE_FLOW, now);
    checkpoint.version = version;
    checkpoint.status = FlowStatus::Suspended;
    checkpoint.waiting_for = None;
    checkpoint
}

/// Flow name reported for checkpoints that do not decode.
const UNREADABLE_FLOW: &str = "<unreadable>";

fn reject(identity: &FlowIdentity, reason: impl Into<String>) -> Transition {
    let reason = reason.into();
    debug!(flow = %identity, %reason, "control request rejected");
    Transition::reply(
        Disposition::Rejected,
        ControlResponse::Rejected {
            identity: identity.clone(),
            reason,
        },
    )
}

fn error_kind(err: &FlowError) -> FlowErrorKind {
    match err {
        FlowError::Deserialization { .. } | FlowError::UnknownFlow(_) => FlowErrorKind::Deserialization,
        _ => FlowErrorKind::Protocol,
    }
}

/// `now + duration`, saturating at the largest representable instant.
fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// --- Pipeline ---

/// The flow pipeline.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Callers must
/// not process two events for the same [`FlowIdentity`] concurrently (the
/// engine's per-identity workers guarantee this). Concurrent writers in other
/// processes are detected by optimistic versioning.
pub struct FlowPipeline {
    registry: FlowRegistry,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    services: Services,
    dispatcher: WaitingForDispatcher,
    cache: FiberCache,
    sessions: SessionManager,
    external: ExternalEventManager,
    config: EngineConfig,
}

impl FlowPipeline {
    /// Start building a pipeline for the flows in `registry`.
    pub fn builder(registry: FlowRegistry) -> FlowPipelineBuilder {
        FlowPipelineBuilder::new(registry)
    }

    /// The fiber cache.
    pub fn cache(&self) -> &FiberCache {
        &self.cache
    }

    /// The configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The flow registry.
    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Current time according to the pipeline's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Build the resident for a checkpoint loaded from storage.
    pub fn resident(&self, checkpoint: Option<FlowCheckpoint>) -> Resident {
        let Some(checkpoint) = checkpoint else {
            return Resident::Absent;
        };
        if checkpoint.is_terminal() {
            return Resident::Terminal(checkpoint);
        }
        match FlowFiber::restore(&checkpoint, &self.registry) {
            Ok(fiber) => Resident::Live(fiber),
            Err(err) => {
                error!(flow = %checkpoint.identity, error = %err, "checkpoint cannot be restored");
                Resident::Unrestorable {
                    checkpoint,
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Apply `event` to `resident` without performing any I/O.
    ///
    /// # Arguments
    ///
    /// * `resident` - The flow as found in the cache or store.
    /// * `identity` - The flow the event is addressed to.
    /// * `event` - The inbound event.
    /// * `now` - Time of this unit of work.
    ///
    /// # Returns
    ///
    /// The transition to commit. Protocol violations and unrestorable state
    /// are not errors here: they yield a `Failed` transition.
    ///
    /// # Errors
    ///
    /// [`FlowError::UnknownFlow`] if a start event names an unregistered
    /// flow type; [`FlowError::Configuration`] if the dispatcher lacks a
    /// handler.
    pub fn transition(
        &self,
        resident: Resident,
        identity: &FlowIdentity,
        event: &FlowEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, FlowError> {
        match (resident, event) {
            (resident, FlowEvent::Inspect) => Ok(Transition::reply(
                Disposition::Inspected,
                ControlResponse::Inspected {
                    identity: identity.clone(),
                    summary: resident.checkpoint().map(FlowCheckpoint::summary),
                },
            )),
            (Resident::Finished { version }, FlowEvent::Session(envelope)) => {
                debug!(flow = %identity, session = %envelope.session, version, "session message for finished flow");
                Ok(reack_finished(identity, version, envelope))
            }
            (Resident::Finished { .. }, FlowEvent::Kill { .. } | FlowEvent::Cleanup) => {
                Ok(reject(identity, "flow already finished"))
            }
            (Resident::Finished { version }, other) => {
                debug!(flow = %identity, version, event = other.kind(), "event for finished flow ignored");
                Ok(Transition::unchanged(Disposition::Ignored))
            }
            (Resident::Absent, FlowEvent::Start { flow_name, .. }) => {
                let fiber = FlowFiber::create(&self.registry, identity.clone(), flow_name, now)?;
                info!(flow = %identity, flow_name = %flow_name, "flow started");
                self.advance(fiber, event, now)
            }
            (Resident::Absent, FlowEvent::Session(envelope)) => self.start_responder(identity, envelope, event, now),
            (Resident::Absent, FlowEvent::Kill { .. } | FlowEvent::Cleanup) => Ok(reject(identity, "no such flow")),
            (Resident::Absent, other) => {
                debug!(flow = %identity, event = other.kind(), "event for absent flow ignored");
                Ok(Transition::unchanged(Disposition::Ignored))
            }
            (Resident::Live(fiber), FlowEvent::Kill { reason }) => Ok(self.kill(fiber.into_checkpoint(), reason, now)),
            (Resident::Unrestorable { checkpoint, .. }, FlowEvent::Kill { reason }) => {
                Ok(self.kill(checkpoint, reason, now))
            }
            (Resident::Terminal(checkpoint), FlowEvent::Kill { .. }) => Ok(reject(
                identity,
                format!("flow is already {:?}", checkpoint.status),
            )),
            (Resident::Terminal(checkpoint), FlowEvent::Cleanup) if checkpoint.status == FlowStatus::Failed => {
                info!(flow = %identity, "failed flow cleaned up");
                Ok(Transition {
                    delete: true,
                    ..Transition::reply(
                        Disposition::CleanedUp,
                        ControlResponse::CleanedUp {
                            identity: identity.clone(),
                        },
                    )
                })
            }
            (_, FlowEvent::Cleanup) => Ok(reject(identity, "only FAILED flows can be cleaned up")),
            (Resident::Terminal(checkpoint), other) => {
                debug!(
                    flow = %identity,
                    status = ?checkpoint.status,
                    event = other.kind(),
                    "event for finished flow ignored"
                );
                Ok(Transition::unchanged(Disposition::Ignored))
            }
            (Resident::Live(_), FlowEvent::Start { .. }) => {
                warn!(flow = %identity, "duplicate start ignored");
                Ok(Transition::unchanged(Disposition::Ignored))
            }
            (Resident::Unrestorable { mut checkpoint, reason }, _) => {
                let out = begin(&mut checkpoint, now);
                Ok(self.fail(checkpoint, out, FlowErrorKind::Deserialization, reason, now))
            }
            (Resident::Live(fiber), _) => self.advance(fiber, event, now),
        }
    }

    fn start_responder(
        &self,
        identity: &FlowIdentity,
        envelope: &SessionEnvelope,
        event: &FlowEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, FlowError> {
        let SessionMessage::Init { protocol, .. } = &envelope.message else {
            debug!(flow = %identity, session = %envelope.session, "session message for absent flow ignored");
            return Ok(Transition::unchanged(Disposition::Ignored));
        };
        let Some(flow_name) = self.registry.responder_for(protocol) else {
            warn!(flow = %identity, %protocol, "no responder registered, session rejected");
            let record = OutboundRecord {
                id: RecordId(derived_uuid("rejected-session", identity, 0, 0)),
                topic: topics::SESSIONS.to_owned(),
                key: Some(envelope.source.clone()),
                payload: OutboundPayload::Session(SessionEnvelope {
                    session: envelope.session,
                    source: identity.clone(),
                    destination: envelope.source.clone(),
                    message: SessionMessage::Error {
                        cause: format!("no responder for protocol {protocol}"),
                    },
                }),
            };
            return Ok(Transition {
                ephemeral: vec![record],
                ..Transition::unchanged(Disposition::Rejected)
            });
        };
        let fiber = FlowFiber::create(&self.registry, identity.clone(), flow_name, now)?;
        info!(flow = %identity, flow_name, session = %envelope.session, "responder flow started");
        self.advance(fiber, event, now)
    }

    /// Apply bookkeeping, dispatch, and run the fiber if the wait condition
    /// is satisfied.
    fn advance(&self, mut fiber: FlowFiber, event: &FlowEvent, now: DateTime<Utc>) -> Result<Transition, FlowError> {
        let mut out = begin(fiber.checkpoint_mut(), now);
        let changed = self.apply_bookkeeping(fiber.checkpoint_mut(), event, now, &mut out);
        match self.dispatcher.dispatch(fiber.checkpoint(), event) {
            Ok(Dispatch::Resume(input)) => self.run(fiber, input, out, now),
            Ok(Dispatch::KeepWaiting) if changed => {
                self.park(fiber.checkpoint_mut(), &mut out, now);
                Ok(Transition::live(Disposition::Updated, fiber, out))
            }
            Ok(Dispatch::KeepWaiting) => Ok(Transition::unchanged(Disposition::Ignored)),
            Err(err) if err.is_fatal_for_flow() => {
                let kind = error_kind(&err);
                Ok(self.fail(fiber.into_checkpoint(), out, kind, err.to_string(), now))
            }
            Err(err) => Err(err),
        }
    }

    /// Apply an event's protocol effects to the checkpoint.
    ///
    /// # Returns
    ///
    /// `true` if anything changed that must be persisted.
    fn apply_bookkeeping(
        &self,
        checkpoint: &mut FlowCheckpoint,
        event: &FlowEvent,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> bool {
        let identity = checkpoint.identity.clone();
        match event {
            FlowEvent::Session(envelope) => {
                let outcome = if checkpoint.waiting_for == Some(WaitingFor::FlowStart) {
                    self.sessions
                        .accept(&mut checkpoint.sessions, &identity, envelope, now, out)
                } else {
                    self.sessions
                        .receive(&mut checkpoint.sessions, &identity, envelope, out)
                };
                debug!(flow = %identity, session = %envelope.session, ?outcome, "session message applied");
                outcome.changed_state()
            }
            FlowEvent::ExternalResponse { request_id, outcome } => match checkpoint.external_event.as_mut() {
                Some(ctx) => {
                    self.external
                        .on_response(ctx, &identity, *request_id, outcome.clone(), now, out)
                        != ResponseAction::Ignored
                }
                None => {
                    warn!(flow = %identity, %request_id, "external response without outstanding request dropped");
                    false
                }
            },
            FlowEvent::TimerFired { at } => {
                let timed_out = checkpoint
                    .external_event
                    .as_mut()
                    .is_some_and(|ctx| self.external.on_timer(ctx, &identity, *at));
                let resent = self
                    .sessions
                    .resend_due(&mut checkpoint.sessions, &identity, now, out);
                timed_out || resent > 0
            }
            FlowEvent::Wakeup => {
                self.sessions
                    .resend_due(&mut checkpoint.sessions, &identity, now, out)
                    > 0
            }
            FlowEvent::Start { .. } | FlowEvent::Kill { .. } | FlowEvent::Cleanup | FlowEvent::Inspect => false,
        }
    }

    /// Resume the fiber, serving requests that need no external event
    /// inline, until it parks or terminates.
    fn run(
        &self,
        mut fiber: FlowFiber,
        mut input: FlowResume,
        mut out: Outbox,
        now: DateTime<Utc>,
    ) -> Result<Transition, FlowError> {
        let identity = fiber.identity().clone();
        let mut inline = 0;
        loop {
            consume(fiber.checkpoint_mut(), &input);
            let step = match fiber.resume(input, now, &self.services, &self.sessions) {
                Ok(step) => step,
                Err(err) if err.is_fatal_for_flow() => {
                    let kind = error_kind(&err);
                    return Ok(self.fail(fiber.into_checkpoint(), out, kind, err.to_string(), now));
                }
                Err(err) => return Err(err),
            };
            let request = match step {
                FiberYield::Suspended(request) => request,
                FiberYield::Completed(value) => return Ok(self.complete(fiber.into_checkpoint(), out, value, now)),
                FiberYield::Failed(failure) => {
                    return Ok(self.fail(
                        fiber.into_checkpoint(),
                        out,
                        FlowErrorKind::Business,
                        failure.message,
                        now,
                    ));
                }
            };
            debug!(flow = %identity, request = request.kind(), "flow yielded");
            match self.suspend(fiber.checkpoint_mut(), request, &mut out, now) {
                Ok(Some(next)) if inline < self.config.max_inline_resumes => {
                    inline += 1;
                    input = next;
                }
                Ok(Some(_)) => {
                    debug!(flow = %identity, inline, "inline resume budget spent, forcing checkpoint");
                    out.push(topics::FLOW_EVENTS, Some(identity.clone()), OutboundPayload::Wakeup);
                    break;
                }
                Ok(None) => break,
                Err(err) if err.is_fatal_for_flow() => {
                    let kind = error_kind(&err);
                    return Ok(self.fail(fiber.into_checkpoint(), out, kind, err.to_string(), now));
                }
                Err(err) => return Err(err),
            }
        }
        self.park(fiber.checkpoint_mut(), &mut out, now);
        Ok(Transition::live(Disposition::Suspended, fiber, out))
    }

    /// Serve a suspension request.
    ///
    /// # Returns
    ///
    /// The value to resume with right away, or `None` if the flow must wait
    /// for an event.
    fn suspend(
        &self,
        checkpoint: &mut FlowCheckpoint,
        request: FlowIORequest,
        out: &mut Outbox,
        now: DateTime<Utc>,
    ) -> Result<Option<FlowResume>, FlowError> {
        match request {
            FlowIORequest::Send { session, payload } => {
                checkpoint.waiting_for = Some(WaitingFor::Wakeup);
                Ok(Some(match self.send(checkpoint, session, payload, now, out) {
                    Ok(()) => FlowResume::Wakeup,
                    Err(error) => FlowResume::SessionError { session, error },
                }))
            }
            FlowIORequest::SendAndReceive { session, payload } => {
                match self.send(checkpoint, session, payload, now, out) {
                    Ok(()) => self.receive(checkpoint, session, now, out),
                    Err(error) => {
                        checkpoint.waiting_for = Some(WaitingFor::Wakeup);
                        Ok(Some(FlowResume::SessionError { session, error }))
                    }
                }
            }
            FlowIORequest::Receive { session } => self.receive(checkpoint, session, now, out),
            FlowIORequest::CloseSession { session } => {
                checkpoint.waiting_for = Some(WaitingFor::Wakeup);
                let closed = match checkpoint.sessions.get_mut(&session) {
                    Some(state) => self.sessions.close(state, &checkpoint.identity, now, out),
                    None => Err(SessionError::UnknownSession(session)),
                };
                Ok(Some(match closed {
                    Ok(()) => FlowResume::Wakeup,
                    Err(error) => FlowResume::SessionError { session, error },
                }))
            }
            FlowIORequest::ExternalEvent(request) => {
                let request_id = derived_uuid("request", &checkpoint.identity, checkpoint.version, 0);
                let ctx = self
                    .external
                    .submit(&checkpoint.identity, request, request_id, now, out);
                checkpoint.external_event = Some(ctx);
                checkpoint.waiting_for = Some(WaitingFor::ExternalEventResponse { request_id });
                Ok(None)
            }
            FlowIORequest::Sleep { duration } => {
                let deadline = after(now, duration);
                checkpoint.waiting_for = Some(WaitingFor::Timer { deadline });
                out.push(
                    topics::TIMERS,
                    Some(checkpoint.identity.clone()),
                    OutboundPayload::ScheduleWakeup { at: deadline },
                );
                Ok(None)
            }
            FlowIORequest::ForceCheckpoint => {
                checkpoint.waiting_for = Some(WaitingFor::Wakeup);
                out.push(
                    topics::FLOW_EVENTS,
                    Some(checkpoint.identity.clone()),
                    OutboundPayload::Wakeup,
                );
                Ok(None)
            }
        }
    }

    fn send(
        &self,
        checkpoint: &mut FlowCheckpoint,
        session: SessionId,
        payload: Value,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Result<(), SessionError> {
        let state = checkpoint
            .sessions
            .get_mut(&session)
            .ok_or(SessionError::UnknownSession(session))?;
        self.sessions
            .send(state, &checkpoint.identity, payload, now, out)
            .map(|_| ())
    }

    /// Wait on `session`, resuming at once if it can already deliver.
    fn receive(
        &self,
        checkpoint: &mut FlowCheckpoint,
        session: SessionId,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Result<Option<FlowResume>, FlowError> {
        let Some(state) = checkpoint.sessions.get_mut(&session) else {
            checkpoint.waiting_for = Some(WaitingFor::Wakeup);
            return Ok(Some(FlowResume::SessionError {
                session,
                error: SessionError::UnknownSession(session),
            }));
        };
        self.sessions
            .ensure_initiated(state, &checkpoint.identity, now, out);
        let expected_seq = state.next_data_seq();
        checkpoint.waiting_for = Some(WaitingFor::SessionMessage { session, expected_seq });
        match self.dispatcher.dispatch(checkpoint, &FlowEvent::Wakeup)? {
            Dispatch::Resume(next) => Ok(Some(next)),
            Dispatch::KeepWaiting => Ok(None),
        }
    }

    /// Finalize a non-terminal checkpoint.
    fn park(&self, checkpoint: &mut FlowCheckpoint, out: &mut Outbox, now: DateTime<Utc>) {
        checkpoint.status = FlowStatus::Suspended;
        if let Some(WaitingFor::SessionMessage { session, expected_seq }) = checkpoint.waiting_for.as_mut()
            && let Some(state) = checkpoint.sessions.get(&*session)
        {
            *expected_seq = state.next_data_seq();
        }
        let sent_sequenced = out.records().iter().any(|record| {
            matches!(&record.payload, OutboundPayload::Session(envelope) if envelope.message.requires_ack())
        });
        if sent_sequenced {
            out.push(
                topics::TIMERS,
                Some(checkpoint.identity.clone()),
                OutboundPayload::ScheduleWakeup {
                    at: after(now, self.sessions.config().resend_after),
                },
            );
        }
    }

    fn complete(&self, mut checkpoint: FlowCheckpoint, mut out: Outbox, value: Value, now: DateTime<Utc>) -> Transition {
        let identity = checkpoint.identity.clone();
        self.sessions
            .close_all(&mut checkpoint.sessions, &identity, now, &mut out);
        checkpoint.status = FlowStatus::Completed;
        checkpoint.waiting_for = None;
        checkpoint.external_event = None;
        checkpoint.result = Some(value);
        push_status(&checkpoint, &mut out, now);
        info!(flow = %identity, version = checkpoint.version, "flow completed");
        Transition::finished(Disposition::Completed, checkpoint, out, true)
    }

    fn fail(
        &self,
        mut checkpoint: FlowCheckpoint,
        mut out: Outbox,
        kind: FlowErrorKind,
        message: String,
        now: DateTime<Utc>,
    ) -> Transition {
        let identity = checkpoint.identity.clone();
        self.sessions
            .error_all(&mut checkpoint.sessions, &identity, &message, &mut out);
        checkpoint.status = FlowStatus::Failed;
        checkpoint.waiting_for = None;
        checkpoint.external_event = None;
        error!(flow = %identity, version = checkpoint.version, ?kind, %message, "flow failed");
        checkpoint.last_error = Some(FlowErrorRecord { kind, message, at: now });
        push_status(&checkpoint, &mut out, now);
        Transition::finished(Disposition::Failed, checkpoint, out, false)
    }

    fn kill(&self, mut checkpoint: FlowCheckpoint, reason: &str, now: DateTime<Utc>) -> Transition {
        let identity = checkpoint.identity.clone();
        let mut out = begin(&mut checkpoint, now);
        self.sessions
            .error_all(&mut checkpoint.sessions, &identity, reason, &mut out);
        checkpoint.status = FlowStatus::Killed;
        checkpoint.waiting_for = None;
        checkpoint.external_event = None;
        checkpoint.last_error = Some(FlowErrorRecord {
            kind: FlowErrorKind::Killed,
            message: reason.to_owned(),
            at: now,
        });
        push_status(&checkpoint, &mut out, now);
        out.push(
            topics::CONTROL_RESPONSES,
            None,
            OutboundPayload::Control(ControlResponse::Killed {
                identity: identity.clone(),
            }),
        );
        warn!(flow = %identity, %reason, "flow killed");
        Transition::finished(Disposition::Killed, checkpoint, out, true)
    }

    // --- I/O ---

    /// Process one inbound event for `identity` as a single unit of work.
    ///
    /// Version conflicts evict the cached fiber and reprocess the event from
    /// a fresh load, up to `max_conflict_retries` times. Transient store and
    /// bus failures are retried with backoff; the flow's stored state is
    /// never changed by a failed attempt.
    ///
    /// # Errors
    ///
    /// Store and bus errors once retries are spent, and the errors of
    /// [`transition`](Self::transition).
    pub async fn process(&self, identity: &FlowIdentity, event: FlowEvent) -> Result<ProcessOutcome, FlowError> {
        let span = info_span!("process_event", flow = %identity, event = event.kind());
        async {
            let mut conflicts = 0;
            loop {
                let resident = self.obtain(identity).await?;
                let transition = self.transition(resident, identity, &event, self.clock.now())?;
                match self.commit(identity, transition).await {
                    Err(FlowError::Store(StoreError::VersionConflict { attempted, stored, .. }))
                        if conflicts < self.config.max_conflict_retries =>
                    {
                        conflicts += 1;
                        warn!(attempted, stored, conflicts, "version conflict, reprocessing from store");
                    }
                    result => return result,
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Get the flow's resident from the cache, or cold-load it.
    ///
    /// A cold load republishes the stored outbox and finishes the deletion
    /// of a `COMPLETED` or `KILLED` checkpoint left behind by a crash.
    async fn obtain(&self, identity: &FlowIdentity) -> Result<Resident, FlowError> {
        if let Some(fiber) = self.cache.get(identity) {
            return Ok(Resident::Live(fiber));
        }
        let loaded = match retry_transient(&self.config.retry, "load checkpoint", || self.store.load(identity)).await {
            Err(StoreError::Corrupt { version, reason, .. }) => {
                error!(version, %reason, "checkpoint does not decode");
                return Ok(Resident::Unrestorable {
                    checkpoint: unreadable(identity, version, self.clock.now()),
                    reason,
                });
            }
            loaded => loaded?,
        };
        let Some(checkpoint) = loaded else {
            let tombstone =
                retry_transient(&self.config.retry, "read tombstone", || self.store.tombstone(identity)).await?;
            return Ok(match tombstone {
                Some(version) => Resident::Finished { version },
                None => Resident::Absent,
            });
        };
        debug!(version = checkpoint.version, status = ?checkpoint.status, "checkpoint loaded");
        self.publish(identity, &checkpoint.outbox).await?;
        if matches!(checkpoint.status, FlowStatus::Completed | FlowStatus::Killed) {
            self.delete(identity).await?;
        }
        Ok(self.resident(Some(checkpoint)))
    }

    async fn commit(&self, identity: &FlowIdentity, transition: Transition) -> Result<ProcessOutcome, FlowError> {
        let Transition {
            disposition,
            next,
            ephemeral,
            delete,
        } = transition;
        let mut outcome = ProcessOutcome {
            identity: identity.clone(),
            disposition,
            version: None,
            status: None,
            published: 0,
        };
        match next {
            Next::Unchanged => {}
            Next::Fiber(fiber) => {
                self.save(identity, fiber.checkpoint()).await?;
                let records = fiber.checkpoint().outbox.clone();
                outcome.version = Some(fiber.checkpoint().version);
                outcome.status = Some(fiber.checkpoint().status);
                self.cache.put(identity.clone(), fiber);
                self.publish(identity, &records).await?;
                outcome.published += records.len();
            }
            Next::Checkpoint(checkpoint) => {
                self.save(identity, &checkpoint).await?;
                self.cache.remove(identity);
                outcome.version = Some(checkpoint.version);
                outcome.status = Some(checkpoint.status);
                self.publish(identity, &checkpoint.outbox).await?;
                outcome.published += checkpoint.outbox.len();
            }
        }
        if delete {
            self.cache.remove(identity);
            self.delete(identity).await?;
        }
        self.publish(identity, &ephemeral).await?;
        outcome.published += ephemeral.len();
        Ok(outcome)
    }

    async fn save(&self, identity: &FlowIdentity, checkpoint: &FlowCheckpoint) -> Result<(), FlowError> {
        match retry_transient(&self.config.retry, "save checkpoint", || self.store.save(checkpoint)).await {
            Ok(()) => {
                debug!(version = checkpoint.version, status = ?checkpoint.status, "checkpoint saved");
                Ok(())
            }
            Err(err) => {
                self.cache.remove(identity);
                Err(err.into())
            }
        }
    }

    async fn publish(&self, identity: &FlowIdentity, records: &[OutboundRecord]) -> Result<(), FlowError> {
        if records.is_empty() {
            return Ok(());
        }
        match retry_transient(&self.config.retry, "publish records", || self.bus.publish(records)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.cache.remove(identity);
                Err(err.into())
            }
        }
    }

    async fn delete(&self, identity: &FlowIdentity) -> Result<(), FlowError> {
        retry_transient(&self.config.retry, "delete checkpoint", || self.store.delete(identity)).await?;
        debug!(flow = %identity, "checkpoint deleted");
        Ok(())
    }

    // --- Queries and maintenance ---

    /// Status and last error of a flow, read from the store.
    ///
    /// # Returns
    ///
    /// `None` if the flow has no checkpoint (never started, completed, or
    /// killed). A checkpoint that does not decode is reported as `FAILED`
    /// with a deserialization error; the next event addressed to the flow
    /// persists that.
    ///
    /// # Errors
    ///
    /// Store errors once retries are spent.
    pub async fn status(&self, identity: &FlowIdentity) -> Result<Option<CheckpointSummary>, FlowError> {
        match retry_transient(&self.config.retry, "load checkpoint", || self.store.load(identity)).await {
            Ok(loaded) => Ok(loaded.as_ref().map(FlowCheckpoint::summary)),
            Err(StoreError::Corrupt { version, reason, .. }) => {
                let now = self.clock.now();
                let mut checkpoint = unreadable(identity, version, now);
                checkpoint.status = FlowStatus::Failed;
                checkpoint.last_error = Some(FlowErrorRecord {
                    kind: FlowErrorKind::Deserialization,
                    message: reason,
                    at: now,
                });
                Ok(Some(checkpoint.summary()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Summaries of stored flows, optionally for one party.
    ///
    /// # Errors
    ///
    /// Store errors once retries are spent.
    pub async fn list(&self, party: Option<&PartyId>) -> Result<Vec<CheckpointSummary>, FlowError> {
        let checkpoints = retry_transient(&self.config.retry, "list checkpoints", || self.store.list(party)).await?;
        Ok(checkpoints.iter().map(FlowCheckpoint::summary).collect())
    }

    /// Answer a `ListFlows` control request by publishing the listing on the
    /// control-response topic.
    ///
    /// # Errors
    ///
    /// Store and bus errors once retries are spent.
    pub async fn list_flows(&self, party: Option<PartyId>) -> Result<Vec<CheckpointSummary>, FlowError> {
        let flows = self.list(party.as_ref()).await?;
        let records = [control_record(ControlResponse::Listed {
            party,
            flows: flows.clone(),
        })];
        retry_transient(&self.config.retry, "publish listing", || self.bus.publish(&records)).await?;
        Ok(flows)
    }

    /// Evict every cached fiber owned by one of `parties`.
    pub fn evict_parties<'a>(&self, parties: impl IntoIterator<Item = &'a PartyId>) -> usize {
        self.cache.remove_parties(parties)
    }

    /// Crash recovery.
    ///
    /// Republishes the outbox of every stored checkpoint, deletes leftover
    /// `COMPLETED`/`KILLED` checkpoints, and reports the wakeups needed by
    /// flows waiting on a timer, an external request deadline, a forced
    /// checkpoint, or an unacknowledged session message.
    ///
    /// # Errors
    ///
    /// Store and bus errors once retries are spent.
    pub async fn recover(&self) -> Result<RecoveryReport, FlowError> {
        let span = info_span!("recover");
        async {
            let checkpoints =
                retry_transient(&self.config.retry, "list checkpoints", || self.store.list(None)).await?;
            let now = self.clock.now();
            let mut report = RecoveryReport::default();
            for checkpoint in checkpoints {
                let identity = &checkpoint.identity;
                report.checkpoints += 1;
                self.publish(identity, &checkpoint.outbox).await?;
                report.republished += checkpoint.outbox.len();
                match checkpoint.status {
                    FlowStatus::Completed | FlowStatus::Killed => {
                        self.cache.remove(identity);
                        self.delete(identity).await?;
                        report.deleted += 1;
                        continue;
                    }
                    FlowStatus::Failed => continue,
                    FlowStatus::Running | FlowStatus::Suspended => {}
                }
                match &checkpoint.waiting_for {
                    Some(WaitingFor::Timer { deadline }) => report.wakeups.push((identity.clone(), *deadline)),
                    Some(WaitingFor::ExternalEventResponse { .. }) => {
                        if let Some(ctx) = checkpoint.external_event.as_ref().filter(|ctx| !ctx.is_resolved()) {
                            report.wakeups.push((identity.clone(), ctx.deadline()));
                        }
                    }
                    Some(WaitingFor::Wakeup) => report.wakeups.push((identity.clone(), now)),
                    _ => {}
                }
                let oldest_unacked = checkpoint
                    .open_sessions()
                    .flat_map(|s| s.unacked.values())
                    .map(|pending| pending.sent_at)
                    .min();
                if let Some(sent_at) = oldest_unacked {
                    report
                        .wakeups
                        .push((identity.clone(), after(sent_at, self.sessions.config().resend_after)));
                }
            }
            info!(
                checkpoints = report.checkpoints,
                republished = report.republished,
                deleted = report.deleted,
                wakeups = report.wakeups.len(),
                "recovery finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for FlowPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowPipeline")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Start the next checkpoint version and its outbox.
fn begin(checkpoint: &mut FlowCheckpoint, now: DateTime<Utc>) -> Outbox {
    checkpoint.advance(now);
    Outbox::new(checkpoint.identity.clone(), checkpoint.version)
}

/// Remove what the flow is about to be handed from the checkpoint.
fn consume(checkpoint: &mut FlowCheckpoint, input: &FlowResume) {
    match input {
        FlowResume::SessionData { session, .. } => {
            if let Some(state) = checkpoint.sessions.get_mut(session) {
                state.take_message();
            }
        }
        FlowResume::ExternalResponse { .. } | FlowResume::ExternalFailure { .. } => {
            checkpoint.external_event = None;
        }
        _ => {}
    }
}

fn push_status(checkpoint: &FlowCheckpoint, out: &mut Outbox, now: DateTime<Utc>) {
    out.push(
        topics::STATUS,
        Some(checkpoint.identity.clone()),
        OutboundPayload::Status(FlowStatusRecord {
            identity: checkpoint.identity.clone(),
            flow_name: checkpoint.flow_name.clone(),
            status: checkpoint.status,
            version: checkpoint.version,
            result: checkpoint.result.clone(),
            error: checkpoint.last_error.as_ref().map(|e| e.message.clone()),
            at: now,
        }),
    );
}

// --- Builder ---

/// Builder for [`FlowPipeline`].
///
/// A checkpoint store and an event bus are required; everything else has a
/// default.
///
/// # Examples
///
/// ```ignore
/// let pipeline = FlowPipeline::builder(registry)
///     .store(Arc::new(InMemoryCheckpointStore::new()))
///     .bus(Arc::new(InMemoryEventBus::new()))
///     .build()?;
/// ```
pub struct FlowPipelineBuilder {
    registry: FlowRegistry,
    store: Option<Arc<dyn CheckpointStore>>,
    bus: Option<Arc<dyn EventBus>>,
    clock: Arc<dyn Clock>,
    services: Services,
    dispatcher: WaitingForDispatcher,
    config: EngineConfig,
}

impl FlowPipelineBuilder {
    /// Create a builder for the flows in `registry`.
    pub fn new(registry: FlowRegistry) -> Self {
        Self {
            registry,
            store: None,
            bus: None,
            clock: Arc::new(SystemClock),
            services: Services::new(),
            dispatcher: WaitingForDispatcher::standard(),
            config: EngineConfig::default(),
        }
    }

    /// Set the checkpoint store.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn store<S: CheckpointStore>(mut self, store: Arc<S>) -> Self {
        let store: Arc<dyn CheckpointStore> = store;
        self.store = Some(store);
        self
    }

    /// Set the event bus records are published to.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn bus<B: EventBus>(mut self, bus: Arc<B>) -> Self {
        let bus: Arc<dyn EventBus> = bus;
        self.bus = Some(bus);
        self
    }

    /// Set the clock. Defaults to [`SystemClock`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Set the services available to flows through their context.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    /// Replace the waiting-for dispatcher. Defaults to
    /// [`WaitingForDispatcher::standard`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn dispatcher(mut self, dispatcher: WaitingForDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the configuration.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the assembly and build the pipeline.
    ///
    /// # Errors
    ///
    /// [`FlowError::Configuration`] if the store or bus is missing, no flow
    /// type is registered, a wait condition has no dispatcher handler, or
    /// the session reorder window is 0.
    pub fn build(self) -> Result<FlowPipeline, FlowError> {
        self.registry.validate()?;
        self.dispatcher.validate()?;
        if self.config.session.reorder_window == 0 {
            return Err(FlowError::Configuration("session reorder_window must be at least 1".into()));
        }
        let store = self
            .store
            .ok_or_else(|| FlowError::Configuration("no checkpoint store configured".into()))?;
        let bus = self
            .bus
            .ok_or_else(|| FlowError::Configuration("no event bus configured".into()))?;
        Ok(FlowPipeline {
            cache: FiberCache::new(self.config.cache.clone()),
            sessions: SessionManager::new(self.config.session.clone()),
            external: ExternalEventManager::new(self.config.external.clone()),
            registry: self.registry,
            store,
            bus,
            clock: self.clock,
            services: self.services,
            dispatcher: self.dispatcher,
            config: self.config,
        })
    }
}

impl std::fmt::Debug for FlowPipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowPipelineBuilder")
            .field("registry", &self.registry)
            .field("has_store", &self.store.is_some())
            .field("has_bus", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}
