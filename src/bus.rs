//! Event bus contract, inbound/outbound record types, and an in-memory bus.
//!
//! Inbound records are keyed by [`FlowIdentity`]; outbound records carry a
//! topic, an optional destination identity, and a deterministic
//! [`RecordId`]. Buses must deduplicate by `RecordId`: the pipeline
//! publishes with at-least-once semantics (a checkpoint's outbox is
//! republished after a crash), so dedup is what makes the externally
//! visible effect exactly-once.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::checkpoint::{CheckpointSummary, FlowStatus};
use crate::error::BusError;
use crate::external::ExternalOutcome;
use crate::identity::{FlowIdentity, PartyId, SessionId, derived_uuid};

/// Well-known topic names.
pub mod topics {
    /// Events addressed to a flow (self-addressed wakeups).
    pub const FLOW_EVENTS: &str = "flow.event";
    /// Session messages between flows.
    pub const SESSIONS: &str = "flow.session";
    /// Timer scheduling requests.
    pub const TIMERS: &str = "flow.timer";
    /// Flow status change notifications.
    pub const STATUS: &str = "flow.status";
    /// Replies to operator control requests.
    pub const CONTROL_RESPONSES: &str = "flow.control.response";
}

/// Deterministic id of an outbound record, used for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

/// A message exchanged on a session.
///
/// Every variant except `Ack` and `Error` consumes one sequence number in
/// the sender's direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionMessage {
    /// Opens the session. Sent by the initiator as its sequence 0.
    Init {
        /// Sequence number (always 0).
        seq: u64,
        /// Name of the initiating flow; selects the responder flow type.
        protocol: String,
        /// Optional first application payload.
        payload: Option<Value>,
    },
    /// Confirms the session. Sent by the responder as its sequence 0.
    Confirm {
        /// Sequence number (always 0).
        seq: u64,
    },
    /// Application payload.
    Data {
        /// Sequence number.
        seq: u64,
        /// Business payload.
        payload: Value,
    },
    /// Acknowledges receipt of a sequenced message.
    Ack {
        /// The acknowledged sequence number.
        seq: u64,
    },
    /// Errors the session. Out of band, not sequenced.
    Error {
        /// Why the sender errored the session.
        cause: String,
    },
    /// Orderly close, after all earlier messages.
    Close {
        /// Sequence number.
        seq: u64,
    },
}

impl SessionMessage {
    /// The sequence number this message occupies, if it is sequenced.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Init { seq, .. }
            | Self::Confirm { seq }
            | Self::Data { seq, .. }
            | Self::Close { seq } => Some(*seq),
            Self::Ack { .. } | Self::Error { .. } => None,
        }
    }

    /// Whether the receiver must acknowledge this message.
    pub fn requires_ack(&self) -> bool {
        self.seq().is_some()
    }
}

/// A session message in transit between two flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    /// The session this message belongs to.
    pub session: SessionId,
    /// The sending flow.
    pub source: FlowIdentity,
    /// The receiving flow.
    pub destination: FlowIdentity,
    /// The message itself.
    pub message: SessionMessage,
}

/// A request to an external collaborator (crypto, persistence, notary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRequestRecord {
    /// Correlation id the response must carry.
    pub request_id: Uuid,
    /// The flow waiting for the response.
    pub source: FlowIdentity,
    /// Which attempt this is (1-based).
    pub attempt: u32,
    /// Request body.
    pub payload: Value,
}

/// Status change notification for a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatusRecord {
    /// The flow.
    pub identity: FlowIdentity,
    /// Flow type name.
    pub flow_name: String,
    /// New status.
    pub status: FlowStatus,
    /// Checkpoint version that carries this status.
    pub version: u64,
    /// Completion value, for `COMPLETED`.
    pub result: Option<Value>,
    /// Failure description, for `FAILED` and `KILLED`.
    pub error: Option<String>,
    /// When the status changed.
    pub at: DateTime<Utc>,
}

/// Reply to an operator control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlResponse {
    /// Result of an inspection; `None` when the flow has no checkpoint.
    Inspected {
        /// The inspected flow.
        identity: FlowIdentity,
        /// Its checkpoint summary, if any.
        summary: Option<CheckpointSummary>,
    },
    /// Result of a listing.
    Listed {
        /// Party filter that was applied.
        party: Option<PartyId>,
        /// Summaries of matching flows.
        flows: Vec<CheckpointSummary>,
    },
    /// The flow was killed.
    Killed {
        /// The killed flow.
        identity: FlowIdentity,
    },
    /// A failed flow's checkpoint was removed.
    CleanedUp {
        /// The removed flow.
        identity: FlowIdentity,
    },
    /// The request could not be applied.
    Rejected {
        /// The target flow.
        identity: FlowIdentity,
        /// Why.
        reason: String,
    },
}

/// Body of an outbound record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OutboundPayload {
    /// A session message for another flow.
    Session(SessionEnvelope),
    /// A request to an external collaborator.
    ExternalRequest(ExternalRequestRecord),
    /// Ask the timer service to deliver `TimerFired { at }` to the key.
    ScheduleWakeup {
        /// When to fire.
        at: DateTime<Utc>,
    },
    /// Resume the keyed flow unconditionally.
    Wakeup,
    /// A status change notification.
    Status(FlowStatusRecord),
    /// A control reply.
    Control(ControlResponse),
}

/// A record produced by the pipeline for publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    /// Dedup id.
    pub id: RecordId,
    /// Destination topic.
    pub topic: String,
    /// Destination flow, when the record is addressed to one.
    pub key: Option<FlowIdentity>,
    /// Record body.
    pub payload: OutboundPayload,
}

impl OutboundRecord {
    /// Convert a record addressed to a flow into the inbound record that
    /// flow should receive, if it is one.
    ///
    /// Used by in-process wiring (tests, the demo, single-node deployments)
    /// to loop outbound session messages and wakeups back into an engine.
    pub fn as_inbound(&self) -> Option<InboundRecord> {
        match (&self.payload, &self.key) {
            (OutboundPayload::Session(envelope), _) => Some(InboundRecord::Flow {
                identity: envelope.destination.clone(),
                event: FlowEvent::Session(envelope.clone()),
            }),
            (OutboundPayload::Wakeup, Some(identity)) => Some(InboundRecord::Flow {
                identity: identity.clone(),
                event: FlowEvent::Wakeup,
            }),
            _ => None,
        }
    }
}

/// Collects the outbound records of one unit of work, assigning each a
/// deterministic id from `(identity, version, index)`.
#[derive(Debug, Clone)]
pub struct Outbox {
    identity: FlowIdentity,
    version: u64,
    records: Vec<OutboundRecord>,
}

impl Outbox {
    /// Start an empty outbox for the transition into `version`.
    pub fn new(identity: FlowIdentity, version: u64) -> Self {
        Self {
            identity,
            version,
            records: Vec::new(),
        }
    }

    /// Append a record.
    pub fn push(&mut self, topic: &str, key: Option<FlowIdentity>, payload: OutboundPayload) {
        let index = self.records.len() as u64;
        let id = RecordId(derived_uuid("record", &self.identity, self.version, index));
        self.records.push(OutboundRecord {
            id,
            topic: topic.to_owned(),
            key,
            payload,
        });
    }

    /// Append a session message addressed to `destination`.
    pub fn push_session(&mut self, envelope: SessionEnvelope) {
        let key = Some(envelope.destination.clone());
        self.push(topics::SESSIONS, key, OutboundPayload::Session(envelope));
    }

    /// The version these records belong to.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Records collected so far.
    pub fn records(&self) -> &[OutboundRecord] {
        &self.records
    }

    /// Returns `true` if nothing has been pushed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consume the outbox, returning its records.
    pub fn into_records(self) -> Vec<OutboundRecord> {
        self.records
    }
}

/// An event delivered to one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FlowEvent {
    /// Start a new flow of the named type.
    Start {
        /// Registered flow type name.
        flow_name: String,
        /// Start arguments handed to the flow.
        args: Value,
    },
    /// A session message from a peer flow.
    Session(SessionEnvelope),
    /// A response from an external collaborator.
    ExternalResponse {
        /// Correlation id of the request being answered.
        request_id: Uuid,
        /// What the collaborator returned.
        outcome: ExternalOutcome,
    },
    /// Unconditional wakeup.
    Wakeup,
    /// A scheduled timer fired.
    TimerFired {
        /// The instant the timer was scheduled for.
        at: DateTime<Utc>,
    },
    /// Operator: kill the flow.
    Kill {
        /// Reason recorded as the flow's last error.
        reason: String,
    },
    /// Operator: remove a failed flow's checkpoint.
    Cleanup,
    /// Operator: publish the flow's checkpoint summary.
    Inspect,
}

impl FlowEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Session(_) => "session",
            Self::ExternalResponse { .. } => "external_response",
            Self::Wakeup => "wakeup",
            Self::TimerFired { .. } => "timer_fired",
            Self::Kill { .. } => "kill",
            Self::Cleanup => "cleanup",
            Self::Inspect => "inspect",
        }
    }
}

/// A record consumed from the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InboundRecord {
    /// An event for one flow.
    Flow {
        /// Target flow.
        identity: FlowIdentity,
        /// The event.
        event: FlowEvent,
    },
    /// Operator: list flows, optionally for one party.
    ListFlows {
        /// Party filter.
        party: Option<PartyId>,
    },
}

/// Publisher side of the event bus.
///
/// Implementations must be idempotent per [`RecordId`]: publishing a record
/// whose id was already published is a successful no-op.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publish records, in order.
    ///
    /// # Errors
    ///
    /// [`BusError::Unavailable`] for transient transport failures,
    /// [`BusError::Closed`] if the bus was shut down.
    async fn publish(&self, records: &[OutboundRecord]) -> Result<(), BusError>;
}

/// In-memory bus that records everything it accepts.
///
/// Deduplicates by [`RecordId`], can forward accepted records to a
/// subscriber channel, and supports failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
}

#[derive(Debug, Default)]
struct BusState {
    seen: HashSet<RecordId>,
    published: Vec<OutboundRecord>,
    duplicates: usize,
    fail_next: u32,
    fail_always: bool,
    subscriber: Option<mpsc::UnboundedSender<OutboundRecord>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every newly accepted record to the returned receiver.
    ///
    /// Replaces any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OutboundRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscriber = Some(tx);
        rx
    }

    /// All accepted (deduplicated) records, in publish order.
    pub fn published(&self) -> Vec<OutboundRecord> {
        self.lock().published.clone()
    }

    /// Accepted records on one topic.
    pub fn published_on(&self, topic: &str) -> Vec<OutboundRecord> {
        self.lock()
            .published
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Remove and return all accepted records.
    pub fn take_published(&self) -> Vec<OutboundRecord> {
        std::mem::take(&mut self.lock().published)
    }

    /// How many publishes were dropped as duplicates.
    pub fn duplicates(&self) -> usize {
        self.lock().duplicates
    }

    /// Fail the next `n` publish calls with [`BusError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Fail every publish until [`heal`](Self::heal) is called.
    pub fn fail_always(&self) {
        self.lock().fail_always = true;
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.fail_always = false;
        state.fail_next = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, records: &[OutboundRecord]) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.fail_always {
            return Err(BusError::Unavailable("injected failure".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BusError::Unavailable("injected failure".into()));
        }
        for record in records {
            if !state.seen.insert(record.id) {
                state.duplicates += 1;
                continue;
            }
            state.published.push(record.clone());
            if let Some(tx) = &state.subscriber {
                // A dropped receiver only means nobody is listening anymore.
                let _ = tx.send(record.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(party: &str) -> FlowIdentity {
        FlowIdentity::new(party, Uuid::nil())
    }

    #[test]
    fn outbox_ids_are_deterministic() {
        let mut a = Outbox::new(identity("alice"), 3);
        let mut b = Outbox::new(identity("alice"), 3);
        a.push(topics::STATUS, None, OutboundPayload::Wakeup);
        b.push(topics::STATUS, None, OutboundPayload::Wakeup);
        assert_eq!(a.records()[0].id, b.records()[0].id);
    }

    #[test]
    fn outbox_ids_differ_by_index_and_version() {
        let mut a = Outbox::new(identity("alice"), 3);
        a.push(topics::STATUS, None, OutboundPayload::Wakeup);
        a.push(topics::STATUS, None, OutboundPayload::Wakeup);
        let mut b = Outbox::new(identity("alice"), 4);
        b.push(topics::STATUS, None, OutboundPayload::Wakeup);
        assert_ne!(a.records()[0].id, a.records()[1].id);
        assert_ne!(a.records()[0].id, b.records()[0].id);
    }

    #[test]
    fn session_messages_report_sequence() {
        assert_eq!(SessionMessage::Confirm { seq: 0 }.seq(), Some(0));
        assert_eq!(SessionMessage::Ack { seq: 4 }.seq(), None);
        assert!(
            SessionMessage::Data {
                seq: 1,
                payload: Value::Null
            }
            .requires_ack()
        );
        assert!(SessionMessage::Close { seq: 2 }.requires_ack());
        assert!(!SessionMessage::Ack { seq: 2 }.requires_ack());
    }

    #[test]
    fn session_record_converts_to_inbound_for_destination() {
        let envelope = SessionEnvelope {
            session: SessionId(Uuid::nil()),
            source: identity("alice"),
            destination: identity("bob"),
            message: SessionMessage::Ack { seq: 0 },
        };
        let mut outbox = Outbox::new(identity("alice"), 1);
        outbox.push_session(envelope.clone());
        let inbound = outbox.records()[0].as_inbound().expect("addressed to a flow");
        assert_eq!(
            inbound,
            InboundRecord::Flow {
                identity: identity("bob"),
                event: FlowEvent::Session(envelope),
            }
        );
    }

    #[test]
    fn status_record_is_not_routed_to_a_flow() {
        let mut outbox = Outbox::new(identity("alice"), 1);
        outbox.push(topics::CONTROL_RESPONSES, None, OutboundPayload::Control(
            ControlResponse::CleanedUp {
                identity: identity("alice"),
            },
        ));
        assert!(outbox.records()[0].as_inbound().is_none());
    }

    #[tokio::test]
    async fn bus_deduplicates_by_record_id() {
        let bus = InMemoryEventBus::new();
        let mut outbox = Outbox::new(identity("alice"), 1);
        outbox.push(topics::FLOW_EVENTS, Some(identity("alice")), OutboundPayload::Wakeup);
        let records = outbox.into_records();

        bus.publish(&records).await.expect("first publish");
        bus.publish(&records).await.expect("second publish");

        assert_eq!(bus.published().len(), 1);
        assert_eq!(bus.duplicates(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_bounded() {
        let bus = InMemoryEventBus::new();
        bus.fail_next(2);
        assert!(bus.publish(&[]).await.is_err());
        assert!(bus.publish(&[]).await.is_err());
        assert!(bus.publish(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn subscriber_receives_only_new_records() {
        let bus = InMemoryEventBus::new();
        let mut rx = bus.subscribe();
        let mut outbox = Outbox::new(identity("alice"), 1);
        outbox.push(topics::FLOW_EVENTS, Some(identity("alice")), OutboundPayload::Wakeup);
        let records = outbox.into_records();
        bus.publish(&records).await.expect("publish");
        bus.publish(&records).await.expect("republish");

        assert_eq!(rx.recv().await.expect("one record"), records[0]);
        assert!(rx.try_recv().is_err(), "duplicate must not be forwarded");
    }
}
