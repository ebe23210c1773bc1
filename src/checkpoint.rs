//! The durable checkpoint of a flow and its wait conditions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::bus::OutboundRecord;
use crate::external::ExternalEventContext;
use crate::identity::{FlowIdentity, SessionId};
use crate::session::{SessionState, SessionStatus};

/// Lifecycle status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Executing a unit of work.
    Running,
    /// Parked on a wait condition.
    Suspended,
    /// Finished with a result.
    Completed,
    /// Finished with an error. Kept in the store until cleaned up.
    Failed,
    /// Terminated by an operator.
    Killed,
}

impl FlowStatus {
    /// Returns `true` for `Completed`, `Failed`, and `Killed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

/// What a suspended flow is waiting for before it can resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WaitingFor {
    /// The flow exists but has not run its first step.
    FlowStart,
    /// The next in-order message on `session`.
    SessionMessage {
        /// The session being received on.
        session: SessionId,
        /// The sequence number the flow expects next.
        expected_seq: u64,
    },
    /// The response to an external request.
    ExternalEventResponse {
        /// Correlation id of the outstanding request.
        request_id: Uuid,
    },
    /// A timer.
    Timer {
        /// When the flow may resume.
        deadline: DateTime<Utc>,
    },
    /// Any wakeup at all.
    Wakeup,
}

impl WaitingFor {
    /// The variant, without its data.
    pub fn kind(&self) -> WaitingForKind {
        match self {
            Self::FlowStart => WaitingForKind::FlowStart,
            Self::SessionMessage { .. } => WaitingForKind::SessionMessage,
            Self::ExternalEventResponse { .. } => WaitingForKind::ExternalEventResponse,
            Self::Timer { .. } => WaitingForKind::Timer,
            Self::Wakeup => WaitingForKind::Wakeup,
        }
    }
}

/// Discriminant of [`WaitingFor`], used as the dispatcher registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WaitingForKind {
    /// See [`WaitingFor::FlowStart`].
    FlowStart,
    /// See [`WaitingFor::SessionMessage`].
    SessionMessage,
    /// See [`WaitingFor::ExternalEventResponse`].
    ExternalEventResponse,
    /// See [`WaitingFor::Timer`].
    Timer,
    /// See [`WaitingFor::Wakeup`].
    Wakeup,
}

impl WaitingForKind {
    /// Every kind. A dispatcher must have a handler for each.
    pub const ALL: [WaitingForKind; 5] = [
        Self::FlowStart,
        Self::SessionMessage,
        Self::ExternalEventResponse,
        Self::Timer,
        Self::Wakeup,
    ];
}

/// Category of a recorded flow error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowErrorKind {
    /// The flow's own logic failed.
    Business,
    /// An event did not fit the flow's state.
    Protocol,
    /// Flow state could not be restored.
    Deserialization,
    /// An operator killed the flow.
    Killed,
}

/// The error that moved a flow to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowErrorRecord {
    /// Error category.
    pub kind: FlowErrorKind,
    /// Human-readable description.
    pub message: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Durable, versioned snapshot of a flow.
///
/// Versions start at 1 for the first persisted checkpoint and increase by
/// exactly one with every save. `outbox` holds the records produced by the
/// transition into this version; they are (re)published after the save, so
/// the save is the single commit point of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    /// The flow this checkpoint belongs to.
    pub identity: FlowIdentity,
    /// Registered flow type name.
    pub flow_name: String,
    /// Monotonic version; 0 means never persisted.
    pub version: u64,
    /// Lifecycle status.
    pub status: FlowStatus,
    /// Wait condition; `None` only for terminal flows.
    pub waiting_for: Option<WaitingFor>,
    /// Serialized continuation state of the flow logic.
    pub state: Value,
    /// Session bookkeeping, by session id.
    pub sessions: BTreeMap<SessionId, SessionState>,
    /// Number of sessions this flow has opened; seeds session id derivation.
    pub session_counter: u64,
    /// The outstanding external request, if any.
    pub external_event: Option<ExternalEventContext>,
    /// Records produced by the transition into this version.
    pub outbox: Vec<OutboundRecord>,
    /// Terminal error, for `Failed` and `Killed`.
    pub last_error: Option<FlowErrorRecord>,
    /// Completion value, for `Completed`.
    pub result: Option<Value>,
    /// When the flow was created.
    pub created_at: DateTime<Utc>,
    /// When this version was produced.
    pub updated_at: DateTime<Utc>,
}

impl FlowCheckpoint {
    /// A fresh, never-persisted checkpoint waiting for its start event.
    pub fn new(identity: FlowIdentity, flow_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            flow_name: flow_name.into(),
            version: 0,
            status: FlowStatus::Running,
            waiting_for: Some(WaitingFor::FlowStart),
            state: Value::Null,
            sessions: BTreeMap::new(),
            session_counter: 0,
            external_event: None,
            outbox: Vec::new(),
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if the flow has finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Sessions that are neither closed nor errored.
    pub fn open_sessions(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values().filter(|s| s.is_open())
    }

    /// Prepare this checkpoint to become the next version.
    ///
    /// Clears the outbox carried over from the previous version.
    pub(crate) fn advance(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
        self.outbox.clear();
    }

    /// Encode to the JSON bytes stored by the file store.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if `state` contains values that cannot be
    /// written as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Decode from bytes produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns the decoder error for malformed or incompatible input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Operator view of this checkpoint.
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            identity: self.identity.clone(),
            flow_name: self.flow_name.clone(),
            version: self.version,
            status: self.status,
            waiting_for: self.waiting_for.clone(),
            open_sessions: self.open_sessions().count(),
            errored_sessions: self
                .sessions
                .values()
                .filter(|s| s.status == SessionStatus::Errored)
                .count(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Condensed view of a checkpoint for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// The flow.
    pub identity: FlowIdentity,
    /// Flow type name.
    pub flow_name: String,
    /// Checkpoint version.
    pub version: u64,
    /// Lifecycle status.
    pub status: FlowStatus,
    /// Current wait condition.
    pub waiting_for: Option<WaitingFor>,
    /// Number of sessions still open.
    pub open_sessions: usize,
    /// Number of errored sessions.
    pub errored_sessions: usize,
    /// Terminal error, if any.
    pub last_error: Option<FlowErrorRecord>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn checkpoint() -> FlowCheckpoint {
        FlowCheckpoint::new(FlowIdentity::new("alice", Uuid::nil()), "payment", now())
    }

    #[test]
    fn new_checkpoint_waits_for_start_at_version_zero() {
        let cp = checkpoint();
        assert_eq!(cp.version, 0);
        assert_eq!(cp.waiting_for, Some(WaitingFor::FlowStart));
        assert_eq!(cp.status, FlowStatus::Running);
        assert!(!cp.is_terminal());
    }

    #[test]
    fn advance_bumps_version_and_clears_outbox() {
        let mut cp = checkpoint();
        cp.outbox.push(OutboundRecord {
            id: crate::bus::RecordId(Uuid::nil()),
            topic: "t".into(),
            key: None,
            payload: crate::bus::OutboundPayload::Wakeup,
        });
        let later = now() + chrono::Duration::seconds(5);
        cp.advance(later);
        assert_eq!(cp.version, 1);
        assert_eq!(cp.updated_at, later);
        assert!(cp.outbox.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(FlowStatus::Killed.is_terminal());
        assert!(!FlowStatus::Suspended.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
    }

    #[test]
    fn bytes_round_trip() {
        let mut cp = checkpoint();
        cp.state = serde_json::json!({ "step": 2 });
        cp.waiting_for = Some(WaitingFor::Timer { deadline: now() });
        let decoded = FlowCheckpoint::from_bytes(&cp.to_bytes().expect("encode")).expect("decode");
        assert_eq!(decoded, cp);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&FlowStatus::Suspended).expect("serialize");
        assert_eq!(json, "\"SUSPENDED\"");
    }

    #[test]
    fn waiting_for_kind_covers_all_variants() {
        let session = SessionId(Uuid::nil());
        let kinds = [
            WaitingFor::FlowStart.kind(),
            WaitingFor::SessionMessage {
                session,
                expected_seq: 0,
            }
            .kind(),
            WaitingFor::ExternalEventResponse {
                request_id: Uuid::nil(),
            }
            .kind(),
            WaitingFor::Timer { deadline: now() }.kind(),
            WaitingFor::Wakeup.kind(),
        ];
        assert_eq!(kinds, WaitingForKind::ALL);
    }
}
