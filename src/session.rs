//! Session protocol engine.
//!
//! A session is an ordered, bidirectional channel between two flows owned by
//! different parties. Each side keeps a [`SessionState`] inside its own
//! checkpoint; the [`SessionManager`] applies the protocol rules to that
//! state and emits the resulting session messages into an [`Outbox`].
//!
//! Sequence numbers are kept per direction and start at 0. The initiator's
//! `Init` is its sequence 0, the responder's `Confirm` is its sequence 0.
//! Every sequenced message is acknowledged by the receiver; messages that
//! arrive ahead of the next expected number are buffered up to the configured
//! reorder window and delivered once the gap closes.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{Outbox, SessionEnvelope, SessionMessage};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::identity::{FlowIdentity, PartyId, SessionId};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Opened locally, not yet confirmed by the responder.
    Initiating,
    /// Both sides know about the session.
    Confirmed,
    /// Errored by either side. Terminal for the session.
    Errored,
    /// Closed by either side. Terminal for the session.
    Closed,
}

/// Which side of the session this state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// This flow opened the session.
    Initiator,
    /// This flow was started by the session's `Init`.
    Responder,
}

/// An in-order application payload waiting to be consumed by the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    /// Sender's sequence number.
    pub seq: u64,
    /// The payload.
    pub payload: Value,
}

/// An outbound message that has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnackedMessage {
    /// The message as originally sent.
    pub message: SessionMessage,
    /// When it was last (re)sent.
    pub sent_at: DateTime<Utc>,
}

/// Protocol state of one session, owned by one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session id, shared by both ends.
    pub id: SessionId,
    /// Which end this is.
    pub role: SessionRole,
    /// The other party.
    pub counterparty: PartyId,
    /// The flow at the other end.
    pub peer: FlowIdentity,
    /// Name of the initiating flow type.
    pub protocol: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Sequence number of the next outbound sequenced message.
    pub next_send_seq: u64,
    /// Sequence number of the next inbound message to apply.
    pub next_receive_seq: u64,
    /// Inbound messages that arrived ahead of `next_receive_seq`.
    pub reorder_buffer: BTreeMap<u64, SessionMessage>,
    /// In-order payloads not yet handed to the flow.
    pub inbox: VecDeque<ReceivedMessage>,
    /// Outbound sequenced messages awaiting acknowledgement, by sequence.
    pub unacked: BTreeMap<u64, UnackedMessage>,
    /// Why the session errored, if it did.
    pub error: Option<String>,
    /// The peer has been told about the error (or told us).
    pub error_notified: bool,
    /// The peer closed the session.
    pub closed_by_peer: bool,
}

impl SessionState {
    /// Returns `true` while the session can carry messages.
    pub fn is_open(&self) -> bool {
        matches!(self.status, SessionStatus::Initiating | SessionStatus::Confirmed)
    }

    /// Sequence number of the next payload the flow will see.
    ///
    /// For an initiator still waiting for `Confirm`, that is 1: the
    /// responder's sequence 0 is the `Confirm` itself.
    pub fn next_data_seq(&self) -> u64 {
        if let Some(front) = self.inbox.front() {
            return front.seq;
        }
        if self.role == SessionRole::Initiator && self.next_receive_seq == 0 {
            1
        } else {
            self.next_receive_seq
        }
    }

    /// Remove and return the next in-order payload.
    pub fn take_message(&mut self) -> Option<ReceivedMessage> {
        self.inbox.pop_front()
    }

    /// The error a flow receiving on this session should see, if any.
    ///
    /// `None` while the session can still deliver a payload.
    pub fn receive_error(&self) -> Option<SessionError> {
        if !self.inbox.is_empty() {
            return None;
        }
        match self.status {
            SessionStatus::Errored => Some(SessionError::Errored {
                session: self.id,
                cause: self.error.clone().unwrap_or_default(),
            }),
            SessionStatus::Closed if self.closed_by_peer => Some(SessionError::Closed(self.id)),
            _ => None,
        }
    }

    fn ensure_sendable(&self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Initiating | SessionStatus::Confirmed => Ok(()),
            SessionStatus::Closed => Err(SessionError::Closed(self.id)),
            SessionStatus::Errored => Err(SessionError::Errored {
                session: self.id,
                cause: self.error.clone().unwrap_or_default(),
            }),
        }
    }

    fn not_yet_initiated(&self) -> bool {
        self.role == SessionRole::Initiator && self.next_send_seq == 0
    }
}

/// What happened to an inbound session message.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// Applied in order, together with `count - 1` buffered successors.
    Delivered {
        /// Number of messages applied.
        count: usize,
    },
    /// Ahead of the expected sequence; held in the reorder buffer.
    Buffered,
    /// Already seen; acknowledged again and otherwise ignored.
    Duplicate,
    /// An acknowledgement for one of our messages.
    Acked,
    /// The peer errored the session.
    PeerError,
    /// Not applicable to any open session; ignored.
    Dropped {
        /// Why.
        reason: String,
    },
    /// Broke the protocol; the session is now errored.
    Violation(SessionError),
}

impl ReceiveOutcome {
    /// Returns `true` if the session state or the outbox may have changed.
    pub fn changed_state(&self) -> bool {
        !matches!(self, Self::Dropped { .. })
    }
}

/// Applies session protocol rules to [`SessionState`]s.
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    config: SessionConfig,
}

impl SessionManager {
    /// Create a manager with the given tuning.
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// The tuning in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a new session from `owner` to `counterparty`.
    ///
    /// The session starts `INITIATING`. Nothing is sent until the first
    /// send or receive on it.
    ///
    /// # Arguments
    ///
    /// * `sessions` - The owning checkpoint's session table.
    /// * `owner` - The opening flow.
    /// * `counter` - The checkpoint's session counter; incremented.
    /// * `counterparty` - The party to talk to.
    /// * `protocol` - The opening flow's type name.
    ///
    /// # Returns
    ///
    /// The new session's id, derived from `owner` and the counter.
    pub fn open(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        owner: &FlowIdentity,
        counter: &mut u64,
        counterparty: PartyId,
        protocol: &str,
    ) -> SessionId {
        let id = SessionId::derive(owner, *counter);
        *counter += 1;
        let peer = FlowIdentity::responder(&counterparty, &id);
        sessions.insert(
            id,
            SessionState {
                id,
                role: SessionRole::Initiator,
                counterparty,
                peer,
                protocol: protocol.to_owned(),
                status: SessionStatus::Initiating,
                next_send_seq: 0,
                next_receive_seq: 0,
                reorder_buffer: BTreeMap::new(),
                inbox: VecDeque::new(),
                unacked: BTreeMap::new(),
                error: None,
                error_notified: false,
                closed_by_peer: false,
            },
        );
        debug!(flow = %owner, session = %id, "session opened");
        id
    }

    /// Accept an inbound `Init`, creating the responder side of the session.
    ///
    /// Sends `Confirm` (sequence 0) and then applies the `Init` like any other
    /// inbound message, so its payload (if any) lands in the inbox and it is
    /// acknowledged. A repeated `Init` for a known session is treated as a
    /// duplicate.
    pub fn accept(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        owner: &FlowIdentity,
        envelope: &SessionEnvelope,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> ReceiveOutcome {
        let SessionMessage::Init { protocol, .. } = &envelope.message else {
            return ReceiveOutcome::Dropped {
                reason: "only Init can open a session".into(),
            };
        };
        if !sessions.contains_key(&envelope.session) {
            let mut state = SessionState {
                id: envelope.session,
                role: SessionRole::Responder,
                counterparty: envelope.source.party.clone(),
                peer: envelope.source.clone(),
                protocol: protocol.clone(),
                status: SessionStatus::Confirmed,
                next_send_seq: 0,
                next_receive_seq: 0,
                reorder_buffer: BTreeMap::new(),
                inbox: VecDeque::new(),
                unacked: BTreeMap::new(),
                error: None,
                error_notified: false,
                closed_by_peer: false,
            };
            Self::emit(&mut state, owner, SessionMessage::Confirm { seq: 0 }, now, out);
            sessions.insert(envelope.session, state);
            debug!(flow = %owner, session = %envelope.session, "session accepted");
        }
        self.receive(sessions, owner, envelope, out)
    }

    /// Send an application payload.
    ///
    /// On an initiator session that has not sent anything yet, the payload
    /// travels inside the `Init`.
    ///
    /// # Returns
    ///
    /// The sequence number the payload was sent with.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] or [`SessionError::Errored`] if the session
    /// can no longer carry messages.
    pub fn send(
        &self,
        state: &mut SessionState,
        owner: &FlowIdentity,
        payload: Value,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Result<u64, SessionError> {
        state.ensure_sendable()?;
        let seq = state.next_send_seq;
        let message = if state.not_yet_initiated() {
            SessionMessage::Init {
                seq,
                protocol: state.protocol.clone(),
                payload: Some(payload),
            }
        } else {
            SessionMessage::Data { seq, payload }
        };
        Self::emit(state, owner, message, now, out);
        Ok(seq)
    }

    /// Make sure the peer knows the session exists before waiting on it.
    ///
    /// Sends a payload-less `Init` if this is an initiator session that has
    /// not sent anything yet; otherwise does nothing.
    pub fn ensure_initiated(
        &self,
        state: &mut SessionState,
        owner: &FlowIdentity,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) {
        if state.not_yet_initiated() && state.is_open() {
            let message = SessionMessage::Init {
                seq: 0,
                protocol: state.protocol.clone(),
                payload: None,
            };
            Self::emit(state, owner, message, now, out);
        }
    }

    /// Close the session in order, after everything sent so far.
    ///
    /// Closing a session that was never initiated just marks it closed.
    /// Closing an already closed session is a no-op.
    ///
    /// # Errors
    ///
    /// [`SessionError::Errored`] if the session has errored.
    pub fn close(
        &self,
        state: &mut SessionState,
        owner: &FlowIdentity,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Result<(), SessionError> {
        match state.status {
            SessionStatus::Closed => return Ok(()),
            SessionStatus::Errored => {
                return Err(SessionError::Errored {
                    session: state.id,
                    cause: state.error.clone().unwrap_or_default(),
                });
            }
            SessionStatus::Initiating | SessionStatus::Confirmed => {}
        }
        if !state.not_yet_initiated() {
            let seq = state.next_send_seq;
            Self::emit(state, owner, SessionMessage::Close { seq }, now, out);
        }
        state.status = SessionStatus::Closed;
        debug!(flow = %owner, session = %state.id, "session closed");
        Ok(())
    }

    /// Error the session.
    ///
    /// Moves it to `ERRORED` and notifies the peer exactly once. The owning
    /// flow is resumed with the error the next time it waits on the session.
    ///
    /// # Returns
    ///
    /// `false` if the session was already closed or errored.
    pub fn error(
        &self,
        state: &mut SessionState,
        owner: &FlowIdentity,
        cause: impl Into<String>,
        out: &mut Outbox,
    ) -> bool {
        if !state.is_open() {
            return false;
        }
        let cause = cause.into();
        state.status = SessionStatus::Errored;
        state.reorder_buffer.clear();
        if !state.error_notified && !state.not_yet_initiated() {
            out.push_session(SessionEnvelope {
                session: state.id,
                source: owner.clone(),
                destination: state.peer.clone(),
                message: SessionMessage::Error {
                    cause: cause.clone(),
                },
            });
        }
        state.error_notified = true;
        state.error = Some(cause);
        true
    }

    /// Apply an inbound session message addressed to `owner`.
    pub fn receive(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        owner: &FlowIdentity,
        envelope: &SessionEnvelope,
        out: &mut Outbox,
    ) -> ReceiveOutcome {
        let Some(state) = sessions.get_mut(&envelope.session) else {
            warn!(flow = %owner, session = %envelope.session, "message for unknown session dropped");
            return ReceiveOutcome::Dropped {
                reason: format!("unknown session {}", envelope.session),
            };
        };
        if envelope.source != state.peer {
            warn!(
                flow = %owner,
                session = %state.id,
                source = %envelope.source,
                "message from unexpected sender dropped"
            );
            return ReceiveOutcome::Dropped {
                reason: format!("unexpected sender {}", envelope.source),
            };
        }

        let seq = match &envelope.message {
            SessionMessage::Ack { seq } => {
                state.unacked.remove(seq);
                return ReceiveOutcome::Acked;
            }
            SessionMessage::Error { cause } => {
                if !state.is_open() {
                    return ReceiveOutcome::Dropped {
                        reason: "session already terminated".into(),
                    };
                }
                warn!(flow = %owner, session = %state.id, %cause, "session errored by peer");
                state.status = SessionStatus::Errored;
                state.reorder_buffer.clear();
                state.error = Some(cause.clone());
                state.error_notified = true;
                return ReceiveOutcome::PeerError;
            }
            other => match other.seq() {
                Some(seq) => seq,
                None => {
                    return ReceiveOutcome::Dropped {
                        reason: "unsequenced message".into(),
                    };
                }
            },
        };

        if !state.is_open() {
            warn!(
                flow = %owner,
                session = %state.id,
                seq,
                status = ?state.status,
                "message for terminated session dropped"
            );
            return ReceiveOutcome::Dropped {
                reason: format!("session {} is {:?}", state.id, state.status),
            };
        }

        if seq < state.next_receive_seq || state.reorder_buffer.contains_key(&seq) {
            debug!(flow = %owner, session = %state.id, seq, "duplicate re-acknowledged");
            Self::ack(state, owner, seq, out);
            return ReceiveOutcome::Duplicate;
        }

        if seq >= state.next_receive_seq.saturating_add(self.config.reorder_window) {
            let violation = SessionError::SequenceGap {
                session: state.id,
                expected: state.next_receive_seq,
                received: seq,
            };
            warn!(flow = %owner, error = %violation, "session protocol violation");
            self.error(state, owner, violation.to_string(), out);
            return ReceiveOutcome::Violation(violation);
        }

        Self::ack(state, owner, seq, out);
        if seq > state.next_receive_seq {
            state.reorder_buffer.insert(seq, envelope.message.clone());
            return ReceiveOutcome::Buffered;
        }

        Self::apply(state, envelope.message.clone());
        let mut count = 1;
        while state.is_open() {
            let Some(next) = state.reorder_buffer.remove(&state.next_receive_seq) else {
                break;
            };
            Self::apply(state, next);
            count += 1;
        }
        ReceiveOutcome::Delivered { count }
    }

    /// Resend every unacknowledged message on open sessions that was last
    /// sent at least `resend_after` ago.
    ///
    /// # Returns
    ///
    /// How many messages were resent.
    pub fn resend_due(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        owner: &FlowIdentity,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> usize {
        let Ok(resend_after) = chrono::Duration::from_std(self.config.resend_after) else {
            return 0;
        };
        let mut resent = 0;
        for state in sessions.values_mut().filter(|s| s.is_open()) {
            for pending in state.unacked.values_mut() {
                match pending.sent_at.checked_add_signed(resend_after) {
                    Some(due) if due <= now => {}
                    _ => continue,
                }
                out.push_session(SessionEnvelope {
                    session: state.id,
                    source: owner.clone(),
                    destination: state.peer.clone(),
                    message: pending.message.clone(),
                });
                pending.sent_at = now;
                resent += 1;
            }
        }
        if resent > 0 {
            debug!(flow = %owner, resent, "unacknowledged session messages resent");
        }
        resent
    }

    /// Error every open session, e.g. because the flow failed.
    pub fn error_all(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        owner: &FlowIdentity,
        cause: &str,
        out: &mut Outbox,
    ) {
        for state in sessions.values_mut() {
            self.error(state, owner, cause, out);
        }
    }

    /// Close every open session, e.g. because the flow completed.
    pub fn close_all(
        &self,
        sessions: &mut BTreeMap<SessionId, SessionState>,
        owner: &FlowIdentity,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) {
        for state in sessions.values_mut().filter(|s| s.is_open()) {
            // Open sessions always close cleanly.
            let _ = self.close(state, owner, now, out);
        }
    }

    fn emit(
        state: &mut SessionState,
        owner: &FlowIdentity,
        message: SessionMessage,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) {
        state.next_send_seq += 1;
        if let Some(seq) = message.seq() {
            state.unacked.insert(
                seq,
                UnackedMessage {
                    message: message.clone(),
                    sent_at: now,
                },
            );
        }
        out.push_session(SessionEnvelope {
            session: state.id,
            source: owner.clone(),
            destination: state.peer.clone(),
            message,
        });
    }

    fn ack(state: &SessionState, owner: &FlowIdentity, seq: u64, out: &mut Outbox) {
        out.push_session(SessionEnvelope {
            session: state.id,
            source: owner.clone(),
            destination: state.peer.clone(),
            message: SessionMessage::Ack { seq },
        });
    }

    fn apply(state: &mut SessionState, message: SessionMessage) {
        match message {
            SessionMessage::Init {
                seq,
                payload: Some(payload),
                ..
            }
            | SessionMessage::Data { seq, payload } => {
                state.inbox.push_back(ReceivedMessage { seq, payload });
            }
            SessionMessage::Init { payload: None, .. } => {}
            SessionMessage::Confirm { .. } => {
                if state.status == SessionStatus::Initiating {
                    state.status = SessionStatus::Confirmed;
                }
            }
            SessionMessage::Close { .. } => {
                state.status = SessionStatus::Closed;
                state.closed_by_peer = true;
                state.reorder_buffer.clear();
            }
            SessionMessage::Ack { .. } | SessionMessage::Error { .. } => return,
        }
        state.next_receive_seq += 1;
    }
}
