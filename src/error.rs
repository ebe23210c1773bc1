//! Crate-level error types.
//!
//! The taxonomy follows how the pipeline reacts to each failure:
//!
//! - protocol violations and undecodable checkpoints are fatal for the flow
//!   (it transitions to `FAILED`, no retry);
//! - business-logic failures are a normal terminal result ([`FlowFailure`]);
//! - store and bus outages are transient and retried with backoff without
//!   touching flow state;
//! - external event timeouts are not errors at all here, they are delivered
//!   to the flow as a resume value.

use crate::identity::{FlowIdentity, SessionId};

/// Error returned by a [`CheckpointStore`](crate::CheckpointStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store cannot be reached right now.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    /// Optimistic versioning rejected the save.
    ///
    /// A save must carry exactly the stored version plus one (or version 1
    /// when nothing is stored).
    #[error("version conflict for {identity}: attempted {attempted}, stored {stored}")]
    VersionConflict {
        /// The flow whose checkpoint was being saved.
        identity: FlowIdentity,
        /// The version carried by the rejected checkpoint.
        attempted: u64,
        /// The version currently stored (0 when absent).
        stored: u64,
    },

    /// A checkpoint could not be encoded.
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A checkpoint is stored but its bytes do not decode.
    ///
    /// `version` is the stored version, or 0 if even that cannot be read.
    #[error("checkpoint of {identity} at version {version} is unreadable: {reason}")]
    Corrupt {
        /// The flow whose checkpoint is unreadable.
        identity: FlowIdentity,
        /// The stored version.
        version: u64,
        /// The decoding error.
        reason: String,
    },

    /// Disk I/O failure in a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Error returned by an [`EventBus`](crate::EventBus).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport cannot accept records right now.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),

    /// The bus has been shut down and will never accept records again.
    #[error("event bus closed")]
    Closed,
}

impl BusError {
    /// Returns `true` if retrying the same publish later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Session-level protocol error.
///
/// Raised by the session engine; never fatal for the whole flow on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session with this id belongs to the flow.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// An inbound message skipped further ahead than the reorder window.
    #[error("session {session}: sequence {received} is beyond window (expected {expected})")]
    SequenceGap {
        /// The session that received the message.
        session: SessionId,
        /// The next sequence number the session was expecting.
        expected: u64,
        /// The sequence number actually received.
        received: u64,
    },

    /// The session has been closed.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// The session is in the errored state.
    #[error("session {session} errored: {cause}")]
    Errored {
        /// The errored session.
        session: SessionId,
        /// Why it errored.
        cause: String,
    },
}

/// A business-logic failure returned by a flow step.
///
/// Terminal for the flow: it transitions to `FAILED` and the message is
/// kept as the flow's last error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FlowFailure {
    /// Human-readable failure description.
    pub message: String,
    /// Optional machine-readable code chosen by the flow.
    pub code: Option<String>,
}

impl FlowFailure {
    /// Create a failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attach a machine-readable code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<SessionError> for FlowFailure {
    fn from(err: SessionError) -> Self {
        Self::new(err.to_string())
    }
}

/// Error returned by the pipeline and engine.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The event does not fit the flow's state (e.g. it does not match the
    /// checkpoint's wait condition). Fatal for the flow.
    #[error("protocol violation for {identity}: {reason}")]
    Protocol {
        /// The affected flow.
        identity: FlowIdentity,
        /// What was violated.
        reason: String,
    },

    /// Flow state could not be restored from its checkpoint. Fatal for the flow.
    #[error("cannot restore flow {identity}: {reason}")]
    Deserialization {
        /// The affected flow.
        identity: FlowIdentity,
        /// Decoder error message.
        reason: String,
    },

    /// The engine was assembled incorrectly. Surfaced at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No flow type with this name is registered.
    #[error("unknown flow type: {0}")]
    UnknownFlow(String),

    /// The flow has no checkpoint.
    #[error("flow {0} not found")]
    NotFound(FlowIdentity),

    /// Checkpoint store failure (possibly after retries were exhausted).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Event bus failure (possibly after retries were exhausted).
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The flow's worker exited before replying.
    #[error("flow worker is no longer running")]
    WorkerGone,
}

impl FlowError {
    /// Returns `true` if the failure came from infrastructure and leaves the
    /// flow's logical state untouched.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient() || matches!(e, StoreError::VersionConflict { .. }),
            Self::Bus(e) => e.is_transient(),
            Self::WorkerGone => true,
            _ => false,
        }
    }

    /// Returns `true` if the failure must move the flow to `FAILED`.
    pub fn is_fatal_for_flow(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Deserialization { .. } | Self::UnknownFlow(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn identity() -> FlowIdentity {
        FlowIdentity::new("alice", Uuid::nil())
    }

    #[test]
    fn store_unavailable_is_transient() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(StoreError::from(io).is_transient());
    }

    #[test]
    fn store_conflict_is_not_transient_for_the_store_but_is_for_the_flow() {
        let err = StoreError::VersionConflict {
            identity: identity(),
            attempted: 3,
            stored: 1,
        };
        assert!(!err.is_transient());
        assert!(FlowError::from(err).is_transient());
    }

    #[test]
    fn conflict_display_names_both_versions() {
        let err = StoreError::VersionConflict {
            identity: identity(),
            attempted: 3,
            stored: 1,
        };
        let text = err.to_string();
        assert!(text.contains("attempted 3"), "{text}");
        assert!(text.contains("stored 1"), "{text}");
    }

    #[test]
    fn bus_closed_is_permanent() {
        assert!(!BusError::Closed.is_transient());
        assert!(BusError::Unavailable("broker".into()).is_transient());
    }

    #[test]
    fn protocol_and_deserialization_are_fatal() {
        let protocol = FlowError::Protocol {
            identity: identity(),
            reason: "unexpected event".into(),
        };
        let decode = FlowError::Deserialization {
            identity: identity(),
            reason: "bad json".into(),
        };
        assert!(protocol.is_fatal_for_flow());
        assert!(decode.is_fatal_for_flow());
        assert!(!protocol.is_transient());
        assert!(!FlowError::WorkerGone.is_fatal_for_flow());
    }

    #[test]
    fn session_error_converts_into_flow_failure() {
        let session = SessionId(Uuid::nil());
        let failure = FlowFailure::from(SessionError::Closed(session));
        assert!(failure.message.contains("closed"));
    }

    #[test]
    fn flow_failure_displays_message() {
        let failure = FlowFailure::new("insufficient funds").with_code("E_FUNDS");
        assert_eq!(failure.to_string(), "insufficient funds");
        assert_eq!(failure.code.as_deref(), Some("E_FUNDS"));
    }

    // Errors cross worker channels, so they must be `Send + Sync`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<FlowError>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<BusError>();
            assert_send_sync::<SessionError>();
        }
    };
}
