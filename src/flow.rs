//! Flow trait, suspension requests, resume values, and the flow registry.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::context::FlowContext;
use crate::error::{FlowError, FlowFailure, SessionError};
use crate::external::{ExternalEventRequest, ExternalFailure};
use crate::identity::SessionId;

/// Business logic of one flow type, written as an explicit state machine.
///
/// The implementing type is the flow's continuation state: it is serialized
/// into the checkpoint after every step and deserialized on a cold start.
/// Each call to [`resume`](Flow::resume) runs one step, from one suspension
/// point to the next.
///
/// # Contract
///
/// - `resume` must be deterministic given the same state and input: after a
///   crash a step may be re-run from the last checkpoint.
/// - `resume` must not perform externally visible side effects. Everything
///   leaving the flow goes through the returned [`FlowIORequest`].
/// - The first call receives [`FlowResume::Start`].
///
/// # Examples
///
/// ```
/// use flowfold::{Flow, FlowContext, FlowFailure, FlowResume, FlowStep};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Echo;
///
/// impl Flow for Echo {
///     const NAME: &'static str = "echo";
///
///     fn resume(&mut self, _ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
///         match input {
///             FlowResume::Start { args, .. } => Ok(FlowStep::Complete(args)),
///             other => Err(FlowFailure::new(format!("unexpected {other:?}"))),
///         }
///     }
/// }
/// ```
pub trait Flow: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registered type name, stored in checkpoints and used as the session
    /// protocol name of sessions this flow opens.
    const NAME: &'static str;

    /// Run one step.
    ///
    /// # Errors
    ///
    /// A [`FlowFailure`] ends the flow as `FAILED`.
    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure>;
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep {
    /// Suspend until the request is satisfied.
    Suspend(FlowIORequest),
    /// Finish with a result.
    Complete(Value),
}

/// What a suspending flow asks the pipeline to do.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowIORequest {
    /// Send a payload; resumes with `Wakeup` in the same unit of work.
    Send {
        /// Target session.
        session: SessionId,
        /// Payload.
        payload: Value,
    },
    /// Send a payload, then wait for the next payload on the same session.
    SendAndReceive {
        /// Target session.
        session: SessionId,
        /// Payload.
        payload: Value,
    },
    /// Wait for the next payload on a session.
    Receive {
        /// Source session.
        session: SessionId,
    },
    /// Close a session; resumes with `Wakeup` in the same unit of work.
    CloseSession {
        /// Session to close.
        session: SessionId,
    },
    /// Ask an external collaborator and wait for its answer.
    ExternalEvent(ExternalEventRequest),
    /// Wait for a duration.
    Sleep {
        /// How long.
        duration: Duration,
    },
    /// Persist a checkpoint now and continue right after.
    ForceCheckpoint,
}

impl FlowIORequest {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::SendAndReceive { .. } => "send_and_receive",
            Self::Receive { .. } => "receive",
            Self::CloseSession { .. } => "close_session",
            Self::ExternalEvent(_) => "external_event",
            Self::Sleep { .. } => "sleep",
            Self::ForceCheckpoint => "force_checkpoint",
        }
    }
}

/// The value a flow is resumed with.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowResume {
    /// First step of the flow.
    Start {
        /// Start arguments (`Null` for responder flows).
        args: Value,
        /// The session whose `Init` started this flow, for responders.
        initiated_by: Option<SessionId>,
    },
    /// Plain continuation.
    Wakeup,
    /// The next payload on a session.
    SessionData {
        /// The session.
        session: SessionId,
        /// Sender's sequence number.
        seq: u64,
        /// The payload.
        payload: Value,
    },
    /// A session failed, was closed by the peer, or could not be used.
    SessionError {
        /// The session.
        session: SessionId,
        /// What went wrong.
        error: SessionError,
    },
    /// An external request succeeded.
    ExternalResponse {
        /// Correlation id.
        request_id: Uuid,
        /// Response body.
        value: Value,
    },
    /// An external request failed or timed out.
    ExternalFailure {
        /// Correlation id.
        request_id: Uuid,
        /// What went wrong.
        failure: ExternalFailure,
    },
    /// A `Sleep` finished.
    TimerElapsed,
}

impl FlowResume {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Wakeup => "wakeup",
            Self::SessionData { .. } => "session_data",
            Self::SessionError { .. } => "session_error",
            Self::ExternalResponse { .. } => "external_response",
            Self::ExternalFailure { .. } => "external_failure",
            Self::TimerElapsed => "timer_elapsed",
        }
    }
}

// --- Type erasure ---

/// Object-safe view of a [`Flow`], so fibers of different types share one
/// cache and one pipeline.
pub(crate) trait ErasedFlow: Send + Sync {
    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure>;
    fn snapshot(&self) -> Result<Value, serde_json::Error>;
    fn clone_box(&self) -> Box<dyn ErasedFlow>;
}

impl<F: Flow> ErasedFlow for F {
    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
        Flow::resume(self, ctx, input)
    }

    fn snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn clone_box(&self) -> Box<dyn ErasedFlow> {
        Box::new(self.clone())
    }
}

struct FlowFactory {
    create: fn() -> Box<dyn ErasedFlow>,
    restore: fn(Value) -> Result<Box<dyn ErasedFlow>, serde_json::Error>,
}

fn create<F: Flow>() -> Box<dyn ErasedFlow> {
    Box::new(F::default())
}

fn restore<F: Flow>(state: Value) -> Result<Box<dyn ErasedFlow>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<F>(state)?))
}

/// Maps flow type names to their implementations.
///
/// Also records which responder flow answers sessions opened by each
/// initiating flow type.
///
/// # Examples
///
/// ```ignore
/// let registry = FlowRegistry::new()
///     .register::<Payment>()
///     .register_responder::<PaymentResponder>(Payment::NAME);
/// ```
#[derive(Default)]
pub struct FlowRegistry {
    factories: HashMap<&'static str, FlowFactory>,
    responders: HashMap<String, &'static str>,
}

impl FlowRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow type that can be started with `FlowEvent::Start`.
    pub fn register<F: Flow>(mut self) -> Self {
        self.factories.insert(
            F::NAME,
            FlowFactory {
                create: create::<F>,
                restore: restore::<F>,
            },
        );
        self
    }

    /// Register `F` as the responder for sessions opened by flows named
    /// `initiator`.
    pub fn register_responder<F: Flow>(mut self, initiator: &str) -> Self {
        self = self.register::<F>();
        self.responders.insert(initiator.to_owned(), F::NAME);
        self
    }

    /// The responder flow type for sessions opened by `initiator`.
    pub fn responder_for(&self, initiator: &str) -> Option<&'static str> {
        self.responders.get(initiator).copied()
    }

    /// Returns `true` if a flow type with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered flow type names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Check the registry is usable.
    ///
    /// # Errors
    ///
    /// [`FlowError::Configuration`] if no flow is registered.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.factories.is_empty() {
            return Err(FlowError::Configuration("no flow types registered".into()));
        }
        Ok(())
    }

    pub(crate) fn create(&self, name: &str) -> Result<Box<dyn ErasedFlow>, FlowError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| FlowError::UnknownFlow(name.to_owned()))?;
        Ok((factory.create)())
    }

    pub(crate) fn restore(&self, name: &str, state: Value) -> Result<Box<dyn ErasedFlow>, RestoreError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RestoreError::UnknownFlow(name.to_owned()))?;
        (factory.restore)(state).map_err(RestoreError::Decode)
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.names())
            .field("responders", &self.responders)
            .finish()
    }
}

/// Why a registry could not restore a flow.
#[derive(Debug)]
pub(crate) enum RestoreError {
    UnknownFlow(String),
    Decode(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        count: u32,
    }

    impl Flow for Counter {
        const NAME: &'static str = "counter";

        fn resume(&mut self, _ctx: &mut FlowContext<'_>, _input: FlowResume) -> Result<FlowStep, FlowFailure> {
            self.count += 1;
            Ok(FlowStep::Suspend(FlowIORequest::ForceCheckpoint))
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct CounterResponder;

    impl Flow for CounterResponder {
        const NAME: &'static str = "counter-responder";

        fn resume(&mut self, _ctx: &mut FlowContext<'_>, _input: FlowResume) -> Result<FlowStep, FlowFailure> {
            Ok(FlowStep::Complete(Value::Null))
        }
    }

    #[test]
    fn registry_restores_registered_state() {
        let registry = FlowRegistry::new().register::<Counter>();
        let flow = registry
            .restore("counter", json!({ "count": 4 }))
            .expect("restore");
        assert_eq!(flow.snapshot().expect("snapshot"), json!({ "count": 4 }));
    }

    #[test]
    fn restore_of_bad_state_is_a_decode_error() {
        let registry = FlowRegistry::new().register::<Counter>();
        let err = registry.restore("counter", json!({ "count": "four" }));
        assert!(matches!(err, Err(RestoreError::Decode(_))));
    }

    #[test]
    fn unknown_names_are_reported() {
        let registry = FlowRegistry::new().register::<Counter>();
        assert!(matches!(registry.create("nope"), Err(FlowError::UnknownFlow(name)) if name == "nope"));
        assert!(matches!(
            registry.restore("nope", Value::Null),
            Err(RestoreError::UnknownFlow(_))
        ));
    }

    #[test]
    fn responder_registration_maps_initiator() {
        let registry = FlowRegistry::new()
            .register::<Counter>()
            .register_responder::<CounterResponder>(Counter::NAME);
        assert_eq!(registry.responder_for("counter"), Some("counter-responder"));
        assert!(registry.contains("counter-responder"));
        assert_eq!(registry.names(), vec!["counter", "counter-responder"]);
    }

    #[test]
    fn empty_registry_fails_validation() {
        assert!(matches!(
            FlowRegistry::new().validate(),
            Err(FlowError::Configuration(_))
        ));
    }

    #[test]
    fn erased_clone_is_independent() {
        let registry = FlowRegistry::new().register::<Counter>();
        let original = registry.restore("counter", json!({ "count": 1 })).expect("restore");
        let copy = original.clone_box();
        assert_eq!(copy.snapshot().expect("snapshot"), json!({ "count": 1 }));
    }
}
