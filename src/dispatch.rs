//! Waiting-for dispatcher.
//!
//! Decides, for a suspended flow and a newly arrived event, whether the flow
//! can resume and with what. One handler per [`WaitingForKind`]; the set is
//! validated once when the pipeline is built.
//!
//! Handlers run after the pipeline has applied the event's bookkeeping
//! (session messages, external responses, timers) to the checkpoint, so they
//! decide from the checkpoint first and the raw event second. They never
//! mutate anything.

use std::collections::HashMap;
use std::fmt;

use crate::bus::FlowEvent;
use crate::checkpoint::{FlowCheckpoint, WaitingFor, WaitingForKind};
use crate::error::FlowError;
use crate::external::ExternalResolution;
use crate::flow::FlowResume;

/// Outcome of dispatching an event against a wait condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Resume the flow with this value.
    Resume(FlowResume),
    /// The wait condition is not satisfied yet.
    KeepWaiting,
}

/// Decides whether one kind of wait condition is satisfied.
pub trait WaitingForHandler: Send + Sync + 'static {
    /// The wait condition this handler serves.
    fn kind(&self) -> WaitingForKind;

    /// Decide whether `event` lets the flow in `checkpoint` resume.
    ///
    /// # Errors
    ///
    /// [`FlowError::Protocol`] if the checkpoint and event cannot both be
    /// valid (e.g. the flow waits on a session it does not have).
    fn decide(&self, checkpoint: &FlowCheckpoint, event: &FlowEvent) -> Result<Dispatch, FlowError>;
}

/// Registry of [`WaitingForHandler`]s keyed by wait condition kind.
pub struct WaitingForDispatcher {
    handlers: HashMap<WaitingForKind, Box<dyn WaitingForHandler>>,
}

impl WaitingForDispatcher {
    /// A dispatcher with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A dispatcher with the built-in handler for every kind.
    pub fn standard() -> Self {
        Self::empty()
            .with_handler(FlowStartHandler)
            .with_handler(SessionMessageHandler)
            .with_handler(ExternalEventHandler)
            .with_handler(TimerHandler)
            .with_handler(WakeupHandler)
    }

    /// Register (or replace) the handler for `handler.kind()`.
    pub fn with_handler(mut self, handler: impl WaitingForHandler) -> Self {
        self.handlers.insert(handler.kind(), Box::new(handler));
        self
    }

    /// Check that every wait condition kind has a handler.
    ///
    /// # Errors
    ///
    /// [`FlowError::Configuration`] listing the kinds without a handler.
    pub fn validate(&self) -> Result<(), FlowError> {
        let missing: Vec<_> = WaitingForKind::ALL
            .iter()
            .filter(|kind| !self.handlers.contains_key(*kind))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Configuration(format!(
                "no waiting-for handler registered for {missing:?}"
            )))
        }
    }

    /// Decide whether `event` resumes the flow in `checkpoint`.
    ///
    /// # Errors
    ///
    /// [`FlowError::Protocol`] if the checkpoint has no wait condition or the
    /// handler rejects the combination, [`FlowError::Configuration`] if no
    /// handler is registered for the condition.
    pub fn dispatch(&self, checkpoint: &FlowCheckpoint, event: &FlowEvent) -> Result<Dispatch, FlowError> {
        let Some(waiting_for) = &checkpoint.waiting_for else {
            return Err(FlowError::Protocol {
                identity: checkpoint.identity.clone(),
                reason: format!("no wait condition in status {:?}", checkpoint.status),
            });
        };
        let handler = self.handlers.get(&waiting_for.kind()).ok_or_else(|| {
            FlowError::Configuration(format!("no waiting-for handler for {:?}", waiting_for.kind()))
        })?;
        handler.decide(checkpoint, event)
    }
}

impl Default for WaitingForDispatcher {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for WaitingForDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("WaitingForDispatcher")
            .field("handlers", &kinds)
            .finish()
    }
}

// --- Built-in handlers ---

/// Starts a flow from a `Start` event or, for responders, from a session
/// `Init`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowStartHandler;

impl WaitingForHandler for FlowStartHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::FlowStart
    }

    fn decide(&self, checkpoint: &FlowCheckpoint, event: &FlowEvent) -> Result<Dispatch, FlowError> {
        match event {
            FlowEvent::Start { args, .. } => Ok(Dispatch::Resume(FlowResume::Start {
                args: args.clone(),
                initiated_by: None,
            })),
            FlowEvent::Session(envelope) => Ok(Dispatch::Resume(FlowResume::Start {
                args: serde_json::Value::Null,
                initiated_by: Some(envelope.session),
            })),
            other => Err(FlowError::Protocol {
                identity: checkpoint.identity.clone(),
                reason: format!("{} event cannot start a flow", other.kind()),
            }),
        }
    }
}

/// Resumes with the next in-order payload, or with the session's error once
/// it can no longer deliver one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionMessageHandler;

impl WaitingForHandler for SessionMessageHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::SessionMessage
    }

    fn decide(&self, checkpoint: &FlowCheckpoint, _event: &FlowEvent) -> Result<Dispatch, FlowError> {
        let Some(WaitingFor::SessionMessage { session, .. }) = &checkpoint.waiting_for else {
            return Ok(Dispatch::KeepWaiting);
        };
        let state = checkpoint.sessions.get(session).ok_or_else(|| FlowError::Protocol {
            identity: checkpoint.identity.clone(),
            reason: format!("waiting on unknown session {session}"),
        })?;
        if let Some(front) = state.inbox.front() {
            return Ok(Dispatch::Resume(FlowResume::SessionData {
                session: *session,
                seq: front.seq,
                payload: front.payload.clone(),
            }));
        }
        Ok(match state.receive_error() {
            Some(error) => Dispatch::Resume(FlowResume::SessionError {
                session: *session,
                error,
            }),
            None => Dispatch::KeepWaiting,
        })
    }
}

/// Resumes once the outstanding external request is resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalEventHandler;

impl WaitingForHandler for ExternalEventHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::ExternalEventResponse
    }

    fn decide(&self, checkpoint: &FlowCheckpoint, _event: &FlowEvent) -> Result<Dispatch, FlowError> {
        let Some(WaitingFor::ExternalEventResponse { request_id }) = &checkpoint.waiting_for else {
            return Ok(Dispatch::KeepWaiting);
        };
        let ctx = checkpoint
            .external_event
            .as_ref()
            .filter(|ctx| ctx.request_id == *request_id)
            .ok_or_else(|| FlowError::Protocol {
                identity: checkpoint.identity.clone(),
                reason: format!("waiting on unknown external request {request_id}"),
            })?;
        Ok(match &ctx.resolution {
            Some(ExternalResolution::Response(value)) => Dispatch::Resume(FlowResume::ExternalResponse {
                request_id: *request_id,
                value: value.clone(),
            }),
            Some(ExternalResolution::Failed(failure)) => Dispatch::Resume(FlowResume::ExternalFailure {
                request_id: *request_id,
                failure: failure.clone(),
            }),
            None => Dispatch::KeepWaiting,
        })
    }
}

/// Resumes when a timer fires at or after the deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerHandler;

impl WaitingForHandler for TimerHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::Timer
    }

    fn decide(&self, checkpoint: &FlowCheckpoint, event: &FlowEvent) -> Result<Dispatch, FlowError> {
        let Some(WaitingFor::Timer { deadline }) = &checkpoint.waiting_for else {
            return Ok(Dispatch::KeepWaiting);
        };
        Ok(match event {
            FlowEvent::TimerFired { at } if at >= deadline => Dispatch::Resume(FlowResume::TimerElapsed),
            _ => Dispatch::KeepWaiting,
        })
    }
}

/// Always resumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeupHandler;

impl WaitingForHandler for WakeupHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::Wakeup
    }

    fn decide(&self, _checkpoint: &FlowCheckpoint, _event: &FlowEvent) -> Result<Dispatch, FlowError> {
        Ok(Dispatch::Resume(FlowResume::Wakeup))
    }
}
