//! The flow fiber: a checkpoint plus the live flow logic it restores to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::checkpoint::{FlowCheckpoint, FlowStatus, WaitingFor};
use crate::context::{FlowContext, Services};
use crate::error::{FlowError, FlowFailure};
use crate::flow::{ErasedFlow, FlowIORequest, FlowRegistry, FlowResume, FlowStep, RestoreError};
use crate::identity::FlowIdentity;
use crate::session::SessionManager;

/// What a fiber yielded after one step.
#[derive(Debug, Clone, PartialEq)]
pub enum FiberYield {
    /// The flow suspended with a request.
    Suspended(FlowIORequest),
    /// The flow finished.
    Completed(Value),
    /// The flow's logic failed.
    Failed(FlowFailure),
}

/// A suspendable flow instance.
///
/// Owns the flow's [`FlowCheckpoint`] and the deserialized flow logic. The
/// checkpoint's `state` field is kept in sync with the logic after every
/// step, so the checkpoint alone is always enough to rebuild the fiber.
pub struct FlowFiber {
    checkpoint: FlowCheckpoint,
    logic: Box<dyn ErasedFlow>,
}

impl FlowFiber {
    /// Create the fiber of a brand-new flow.
    ///
    /// # Errors
    ///
    /// [`FlowError::UnknownFlow`] if `flow_name` is not registered.
    pub fn create(
        registry: &FlowRegistry,
        identity: FlowIdentity,
        flow_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, FlowError> {
        let logic = registry.create(flow_name)?;
        Ok(Self {
            checkpoint: FlowCheckpoint::new(identity, flow_name, now),
            logic,
        })
    }

    /// Rebuild a fiber from a stored checkpoint.
    ///
    /// # Errors
    ///
    /// [`FlowError::Deserialization`] if the state does not decode into the
    /// registered flow type, [`FlowError::UnknownFlow`] if the type is not
    /// registered.
    pub fn restore(checkpoint: &FlowCheckpoint, registry: &FlowRegistry) -> Result<Self, FlowError> {
        let logic = registry
            .restore(&checkpoint.flow_name, checkpoint.state.clone())
            .map_err(|err| match err {
                RestoreError::UnknownFlow(name) => FlowError::UnknownFlow(name),
                RestoreError::Decode(e) => FlowError::Deserialization {
                    identity: checkpoint.identity.clone(),
                    reason: e.to_string(),
                },
            })?;
        Ok(Self {
            checkpoint: checkpoint.clone(),
            logic,
        })
    }

    /// The fiber's checkpoint.
    pub fn checkpoint(&self) -> &FlowCheckpoint {
        &self.checkpoint
    }

    pub(crate) fn checkpoint_mut(&mut self) -> &mut FlowCheckpoint {
        &mut self.checkpoint
    }

    /// Consume the fiber, keeping only its checkpoint.
    pub fn into_checkpoint(self) -> FlowCheckpoint {
        self.checkpoint
    }

    /// The flow this fiber runs.
    pub fn identity(&self) -> &FlowIdentity {
        &self.checkpoint.identity
    }

    /// Serialized form of the live logic.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if the flow state cannot be written as JSON.
    pub fn snapshot(&self) -> Result<Value, serde_json::Error> {
        self.logic.snapshot()
    }

    /// Run one step of the flow.
    ///
    /// `input` must fit the checkpoint's current wait condition; anything
    /// else means the event was misrouted or the checkpoint is corrupt, and
    /// is rejected without running the flow.
    ///
    /// # Arguments
    ///
    /// * `input` - The resume value.
    /// * `now` - Time of the current unit of work.
    /// * `services` - Services made available to the flow.
    /// * `sessions` - Session engine used by the flow's context.
    ///
    /// # Returns
    ///
    /// What the flow yielded. The checkpoint's `state` reflects the step.
    ///
    /// # Errors
    ///
    /// [`FlowError::Protocol`] for a mismatched input,
    /// [`FlowError::Deserialization`] if the new state cannot be serialized.
    pub fn resume(
        &mut self,
        input: FlowResume,
        now: DateTime<Utc>,
        services: &Services,
        sessions: &SessionManager,
    ) -> Result<FiberYield, FlowError> {
        self.check_input(&input)?;
        let checkpoint = &mut self.checkpoint;
        checkpoint.status = FlowStatus::Running;
        let mut ctx = FlowContext::new(
            &checkpoint.identity,
            &checkpoint.flow_name,
            now,
            services,
            &mut checkpoint.sessions,
            &mut checkpoint.session_counter,
            sessions,
        );
        let step = self.logic.resume(&mut ctx, input);
        checkpoint.state = self
            .logic
            .snapshot()
            .map_err(|e| FlowError::Deserialization {
                identity: checkpoint.identity.clone(),
                reason: format!("flow state cannot be serialized: {e}"),
            })?;
        Ok(match step {
            Ok(FlowStep::Suspend(request)) => FiberYield::Suspended(request),
            Ok(FlowStep::Complete(value)) => FiberYield::Completed(value),
            Err(failure) => FiberYield::Failed(failure),
        })
    }

    fn check_input(&self, input: &FlowResume) -> Result<(), FlowError> {
        let fits = match (&self.checkpoint.waiting_for, input) {
            (Some(WaitingFor::FlowStart), FlowResume::Start { .. }) => true,
            (
                Some(WaitingFor::SessionMessage { session, .. }),
                FlowResume::SessionData { session: got, .. } | FlowResume::SessionError { session: got, .. },
            ) => session == got,
            (
                Some(WaitingFor::ExternalEventResponse { request_id }),
                FlowResume::ExternalResponse { request_id: got, .. }
                | FlowResume::ExternalFailure { request_id: got, .. },
            ) => request_id == got,
            (Some(WaitingFor::Timer { .. }), FlowResume::TimerElapsed) => true,
            (Some(WaitingFor::Wakeup), FlowResume::Wakeup | FlowResume::SessionError { .. }) => true,
            _ => false,
        };
        if fits {
            Ok(())
        } else {
            Err(FlowError::Protocol {
                identity: self.checkpoint.identity.clone(),
                reason: format!(
                    "resume value {} does not match wait condition {:?}",
                    input.kind(),
                    self.checkpoint.waiting_for
                ),
            })
        }
    }
}

impl Clone for FlowFiber {
    fn clone(&self) -> Self {
        Self {
            checkpoint: self.checkpoint.clone(),
            logic: self.logic.clone_box(),
        }
    }
}

impl fmt::Debug for FlowFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowFiber")
            .field("identity", &self.checkpoint.identity)
            .field("flow_name", &self.checkpoint.flow_name)
            .field("version", &self.checkpoint.version)
            .field("status", &self.checkpoint.status)
            .finish()
    }
}
