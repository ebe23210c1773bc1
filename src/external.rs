//! External event requests: correlation, validity windows, and retries.
//!
//! A flow that needs an external collaborator (signing, persistence,
//! notarisation) yields an [`ExternalEventRequest`]. The pipeline publishes
//! it with a correlation id and schedules a wakeup at the end of its validity
//! window. Whichever comes first, the response or the deadline, resolves the
//! [`ExternalEventContext`] and resumes the flow.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{ExternalRequestRecord, OutboundPayload, Outbox, topics};
use crate::config::ExternalEventConfig;
use crate::identity::FlowIdentity;

/// What a flow asks an external collaborator to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEventRequest {
    /// Topic the collaborator listens on.
    pub topic: String,
    /// Request body.
    pub payload: Value,
    /// Overrides the configured validity window.
    pub validity_window: Option<Duration>,
}

impl ExternalEventRequest {
    /// A request using the configured validity window.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            validity_window: None,
        }
    }

    /// Use `window` instead of the configured validity window.
    pub fn with_validity_window(mut self, window: Duration) -> Self {
        self.validity_window = Some(window);
        self
    }
}

/// What the collaborator answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExternalOutcome {
    /// The request succeeded.
    Success(Value),
    /// A temporary failure; the request may be resubmitted.
    Transient(String),
    /// The platform rejected the request.
    Platform(String),
    /// The request can never succeed.
    Fatal(String),
}

/// Why an external request produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExternalFailure {
    /// No response arrived within the validity window.
    Timeout,
    /// The collaborator reported an error.
    Error(String),
}

impl std::fmt::Display for ExternalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("external request timed out"),
            Self::Error(message) => write!(f, "external request failed: {message}"),
        }
    }
}

/// How an outstanding request ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExternalResolution {
    /// A successful response body.
    Response(Value),
    /// A failure to hand to the flow.
    Failed(ExternalFailure),
}

/// Correlates an outstanding external request with its eventual response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEventContext {
    /// Correlation id carried by the request and the response.
    pub request_id: Uuid,
    /// Topic the request was published on.
    pub topic: String,
    /// Request body, kept for resubmission.
    pub payload: Value,
    /// When the flow first issued the request.
    pub created_at: DateTime<Utc>,
    /// When the current attempt was published.
    pub sent_at: DateTime<Utc>,
    /// Validity window of each attempt, in milliseconds.
    pub validity_window_ms: u64,
    /// Attempts published so far (1-based).
    pub attempts: u32,
    /// Set once the request is answered or has timed out.
    pub resolution: Option<ExternalResolution>,
}

impl ExternalEventContext {
    /// The instant after which the current attempt counts as lost.
    pub fn deadline(&self) -> DateTime<Utc> {
        let window = i64::try_from(self.validity_window_ms).unwrap_or(i64::MAX);
        chrono::Duration::try_milliseconds(window)
            .and_then(|window| self.sent_at.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns `true` if `at` is at or past the deadline.
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        at >= self.deadline()
    }

    /// Returns `true` once the request is answered or has timed out.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// What [`ExternalEventManager::on_response`] did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// The request is resolved; the flow can resume.
    Resolved,
    /// A transient failure caused the request to be published again.
    Resubmitted,
    /// The response did not belong to the outstanding request.
    Ignored,
}

/// Issues external requests and resolves them.
#[derive(Debug, Clone, Default)]
pub struct ExternalEventManager {
    config: ExternalEventConfig,
}

impl ExternalEventManager {
    /// Create a manager with the given configuration.
    pub fn new(config: ExternalEventConfig) -> Self {
        Self { config }
    }

    /// Publish a new request and schedule its timeout.
    ///
    /// # Arguments
    ///
    /// * `owner` - The requesting flow.
    /// * `request` - What to ask for.
    /// * `request_id` - Deterministic correlation id chosen by the pipeline.
    /// * `now` - Current time of the unit of work.
    /// * `out` - Receives the request record and a `ScheduleWakeup` record.
    ///
    /// # Returns
    ///
    /// The context to store in the checkpoint.
    pub fn submit(
        &self,
        owner: &FlowIdentity,
        request: ExternalEventRequest,
        request_id: Uuid,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> ExternalEventContext {
        let window = request.validity_window.unwrap_or(self.config.validity_window);
        let ctx = ExternalEventContext {
            request_id,
            topic: request.topic,
            payload: request.payload,
            created_at: now,
            sent_at: now,
            validity_window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            attempts: 1,
            resolution: None,
        };
        Self::publish_attempt(owner, &ctx, out);
        debug!(flow = %owner, %request_id, topic = %ctx.topic, "external request issued");
        ctx
    }

    /// Apply a response to the outstanding request.
    ///
    /// Transient failures are resubmitted (same correlation id, fresh
    /// validity window) until `max_transient_retries` resubmissions have been
    /// made; after that, and for platform or fatal failures, the request
    /// resolves to [`ExternalFailure::Error`].
    pub fn on_response(
        &self,
        ctx: &mut ExternalEventContext,
        owner: &FlowIdentity,
        request_id: Uuid,
        outcome: ExternalOutcome,
        now: DateTime<Utc>,
        out: &mut Outbox,
    ) -> ResponseAction {
        if ctx.request_id != request_id || ctx.is_resolved() {
            warn!(flow = %owner, %request_id, "late or unknown external response dropped");
            return ResponseAction::Ignored;
        }
        let resolution = match outcome {
            ExternalOutcome::Success(value) => ExternalResolution::Response(value),
            ExternalOutcome::Transient(message) if ctx.attempts <= self.config.max_transient_retries => {
                ctx.attempts += 1;
                ctx.sent_at = now;
                Self::publish_attempt(owner, ctx, out);
                warn!(
                    flow = %owner,
                    %request_id,
                    attempt = ctx.attempts,
                    %message,
                    "transient external failure, request resubmitted"
                );
                return ResponseAction::Resubmitted;
            }
            ExternalOutcome::Transient(message)
            | ExternalOutcome::Platform(message)
            | ExternalOutcome::Fatal(message) => {
                ExternalResolution::Failed(ExternalFailure::Error(message))
            }
        };
        ctx.resolution = Some(resolution);
        ResponseAction::Resolved
    }

    /// Apply a fired timer. Resolves the request with
    /// [`ExternalFailure::Timeout`] if `at` is past the current attempt's
    /// deadline.
    ///
    /// # Returns
    ///
    /// `true` if the request timed out just now.
    pub fn on_timer(&self, ctx: &mut ExternalEventContext, owner: &FlowIdentity, at: DateTime<Utc>) -> bool {
        if ctx.is_resolved() || !ctx.is_expired(at) {
            return false;
        }
        warn!(
            flow = %owner,
            request_id = %ctx.request_id,
            attempts = ctx.attempts,
            "external request timed out"
        );
        ctx.resolution = Some(ExternalResolution::Failed(ExternalFailure::Timeout));
        true
    }

    fn publish_attempt(owner: &FlowIdentity, ctx: &ExternalEventContext, out: &mut Outbox) {
        out.push(
            &ctx.topic,
            None,
            OutboundPayload::ExternalRequest(ExternalRequestRecord {
                request_id: ctx.request_id,
                source: owner.clone(),
                attempt: ctx.attempts,
                payload: ctx.payload.clone(),
            }),
        );
        out.push(
            topics::TIMERS,
            Some(owner.clone()),
            OutboundPayload::ScheduleWakeup { at: ctx.deadline() },
        );
    }
}
