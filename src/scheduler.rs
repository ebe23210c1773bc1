//! In-process timer service.
//!
//! Flows never sleep on a runtime timer. A `Sleep`, an external request
//! deadline, or a pending resend becomes a `ScheduleWakeup` outbound record;
//! whoever consumes the timer topic turns it into a `TimerFired` event at the
//! requested instant. [`SchedulingBus`] lets an engine play that role for
//! itself by arming a [`Scheduler`] from the records it publishes.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::bus::{EventBus, OutboundPayload, OutboundRecord};
use crate::error::BusError;
use crate::identity::FlowIdentity;

/// Pending wakeups ordered by due time.
///
/// Scheduling the same `(identity, at)` pair twice keeps one entry, so
/// republished outboxes do not fire timers twice.
#[derive(Debug, Default)]
pub struct Scheduler {
    pending: Mutex<BTreeSet<(DateTime<Utc>, FlowIdentity)>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a wakeup for `identity` at `at`.
    ///
    /// # Returns
    ///
    /// `false` if the same wakeup was already pending.
    pub fn schedule(&self, identity: FlowIdentity, at: DateTime<Utc>) -> bool {
        self.lock().insert((at, identity))
    }

    /// Remove and return every wakeup due at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<(FlowIdentity, DateTime<Utc>)> {
        let mut pending = self.lock();
        let mut fired = Vec::new();
        while let Some(first) = pending.first() {
            if first.0 > now {
                break;
            }
            if let Some((at, identity)) = pending.pop_first() {
                fired.push((identity, at));
            }
        }
        fired
    }

    /// Drop every pending wakeup of `identity`.
    pub fn cancel(&self, identity: &FlowIdentity) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|(_, id)| id != identity);
        before - pending.len()
    }

    /// The earliest pending due time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().first().map(|(at, _)| *at)
    }

    /// Number of pending wakeups.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<(DateTime<Utc>, FlowIdentity)>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Event bus decorator that arms a [`Scheduler`] from published
/// `ScheduleWakeup` records.
///
/// Records are forwarded to the inner bus first; timers are armed only once
/// the publish succeeded, so a failed publish (which will be retried or
/// republished from the checkpoint outbox) arms nothing.
#[derive(Debug)]
pub struct SchedulingBus<B> {
    inner: Arc<B>,
    scheduler: Arc<Scheduler>,
}

impl<B: EventBus> SchedulingBus<B> {
    /// Wrap `inner`, arming `scheduler`.
    pub fn new(inner: Arc<B>, scheduler: Arc<Scheduler>) -> Self {
        Self { inner, scheduler }
    }

    /// The wrapped bus.
    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<B: EventBus> EventBus for SchedulingBus<B> {
    async fn publish(&self, records: &[OutboundRecord]) -> Result<(), BusError> {
        self.inner.publish(records).await?;
        for record in records {
            if let (OutboundPayload::ScheduleWakeup { at }, Some(identity)) = (&record.payload, &record.key)
                && self.scheduler.schedule(identity.clone(), *at)
            {
                trace!(flow = %identity, %at, "wakeup armed");
            }
        }
        Ok(())
    }
}
