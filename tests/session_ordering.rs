//! Property tests for in-order session delivery.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use flowfold::{
    FlowIdentity, Outbox, ReceiveOutcome, SessionConfig, SessionEnvelope, SessionId, SessionManager, SessionMessage,
    SessionState, SessionStatus,
};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

const WINDOW: u64 = 16;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap()
}

fn alice() -> FlowIdentity {
    FlowIdentity::new("alice", Uuid::from_u128(1))
}

struct Responder {
    manager: SessionManager,
    sessions: BTreeMap<SessionId, SessionState>,
    session: SessionId,
    bob: FlowIdentity,
}

/// Bob's side of a session alice opened with a payload-less `Init`.
fn responder() -> Responder {
    let manager = SessionManager::new(SessionConfig {
        reorder_window: WINDOW,
        ..SessionConfig::default()
    });
    let session = SessionId::derive(&alice(), 0);
    let bob = FlowIdentity::responder(&"bob".into(), &session);
    let mut sessions = BTreeMap::new();
    let init = SessionEnvelope {
        session,
        source: alice(),
        destination: bob.clone(),
        message: SessionMessage::Init {
            seq: 0,
            protocol: "ping".into(),
            payload: None,
        },
    };
    manager.accept(&mut sessions, &bob, &init, now(), &mut Outbox::new(bob.clone(), 1));
    Responder {
        manager,
        sessions,
        session,
        bob,
    }
}

impl Responder {
    fn deliver(&mut self, seq: u64) -> ReceiveOutcome {
        let envelope = SessionEnvelope {
            session: self.session,
            source: alice(),
            destination: self.bob.clone(),
            message: SessionMessage::Data {
                seq,
                payload: json!(seq),
            },
        };
        let mut out = Outbox::new(self.bob.clone(), 2);
        self.manager
            .receive(&mut self.sessions, &self.bob, &envelope, &mut out)
    }

    fn drain(&mut self) -> Vec<u64> {
        let mut seen = Vec::new();
        if let Some(state) = self.sessions.get_mut(&self.session) {
            while let Some(message) = state.take_message() {
                seen.push(message.seq);
            }
        }
        seen
    }

    fn status(&self) -> SessionStatus {
        self.sessions[&self.session].status
    }
}

/// A shuffled run of data sequence numbers `1..=n`, with `n` inside the window.
fn arrival_order() -> impl Strategy<Value = Vec<u64>> {
    (1..WINDOW).prop_flat_map(|n| Just((1..=n).collect::<Vec<u64>>()).prop_shuffle())
}

proptest! {
    #[test]
    fn payloads_are_observed_in_sequence_order(order in arrival_order()) {
        let mut bob = responder();
        let mut observed = Vec::new();
        for seq in &order {
            bob.deliver(*seq);
            observed.extend(bob.drain());
        }
        let expected: Vec<u64> = (1..=order.len() as u64).collect();
        prop_assert_eq!(observed, expected);
        prop_assert_eq!(bob.status(), SessionStatus::Confirmed);
    }

    #[test]
    fn duplicates_never_reach_the_flow_twice(
        order in arrival_order(),
        repeats in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let mut arrivals = order.clone();
        for index in repeats {
            let seq = *index.get(&order);
            let at = index.index(arrivals.len() + 1);
            arrivals.insert(at, seq);
        }

        let mut bob = responder();
        let mut observed = Vec::new();
        for seq in arrivals {
            bob.deliver(seq);
            observed.extend(bob.drain());
        }
        let expected: Vec<u64> = (1..=order.len() as u64).collect();
        prop_assert_eq!(observed, expected);
    }

    #[test]
    fn gaps_beyond_the_window_error_the_session(beyond in 0u64..64) {
        let mut bob = responder();
        // Next expected is 1, so 1 + WINDOW is the first rejected sequence.
        let outcome = bob.deliver(1 + WINDOW + beyond);
        prop_assert!(matches!(outcome, ReceiveOutcome::Violation(_)));
        prop_assert_eq!(bob.status(), SessionStatus::Errored);
        prop_assert!(bob.drain().is_empty());
    }
}

#[test]
fn gap_just_inside_the_window_is_buffered() {
    let mut bob = responder();
    assert_eq!(bob.deliver(WINDOW), ReceiveOutcome::Buffered);
    assert!(bob.drain().is_empty());
    for seq in 1..WINDOW {
        bob.deliver(seq);
    }
    assert_eq!(bob.drain(), (1..=WINDOW).collect::<Vec<_>>());
}
