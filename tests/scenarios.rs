//! End-to-end scenarios driven through the public engine API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use flowfold::{
    CheckpointStore, ControlResponse, Disposition, EngineConfig, ExternalEventRequest, Flow, FlowContext,
    FlowEngine, FlowErrorKind, FlowEvent, FlowFailure, FlowIORequest, FlowIdentity, FlowRegistry, FlowResume,
    FlowStatus, FlowStatusRecord, FlowStep, InMemoryCheckpointStore, InMemoryEventBus, InboundRecord, ManualClock,
    OutboundPayload, OutboundRecord, PartyId, RetryConfig, SessionEnvelope, SessionId, SessionMessage, WaitingFor,
    topics,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

// --- Flows ---

/// Says hello, then collects two replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collector {
    session: Option<SessionId>,
    received: Vec<Value>,
}

impl Flow for Collector {
    const NAME: &'static str = "collector";

    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
        match input {
            FlowResume::Start { .. } => {
                let session = ctx.open_session("bob");
                self.session = Some(session);
                Ok(FlowStep::Suspend(FlowIORequest::Send {
                    session,
                    payload: json!("hello"),
                }))
            }
            FlowResume::Wakeup => {
                let session = self.session.ok_or_else(|| FlowFailure::new("no session"))?;
                Ok(FlowStep::Suspend(FlowIORequest::Receive { session }))
            }
            FlowResume::SessionData { session, payload, .. } => {
                self.received.push(payload);
                if self.received.len() == 2 {
                    Ok(FlowStep::Complete(json!(self.received)))
                } else {
                    Ok(FlowStep::Suspend(FlowIORequest::Receive { session }))
                }
            }
            FlowResume::SessionError { error, .. } => Err(error.into()),
            other => Err(FlowFailure::new(format!("unexpected {}", other.kind()))),
        }
    }
}

/// Asks a notary to sign and returns the signature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Notarise;

impl Flow for Notarise {
    const NAME: &'static str = "notarise";

    fn resume(&mut self, _ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
        match input {
            FlowResume::Start { args, .. } => Ok(FlowStep::Suspend(FlowIORequest::ExternalEvent(
                ExternalEventRequest::new("notary.sign", args).with_validity_window(Duration::from_secs(30)),
            ))),
            FlowResume::ExternalResponse { value, .. } => Ok(FlowStep::Complete(value)),
            FlowResume::ExternalFailure { failure, .. } => Err(FlowFailure::new(failure.to_string()).with_code("NOTARY")),
            other => Err(FlowFailure::new(format!("unexpected {}", other.kind()))),
        }
    }
}

/// Sends one payload and waits for the answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ping;

impl Flow for Ping {
    const NAME: &'static str = "ping";

    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
        match input {
            FlowResume::Start { args, .. } => {
                let session = ctx.open_session("bob");
                Ok(FlowStep::Suspend(FlowIORequest::SendAndReceive { session, payload: args }))
            }
            FlowResume::SessionData { payload, .. } => Ok(FlowStep::Complete(payload)),
            other => Err(FlowFailure::new(format!("unexpected {}", other.kind()))),
        }
    }
}

/// Answers a `Ping`, then closes the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Pong {
    session: Option<SessionId>,
    closed: bool,
}

impl Flow for Pong {
    const NAME: &'static str = "pong";

    fn resume(&mut self, _ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
        match input {
            FlowResume::Start {
                initiated_by: Some(session),
                ..
            } => {
                self.session = Some(session);
                Ok(FlowStep::Suspend(FlowIORequest::Receive { session }))
            }
            FlowResume::SessionData { session, payload, .. } => Ok(FlowStep::Suspend(FlowIORequest::Send {
                session,
                payload: json!({ "echo": payload }),
            })),
            FlowResume::Wakeup if !self.closed => {
                self.closed = true;
                let session = self.session.ok_or_else(|| FlowFailure::new("no session"))?;
                Ok(FlowStep::Suspend(FlowIORequest::CloseSession { session }))
            }
            FlowResume::Wakeup => Ok(FlowStep::Complete(Value::Null)),
            other => Err(FlowFailure::new(format!("unexpected {}", other.kind()))),
        }
    }
}

// --- Harness ---

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap()
}

fn registry() -> FlowRegistry {
    FlowRegistry::new()
        .register::<Collector>()
        .register::<Notarise>()
        .register::<Ping>()
        .register_responder::<Pong>(Ping::NAME)
}

fn config() -> EngineConfig {
    EngineConfig {
        timer_tick: Duration::from_millis(5),
        retry: RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 2,
        },
        ..EngineConfig::default()
    }
}

struct World {
    engine: FlowEngine,
    store: Arc<InMemoryCheckpointStore>,
    bus: Arc<InMemoryEventBus>,
    clock: ManualClock,
}

impl World {
    fn new() -> Self {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let clock = ManualClock::new(t0());
        let engine = build_engine(&store, &bus, &clock);
        Self {
            engine,
            store,
            bus,
            clock,
        }
    }

    /// A fresh engine over the same store and bus, as after a process restart.
    fn restart(&self) -> FlowEngine {
        build_engine(&self.store, &self.bus, &self.clock)
    }

    async fn checkpoint(&self, identity: &FlowIdentity) -> Option<flowfold::FlowCheckpoint> {
        self.store.load(identity).await.expect("load")
    }

    async fn deliver(&self, identity: &FlowIdentity, message: SessionMessage) -> Disposition {
        let cp = self.checkpoint(identity).await.expect("flow exists");
        let (session, state) = cp.sessions.iter().next().expect("one session");
        let event = FlowEvent::Session(SessionEnvelope {
            session: *session,
            source: state.peer.clone(),
            destination: identity.clone(),
            message,
        });
        self.engine.process(identity, event).await.expect("process").disposition
    }

    fn session_messages(&self) -> Vec<SessionMessage> {
        self.bus
            .published_on(topics::SESSIONS)
            .into_iter()
            .filter_map(|record| match record.payload {
                OutboundPayload::Session(envelope) => Some(envelope.message),
                _ => None,
            })
            .collect()
    }

    fn last_status(&self) -> FlowStatusRecord {
        match self.bus.published_on(topics::STATUS).pop().map(|r| r.payload) {
            Some(OutboundPayload::Status(record)) => record,
            other => panic!("expected a status record, got {other:?}"),
        }
    }
}

fn build_engine(store: &Arc<InMemoryCheckpointStore>, bus: &Arc<InMemoryEventBus>, clock: &ManualClock) -> FlowEngine {
    FlowEngine::builder(registry())
        .store(Arc::clone(store))
        .bus(Arc::clone(bus))
        .clock(clock.clone())
        .config(config())
        .build()
        .expect("engine")
}

fn alice() -> FlowIdentity {
    FlowIdentity::new("alice", Uuid::from_u128(0xA11CE))
}

fn start(flow_name: &str, args: Value) -> FlowEvent {
    FlowEvent::Start {
        flow_name: flow_name.into(),
        args,
    }
}

fn data(seq: u64, payload: &str) -> SessionMessage {
    SessionMessage::Data {
        seq,
        payload: json!(payload),
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// --- Scenario A: ordered, acknowledged, deduplicated delivery ---

#[tokio::test]
async fn scenario_a_duplicate_is_acked_but_not_redelivered() {
    let world = World::new();
    let alice = alice();

    let outcome = world
        .engine
        .process(&alice, start("collector", Value::Null))
        .await
        .expect("start");
    assert_eq!(outcome.disposition, Disposition::Suspended);
    assert!(matches!(
        world.session_messages().as_slice(),
        [SessionMessage::Init { seq: 0, payload: Some(p), .. }] if *p == json!("hello")
    ));

    // The peer acknowledges seq 0 and confirms.
    assert_eq!(world.deliver(&alice, SessionMessage::Ack { seq: 0 }).await, Disposition::Updated);
    assert_eq!(
        world.deliver(&alice, SessionMessage::Confirm { seq: 0 }).await,
        Disposition::Updated
    );
    let cp = world.checkpoint(&alice).await.expect("suspended");
    let session = *cp.sessions.keys().next().expect("session");
    assert!(cp.sessions[&session].unacked.is_empty());
    assert_eq!(
        cp.waiting_for,
        Some(WaitingFor::SessionMessage {
            session,
            expected_seq: 1
        })
    );

    // seq 1 resumes the flow, which waits for seq 2.
    assert_eq!(world.deliver(&alice, data(1, "one")).await, Disposition::Suspended);
    let cp = world.checkpoint(&alice).await.expect("suspended");
    assert_eq!(cp.state["received"], json!(["one"]));
    let version_before_duplicate = cp.version;

    // A duplicate seq 1 is acknowledged again and nothing else.
    world.bus.take_published();
    assert_eq!(world.deliver(&alice, data(1, "one")).await, Disposition::Updated);
    assert_eq!(world.session_messages(), vec![SessionMessage::Ack { seq: 1 }]);
    let cp = world.checkpoint(&alice).await.expect("suspended");
    assert_eq!(cp.state["received"], json!(["one"]), "not redelivered");
    assert_eq!(cp.version, version_before_duplicate + 1);
    assert!(matches!(
        cp.waiting_for,
        Some(WaitingFor::SessionMessage { expected_seq: 2, .. })
    ));

    assert_eq!(world.deliver(&alice, data(2, "two")).await, Disposition::Completed);
    let status = world.last_status();
    assert_eq!(status.status, FlowStatus::Completed);
    assert_eq!(status.result, Some(json!(["one", "two"])));
}

#[tokio::test]
async fn scenario_a_out_of_order_arrival_is_reordered() {
    let world = World::new();
    let alice = alice();
    world
        .engine
        .process(&alice, start("collector", Value::Null))
        .await
        .expect("start");
    world.deliver(&alice, SessionMessage::Confirm { seq: 0 }).await;

    assert_eq!(world.deliver(&alice, data(2, "two")).await, Disposition::Updated, "buffered");
    assert_eq!(world.deliver(&alice, data(1, "one")).await, Disposition::Completed);
    assert_eq!(world.last_status().result, Some(json!(["one", "two"])));
}

// --- Scenario B: external event timeout ---

#[tokio::test]
async fn scenario_b_external_timeout_fails_the_flow() {
    let world = World::new();
    let alice = alice();
    world
        .engine
        .process(&alice, start("notarise", json!({ "tx": 42 })))
        .await
        .expect("start");

    let requests = world.bus.published_on("notary.sign");
    assert_eq!(requests.len(), 1);
    assert!(matches!(
        &requests[0].payload,
        OutboundPayload::ExternalRequest(r) if r.payload == json!({ "tx": 42 }) && r.source == alice
    ));
    assert_eq!(
        world.engine.scheduler().next_due(),
        Some(t0() + chrono::Duration::seconds(30))
    );

    world.clock.advance(chrono::Duration::seconds(29));
    assert_eq!(world.engine.fire_due_timers().await, 0);
    world.clock.advance(chrono::Duration::seconds(1));
    assert_eq!(world.engine.fire_due_timers().await, 1);

    let summary = world.engine.status(&alice).await.expect("status").expect("kept");
    assert_eq!(summary.status, FlowStatus::Failed);
    let error = summary.last_error.expect("last error");
    assert_eq!(error.kind, FlowErrorKind::Business);
    assert_eq!(error.message, "external request timed out");
    assert_eq!(world.last_status().status, FlowStatus::Failed);

    // The response finally shows up; the failed flow ignores it.
    let request_id = match &requests[0].payload {
        OutboundPayload::ExternalRequest(r) => r.request_id,
        _ => unreachable!(),
    };
    let late = world
        .engine
        .process(
            &alice,
            FlowEvent::ExternalResponse {
                request_id,
                outcome: flowfold::ExternalOutcome::Success(json!("sig")),
            },
        )
        .await
        .expect("late response");
    assert_eq!(late.disposition, Disposition::Ignored);
}

#[tokio::test]
async fn scenario_b_response_within_window_completes() {
    let world = World::new();
    let alice = alice();
    world
        .engine
        .process(&alice, start("notarise", json!({ "tx": 7 })))
        .await
        .expect("start");
    let request_id = match &world.bus.published_on("notary.sign")[0].payload {
        OutboundPayload::ExternalRequest(r) => r.request_id,
        other => panic!("expected a request, got {other:?}"),
    };

    world.clock.advance(chrono::Duration::seconds(10));
    let outcome = world
        .engine
        .process(
            &alice,
            FlowEvent::ExternalResponse {
                request_id,
                outcome: flowfold::ExternalOutcome::Success(json!("sig-7")),
            },
        )
        .await
        .expect("response");
    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(world.last_status().result, Some(json!("sig-7")));

    // The stale timeout fires into nothing.
    world.clock.advance(chrono::Duration::seconds(30));
    world.engine.fire_due_timers().await;
    assert!(world.engine.status(&alice).await.expect("status").is_none());
}

// --- Scenario C: crash between save and publish ---

#[tokio::test]
async fn scenario_c_restart_republishes_exactly_once() {
    let world = World::new();
    let alice = alice();

    // The bus is down: the checkpoint is saved, the publish never happens.
    world.bus.fail_always();
    let err = world
        .engine
        .process(&alice, start("ping", json!("hi")))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(world.bus.published().is_empty());
    assert_eq!(world.checkpoint(&alice).await.expect("saved").version, 1);
    assert!(world.engine.dead_letters()[0].transient);

    // Restart and recover.
    world.bus.heal();
    let restarted = world.restart();
    let report = restarted.recover().await.expect("recover");
    assert_eq!(report.checkpoints, 1);
    assert!(report.republished > 0);
    let inits = || {
        world
            .session_messages()
            .into_iter()
            .filter(|m| matches!(m, SessionMessage::Init { .. }))
            .count()
    };
    assert_eq!(inits(), 1);

    // Recovering again publishes the same record ids; the bus drops them.
    let duplicates_before = world.bus.duplicates();
    restarted.recover().await.expect("second recover");
    assert_eq!(inits(), 1, "exactly one externally visible Init");
    assert!(world.bus.duplicates() > duplicates_before);
}

// --- Scenario D: kill while cached ---

#[tokio::test]
async fn scenario_d_kill_clears_cache_and_store_together() {
    let world = World::new();
    let alice = alice();
    world
        .engine
        .process(&alice, start("collector", Value::Null))
        .await
        .expect("start");
    assert!(world.engine.pipeline().cache().contains(&alice));

    let outcome = world
        .engine
        .process(&alice, FlowEvent::Kill { reason: "stuck".into() })
        .await
        .expect("kill");
    assert_eq!(outcome.disposition, Disposition::Killed);
    assert_eq!(outcome.status, Some(FlowStatus::Killed));
    assert!(!world.engine.pipeline().cache().contains(&alice));
    assert!(world.checkpoint(&alice).await.is_none());
    assert!(world.engine.status(&alice).await.expect("status").is_none());

    let control = world.bus.published_on(topics::CONTROL_RESPONSES);
    assert!(matches!(
        &control.last().expect("reply").payload,
        OutboundPayload::Control(ControlResponse::Killed { identity }) if *identity == alice
    ));
    assert!(
        world
            .session_messages()
            .iter()
            .any(|m| matches!(m, SessionMessage::Error { cause } if cause == "stuck")),
        "the counterparty is told"
    );

    // A late message finds nothing to resume, and a second kill is refused.
    let outcome = world
        .engine
        .process(&alice, FlowEvent::Kill { reason: "again".into() })
        .await
        .expect("second kill");
    assert_eq!(outcome.disposition, Disposition::Rejected);
}

// --- Two-party exchange over the running engine ---

#[tokio::test]
async fn two_parties_exchange_through_the_bus() {
    let world = World::new();
    let alice = alice();

    // Loop everything the engine publishes back into it.
    let inbound = UnboundedReceiverStream::new(world.bus.subscribe()).filter_map(|r: OutboundRecord| r.as_inbound());
    let handle = world.engine.start(inbound);

    world
        .engine
        .process(&alice, start("ping", json!("marco")))
        .await
        .expect("start");

    eventually("both flows to finish", || async { world.store.is_empty() }).await;

    let completed: Vec<_> = world
        .bus
        .published_on(topics::STATUS)
        .into_iter()
        .filter_map(|r| match r.payload {
            OutboundPayload::Status(s) if s.status == FlowStatus::Completed => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 2);
    let initiator = completed
        .iter()
        .find(|s| s.identity == alice)
        .expect("initiator completed");
    assert_eq!(initiator.result, Some(json!({ "echo": "marco" })));

    handle.shutdown().await;
    assert!(world.engine.dead_letters().is_empty());
}

#[tokio::test]
async fn listing_goes_through_the_inbound_path() {
    let world = World::new();
    for n in 0..3u64 {
        world
            .engine
            .process(&FlowIdentity::new("alice", Uuid::from_u128(n.into())), start("notarise", json!(n)))
            .await
            .expect("start");
    }
    world
        .engine
        .process(&FlowIdentity::new("carol", Uuid::from_u128(9)), start("notarise", json!(9)))
        .await
        .expect("start");

    let handled = world
        .engine
        .submit(InboundRecord::ListFlows {
            party: Some(PartyId::new("alice")),
        })
        .await
        .expect("list");
    assert!(matches!(handled, flowfold::Handled::Listed(ref flows) if flows.len() == 3));
    assert_eq!(world.engine.evict_parties([&PartyId::new("alice")]), 3);
    assert_eq!(world.engine.pipeline().cache().len(), 1);
}
