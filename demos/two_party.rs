//! Two parties settle a payment over a session, then record it with an
//! external ledger service.
//!
//! Alice's `Payment` flow asks Bob's `Approver` flow for approval, and on
//! approval asks the ledger (an external collaborator reached through the
//! bus) to record the transfer. Checkpoints are written to a temporary
//! directory, so every step survives a restart.
//!
//! Run with: `cargo run --example two_party`
//! (set `RUST_LOG=flowfold=debug` to watch the engine work).

use std::sync::Arc;
use std::time::Duration;

use flowfold::{
    EngineConfig, ExternalEventRequest, ExternalOutcome, FileCheckpointStore, Flow, FlowContext, FlowEngine, FlowEvent,
    FlowFailure, FlowIORequest, FlowIdentity, FlowRegistry, FlowResume, FlowStatus, FlowStep, InMemoryEventBus,
    InboundRecord, OutboundPayload, Services, SessionId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// Alice's side: request approval, then record the transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Payment {
    amount: u64,
    session: Option<SessionId>,
}

impl Flow for Payment {
    const NAME: &'static str = "payment";

    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
        match input {
            FlowResume::Start { args, .. } => {
                self.amount = args["amount"].as_u64().ok_or_else(|| FlowFailure::new("missing amount"))?;
                let session = ctx.open_session("bob");
                self.session = Some(session);
                Ok(FlowStep::Suspend(FlowIORequest::SendAndReceive {
                    session,
                    payload: json!({ "amount": self.amount }),
                }))
            }
            FlowResume::SessionData { payload, .. } if payload["approved"] == json!(true) => Ok(FlowStep::Suspend(
                FlowIORequest::ExternalEvent(ExternalEventRequest::new(
                    "ledger.record",
                    json!({ "from": "alice", "to": "bob", "amount": self.amount }),
                )),
            )),
            FlowResume::SessionData { payload, .. } => Err(FlowFailure::new(format!(
                "declined: {}",
                payload["reason"].as_str().unwrap_or("no reason")
            ))
            .with_code("DECLINED")),
            FlowResume::ExternalResponse { value, .. } => Ok(FlowStep::Complete(value)),
            FlowResume::ExternalFailure { failure, .. } => Err(FlowFailure::new(failure.to_string())),
            FlowResume::SessionError { error, .. } => Err(error.into()),
            other => Err(FlowFailure::new(format!("unexpected {}", other.kind()))),
        }
    }
}

/// Bob's approval limit, injected as a service.
#[derive(Debug)]
struct Limits {
    max_amount: u64,
}

/// Bob's side: approve anything within his limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Approver {
    answered: bool,
}

impl Flow for Approver {
    const NAME: &'static str = "approver";

    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: FlowResume) -> Result<FlowStep, FlowFailure> {
        match input {
            FlowResume::Start {
                initiated_by: Some(session),
                ..
            } => Ok(FlowStep::Suspend(FlowIORequest::Receive { session })),
            FlowResume::SessionData { session, payload, .. } => {
                let limit = ctx.service::<Limits>()?.max_amount;
                let amount = payload["amount"].as_u64().unwrap_or(u64::MAX);
                let answer = if amount <= limit {
                    json!({ "approved": true })
                } else {
                    json!({ "approved": false, "reason": format!("over limit of {limit}") })
                };
                self.answered = true;
                Ok(FlowStep::Suspend(FlowIORequest::Send { session, payload: answer }))
            }
            FlowResume::Wakeup if self.answered => Ok(FlowStep::Complete(Value::Null)),
            other => Err(FlowFailure::new(format!("unexpected {}", other.kind()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowfold=info")))
        .init();

    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let bus = Arc::new(InMemoryEventBus::new());
    let registry = FlowRegistry::new()
        .register::<Payment>()
        .register_responder::<Approver>(Payment::NAME);

    let engine = FlowEngine::builder(registry)
        .store(Arc::clone(&store))
        .bus(Arc::clone(&bus))
        .services(Services::new().with(Limits { max_amount: 500 }))
        .config(EngineConfig {
            timer_tick: Duration::from_millis(20),
            ..EngineConfig::default()
        })
        .build()?;
    let report = engine.recover().await?;
    println!("recovered {} checkpoints", report.checkpoints);

    // Route published records: session traffic and wakeups go back into
    // the engine, ledger requests are answered, status changes are shown.
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut published = bus.subscribe();
    let router_tx = inbound_tx.clone();
    tokio::spawn(async move {
        while let Some(record) = published.recv().await {
            if let Some(inbound) = record.as_inbound() {
                let _ = router_tx.send(inbound);
                continue;
            }
            match record.payload {
                OutboundPayload::ExternalRequest(request) if record.topic == "ledger.record" => {
                    println!("ledger: recording {}", request.payload);
                    let _ = router_tx.send(InboundRecord::Flow {
                        identity: request.source,
                        event: FlowEvent::ExternalResponse {
                            request_id: request.request_id,
                            outcome: ExternalOutcome::Success(json!({ "entry": 1 })),
                        },
                    });
                }
                OutboundPayload::Status(status) => {
                    println!("{} [{}] -> {:?}", status.flow_name, status.identity, status.status);
                    if status.flow_name == Payment::NAME {
                        let _ = done_tx.send(status);
                    }
                }
                _ => {}
            }
        }
    });

    let handle = engine.start(UnboundedReceiverStream::new(inbound_rx));

    for amount in [120, 900] {
        inbound_tx.send(InboundRecord::Flow {
            identity: FlowIdentity::random("alice"),
            event: FlowEvent::Start {
                flow_name: Payment::NAME.into(),
                args: json!({ "amount": amount }),
            },
        })?;
    }

    for _ in 0..2 {
        let Some(status) = tokio::time::timeout(Duration::from_secs(5), done_rx.recv()).await? else {
            break;
        };
        match status.status {
            FlowStatus::Completed => println!("payment completed: {}", status.result.unwrap_or_default()),
            other => println!("payment {other:?}: {}", status.error.unwrap_or_default()),
        }
    }

    // Declined payments stay queryable until cleaned up.
    for summary in engine.list_flows(None).await? {
        println!(
            "stored: {} {:?} {}",
            summary.identity,
            summary.status,
            summary.last_error.map(|e| e.message).unwrap_or_default()
        );
    }

    handle.shutdown().await;
    Ok(())
}
