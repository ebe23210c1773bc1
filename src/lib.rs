//! Durable, checkpointed flow execution.
//!
//! A [`Flow`] is a suspendable computation: each step returns either a result
//! or an I/O request (send to a counterparty, wait for a reply, call an
//! external service, sleep). The [`FlowPipeline`] persists a
//! [`FlowCheckpoint`] after every step together with the outbound records that
//! step produced, publishes them, and resumes the flow when the event it is
//! waiting for arrives. Parties talk over sequenced, acknowledged sessions.
//! [`FlowEngine`] adds per-flow workers, timers, and an inbound run loop.

mod bus;
pub use bus::{
    ControlResponse, EventBus, ExternalRequestRecord, FlowEvent, FlowStatusRecord, InMemoryEventBus, InboundRecord,
    OutboundPayload, OutboundRecord, Outbox, RecordId, SessionEnvelope, SessionMessage, topics,
};
mod cache;
pub use cache::{CacheStats, FiberCache};
mod checkpoint;
pub use checkpoint::{
    CheckpointSummary, FlowCheckpoint, FlowErrorKind, FlowErrorRecord, FlowStatus, WaitingFor, WaitingForKind,
};
mod clock;
pub use clock::{Clock, ManualClock, SystemClock};
mod config;
pub use config::{CacheConfig, EngineConfig, ExternalEventConfig, RetryConfig, SessionConfig};
mod context;
pub use context::{FlowContext, Services};
mod dispatch;
pub use dispatch::{
    Dispatch, ExternalEventHandler, FlowStartHandler, SessionMessageHandler, TimerHandler, WaitingForDispatcher,
    WaitingForHandler, WakeupHandler,
};
mod engine;
pub use engine::{DeadLetter, EngineHandle, FlowEngine, FlowEngineBuilder, Handled};
mod error;
pub use error::{BusError, FlowError, FlowFailure, SessionError, StoreError};
mod external;
pub use external::{
    ExternalEventContext, ExternalEventManager, ExternalEventRequest, ExternalFailure, ExternalOutcome,
    ExternalResolution, ResponseAction,
};
mod fiber;
pub use fiber::{FiberYield, FlowFiber};
mod flow;
pub use flow::{Flow, FlowIORequest, FlowRegistry, FlowResume, FlowStep};
mod identity;
pub use identity::{FlowIdentity, PartyId, SessionId};
mod pipeline;
pub use pipeline::{
    Disposition, FlowPipeline, FlowPipelineBuilder, ProcessOutcome, RecoveryReport, Resident, Transition,
};
mod retry;
pub use retry::{Backoff, Transient, retry_transient};
mod scheduler;
pub use scheduler::{Scheduler, SchedulingBus};
mod session;
pub use session::{
    ReceiveOutcome, ReceivedMessage, SessionManager, SessionRole, SessionState, SessionStatus, UnackedMessage,
};
mod storage;
pub use storage::{CheckpointLayout, FileCheckpointStore};
mod store;
pub use store::{CheckpointStore, InMemoryCheckpointStore};
mod worker;
