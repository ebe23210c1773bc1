//! Per-resume context handed to flow logic, and the typed service registry.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::FlowFailure;
use crate::identity::{FlowIdentity, PartyId, SessionId};
use crate::session::{SessionManager, SessionState};

/// Statically typed registry of services available to flows.
///
/// Built once at startup and shared by reference; lookups are by Rust type,
/// never by name.
///
/// # Examples
///
/// ```
/// use flowfold::Services;
///
/// struct Notary { name: &'static str }
///
/// let services = Services::new().with(Notary { name: "notary-1" });
/// assert_eq!(services.get::<Notary>().map(|n| n.name), Some("notary-1"));
/// assert!(services.get::<String>().is_none());
/// ```
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service`, replacing any earlier service of the same type.
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    /// Register an already shared service.
    pub fn with_arc<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.entries.insert(TypeId::of::<T>(), service);
        self
    }

    /// Look up a service by type.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<T>())
    }

    /// Look up a service the flow cannot run without.
    ///
    /// # Errors
    ///
    /// Returns a [`FlowFailure`] naming the missing type.
    pub fn require<T: Any + Send + Sync>(&self) -> Result<&T, FlowFailure> {
        self.get::<T>().ok_or_else(|| {
            FlowFailure::new(format!(
                "required service {} is not registered",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Everything one flow step may use, assembled by the pipeline per resume.
///
/// The context exposes the flow's identity, the time of the current unit of
/// work, the service registry, and the flow's session table. Flows must read
/// time from [`now`](Self::now) rather than the system clock so that a
/// replayed step computes the same result.
pub struct FlowContext<'a> {
    identity: &'a FlowIdentity,
    flow_name: &'a str,
    now: DateTime<Utc>,
    services: &'a Services,
    sessions: &'a mut BTreeMap<SessionId, SessionState>,
    session_counter: &'a mut u64,
    manager: &'a SessionManager,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(
        identity: &'a FlowIdentity,
        flow_name: &'a str,
        now: DateTime<Utc>,
        services: &'a Services,
        sessions: &'a mut BTreeMap<SessionId, SessionState>,
        session_counter: &'a mut u64,
        manager: &'a SessionManager,
    ) -> Self {
        Self {
            identity,
            flow_name,
            now,
            services,
            sessions,
            session_counter,
            manager,
        }
    }

    /// The running flow.
    pub fn identity(&self) -> &FlowIdentity {
        self.identity
    }

    /// Time of the current unit of work.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The service registry.
    pub fn services(&self) -> &Services {
        self.services
    }

    /// Shorthand for `services().require::<T>()`.
    ///
    /// # Errors
    ///
    /// See [`Services::require`].
    pub fn service<T: Any + Send + Sync>(&self) -> Result<&T, FlowFailure> {
        self.services.require::<T>()
    }

    /// Open a session to `counterparty`.
    ///
    /// The id is derived from this flow's identity and its session counter,
    /// so replaying a step opens the same session. Nothing is sent until the
    /// flow sends or receives on it.
    pub fn open_session(&mut self, counterparty: impl Into<PartyId>) -> SessionId {
        self.manager.open(
            self.sessions,
            self.identity,
            self.session_counter,
            counterparty.into(),
            self.flow_name,
        )
    }

    /// Current state of one of this flow's sessions.
    pub fn session(&self, id: SessionId) -> Option<&SessionState> {
        self.sessions.get(&id)
    }

    /// All of this flow's sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use uuid::Uuid;

    #[derive(Debug, PartialEq)]
    struct Ledger(u32);

    #[test]
    fn services_are_looked_up_by_type() {
        let services = Services::new().with(Ledger(7)).with(String::from("vault"));
        assert_eq!(services.get::<Ledger>(), Some(&Ledger(7)));
        assert_eq!(services.get::<String>().map(String::as_str), Some("vault"));
        assert_eq!(services.len(), 2);
    }

    #[test]
    fn missing_required_service_is_a_flow_failure() {
        let services = Services::new();
        let err = services.require::<Ledger>().unwrap_err();
        assert!(err.message.contains("Ledger"), "{}", err.message);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let services = Services::new().with(Ledger(1)).with(Ledger(2));
        assert_eq!(services.get::<Ledger>(), Some(&Ledger(2)));
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn open_session_uses_and_advances_counter() {
        let identity = FlowIdentity::new("alice", Uuid::nil());
        let services = Services::new();
        let manager = SessionManager::default();
        let mut sessions = BTreeMap::new();
        let mut counter = 3;
        let mut ctx = FlowContext::new(
            &identity,
            "ping",
            Utc::now(),
            &services,
            &mut sessions,
            &mut counter,
            &manager,
        );

        let id = ctx.open_session("bob");
        assert_eq!(id, SessionId::derive(&identity, 3));
        assert_eq!(ctx.session(id).map(|s| s.status), Some(SessionStatus::Initiating));
        assert_eq!(ctx.sessions().count(), 1);
        drop(ctx);
        assert_eq!(counter, 4);
    }
}
