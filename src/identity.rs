//! Identity types for flows, parties, and sessions.
//!
//! All derived identifiers are UUID v5 values computed from a fixed
//! namespace, so the same inputs always map to the same id regardless of
//! which process (or which replay of a flow step) performs the mapping.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace UUID for deterministic id derivation.
const FLOW_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x71, 0x0e, 0x5a, 0x92, 0x4b, 0x4f, 0x1d, 0xa8, 0x37, 0x6e, 0xc2, 0x19, 0x5b, 0xd0, 0x44,
]);

/// Identifier of a party (a ledger participant that owns flows).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    /// Create a party id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the party id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Globally unique identity of one flow instance.
///
/// Composite of the owning party and a flow instance id. Immutable for the
/// life of the flow; used as the key for checkpoints, cache entries, worker
/// routing, and outbound record ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowIdentity {
    /// The party that owns (runs) this flow.
    pub party: PartyId,
    /// The flow instance id, unique within the party.
    pub flow_id: Uuid,
}

impl FlowIdentity {
    /// Build an identity from its parts.
    pub fn new(party: impl Into<PartyId>, flow_id: Uuid) -> Self {
        Self {
            party: party.into(),
            flow_id,
        }
    }

    /// Generate a fresh identity with a random (v4) flow id.
    ///
    /// Only used at flow-start time by callers; never inside a flow step,
    /// where ids must be deterministic.
    pub fn random(party: impl Into<PartyId>) -> Self {
        Self::new(party, Uuid::new_v4())
    }

    /// Derive the identity of the responder flow that a session initiation
    /// creates on `party`.
    ///
    /// Both sides can compute this without coordination, which lets the
    /// initiator address its first message before the responder exists.
    ///
    /// # Arguments
    ///
    /// * `party` - The counterparty that will run the responder flow.
    /// * `session` - The session being initiated.
    ///
    /// # Returns
    ///
    /// A deterministic identity `(party, uuid_v5("responder/<session>"))`.
    pub fn responder(party: &PartyId, session: &SessionId) -> Self {
        let name = format!("responder/{}", session.0);
        Self {
            party: party.clone(),
            flow_id: Uuid::new_v5(&FLOW_NAMESPACE, name.as_bytes()),
        }
    }
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.party, self.flow_id)
    }
}

/// Identifier of a session between two flows.
///
/// The same id is used by both ends of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Derive the `ordinal`-th session id opened by `owner`.
    ///
    /// The ordinal comes from the checkpoint's session counter, so a
    /// replayed step opens exactly the same session ids.
    pub fn derive(owner: &FlowIdentity, ordinal: u64) -> Self {
        let name = format!("session/{owner}/{ordinal}");
        Self(Uuid::new_v5(&FLOW_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Derive a deterministic UUID for an arbitrary scoped name.
///
/// Used for outbound record ids and external request ids, which are keyed
/// by `(identity, checkpoint version, index)`.
pub(crate) fn derived_uuid(scope: &str, identity: &FlowIdentity, version: u64, index: u64) -> Uuid {
    let name = format!("{scope}/{identity}/{version}/{index}");
    Uuid::new_v5(&FLOW_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice_flow() -> FlowIdentity {
        FlowIdentity::new("alice", Uuid::nil())
    }

    #[test]
    fn session_ids_are_deterministic_per_ordinal() {
        let owner = alice_flow();
        assert_eq!(SessionId::derive(&owner, 0), SessionId::derive(&owner, 0));
        assert_ne!(SessionId::derive(&owner, 0), SessionId::derive(&owner, 1));
    }

    #[test]
    fn session_ids_differ_across_owners() {
        let a = FlowIdentity::new("alice", Uuid::nil());
        let b = FlowIdentity::new("bob", Uuid::nil());
        assert_ne!(SessionId::derive(&a, 0), SessionId::derive(&b, 0));
    }

    #[test]
    fn responder_identity_is_computable_by_both_sides() {
        let session = SessionId::derive(&alice_flow(), 0);
        let bob = PartyId::new("bob");
        let left = FlowIdentity::responder(&bob, &session);
        let right = FlowIdentity::responder(&bob, &session);
        assert_eq!(left, right);
        assert_eq!(left.party, bob);
    }

    #[test]
    fn identity_display_is_party_slash_flow() {
        let id = alice_flow();
        assert_eq!(id.to_string(), format!("alice/{}", Uuid::nil()));
    }

    #[test]
    fn derived_uuid_depends_on_every_component() {
        let id = alice_flow();
        let base = derived_uuid("record", &id, 1, 0);
        assert_eq!(base, derived_uuid("record", &id, 1, 0));
        assert_ne!(base, derived_uuid("record", &id, 2, 0));
        assert_ne!(base, derived_uuid("record", &id, 1, 1));
        assert_ne!(base, derived_uuid("request", &id, 1, 0));
    }

    #[test]
    fn party_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&PartyId::new("carol")).expect("serialize");
        assert_eq!(json, "\"carol\"");
    }
}
