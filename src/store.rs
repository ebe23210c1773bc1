//! Checkpoint store contract and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

use crate::checkpoint::FlowCheckpoint;
use crate::error::StoreError;
use crate::identity::{FlowIdentity, PartyId};

/// Durable storage for flow checkpoints, keyed by [`FlowIdentity`].
///
/// Saves are optimistically versioned: a save must carry exactly the stored
/// version plus one, or version 1 when nothing is stored. Anything else is
/// rejected with [`StoreError::VersionConflict`] and leaves the store
/// untouched.
///
/// Deleting a checkpoint leaves a tombstone holding its last version, so a
/// finished flow is never mistaken for one that never started. Versioning
/// continues from the tombstone: a fresh version 1 for that identity is a
/// conflict.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Persist `checkpoint` as the new version of its flow.
    ///
    /// # Errors
    ///
    /// [`StoreError::VersionConflict`] on a version mismatch; transient
    /// errors when the backing store is unavailable.
    async fn save(&self, checkpoint: &FlowCheckpoint) -> Result<(), StoreError>;

    /// Load the latest checkpoint of a flow.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if the flow has no checkpoint.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] if the stored bytes do not decode;
    /// transient errors when the backing store is unavailable.
    async fn load(&self, identity: &FlowIdentity) -> Result<Option<FlowCheckpoint>, StoreError>;

    /// Remove a flow's checkpoint and leave a tombstone in its place.
    /// Removing a missing checkpoint succeeds and leaves any existing
    /// tombstone as it is.
    ///
    /// # Errors
    ///
    /// Transient errors when the backing store is unavailable.
    async fn delete(&self, identity: &FlowIdentity) -> Result<(), StoreError>;

    /// Last version of a deleted checkpoint.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if no checkpoint of this flow was ever deleted, or if a
    /// newer checkpoint has been saved since.
    ///
    /// # Errors
    ///
    /// Transient errors when the backing store is unavailable.
    async fn tombstone(&self, identity: &FlowIdentity) -> Result<Option<u64>, StoreError>;

    /// All readable checkpoints, optionally only those of one party, ordered
    /// by identity. Checkpoints that do not decode are skipped with a
    /// warning; [`load`](Self::load) reports them individually.
    ///
    /// # Errors
    ///
    /// Transient errors when the backing store is unavailable.
    async fn list(&self, party: Option<&PartyId>) -> Result<Vec<FlowCheckpoint>, StoreError>;
}

/// Check the optimistic versioning rule.
pub(crate) fn check_version(
    identity: &FlowIdentity,
    stored: Option<u64>,
    attempted: u64,
) -> Result<(), StoreError> {
    let stored = stored.unwrap_or(0);
    if attempted == stored + 1 {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            identity: identity.clone(),
            attempted,
            stored,
        })
    }
}

/// Decode stored bytes, reporting failures as [`StoreError::Corrupt`].
fn decode(identity: &FlowIdentity, version: u64, bytes: &[u8]) -> Result<FlowCheckpoint, StoreError> {
    FlowCheckpoint::from_bytes(bytes).map_err(|e| StoreError::Corrupt {
        identity: identity.clone(),
        version,
        reason: e.to_string(),
    })
}

/// Checkpoint store held in process memory.
///
/// Checkpoints are kept in their encoded form, so every load decodes, as a
/// real store would. Supports failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<FlowIdentity, StoredEntry>,
    tombstones: BTreeMap<FlowIdentity, u64>,
    fail_next: u32,
    fail_always: bool,
}

#[derive(Debug)]
struct StoredEntry {
    version: u64,
    bytes: Vec<u8>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints, not counting tombstones.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next `n` operations with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Fail every operation until [`heal`](Self::heal) is called.
    pub fn fail_always(&self) {
        self.lock().fail_always = true;
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.fail_next = 0;
        state.fail_always = false;
    }

    /// Overwrite the stored bytes of a flow, bypassing versioning.
    ///
    /// For simulating corruption in tests.
    pub fn put_raw(&self, identity: FlowIdentity, version: u64, bytes: Vec<u8>) {
        self.lock()
            .entries
            .insert(identity, StoredEntry { version, bytes });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.lock();
        if state.fail_always {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &FlowCheckpoint) -> Result<(), StoreError> {
        let bytes = checkpoint.to_bytes()?;
        let mut state = self.guard()?;
        let stored = state
            .entries
            .get(&checkpoint.identity)
            .map(|e| e.version)
            .or_else(|| state.tombstones.get(&checkpoint.identity).copied());
        check_version(&checkpoint.identity, stored, checkpoint.version)?;
        state.tombstones.remove(&checkpoint.identity);
        state.entries.insert(
            checkpoint.identity.clone(),
            StoredEntry {
                version: checkpoint.version,
                bytes,
            },
        );
        Ok(())
    }

    async fn load(&self, identity: &FlowIdentity) -> Result<Option<FlowCheckpoint>, StoreError> {
        let state = self.guard()?;
        match state.entries.get(identity) {
            Some(entry) => decode(identity, entry.version, &entry.bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, identity: &FlowIdentity) -> Result<(), StoreError> {
        let mut state = self.guard()?;
        if let Some(entry) = state.entries.remove(identity) {
            state.tombstones.insert(identity.clone(), entry.version);
        }
        Ok(())
    }

    async fn tombstone(&self, identity: &FlowIdentity) -> Result<Option<u64>, StoreError> {
        Ok(self.guard()?.tombstones.get(identity).copied())
    }

    async fn list(&self, party: Option<&PartyId>) -> Result<Vec<FlowCheckpoint>, StoreError> {
        let state = self.guard()?;
        let checkpoints: Vec<FlowCheckpoint> = state
            .entries
            .iter()
            .filter(|(identity, _)| party.is_none_or(|p| identity.party == *p))
            .filter_map(|(identity, entry)| match decode(identity, entry.version, &entry.bytes) {
                Ok(checkpoint) => Some(checkpoint),
                Err(err) => {
                    warn!(flow = %identity, error = %err, "unreadable checkpoint skipped");
                    None
                }
            })
            .collect();
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn checkpoint(party: &str, n: u128, version: u64) -> FlowCheckpoint {
        let mut cp = FlowCheckpoint::new(FlowIdentity::new(party, Uuid::from_u128(n)), "f", Utc::now());
        cp.version = version;
        cp
    }

    #[tokio::test]
    async fn save_then_load_returns_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("alice", 1, 1);
        store.save(&cp).await.expect("save");
        assert_eq!(store.load(&cp.identity).await.expect("load"), Some(cp));
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let store = InMemoryCheckpointStore::new();
        let id = FlowIdentity::new("alice", Uuid::nil());
        assert_eq!(store.load(&id).await.expect("load"), None);
    }

    #[tokio::test]
    async fn first_save_must_be_version_one() {
        let store = InMemoryCheckpointStore::new();
        let err = store.save(&checkpoint("alice", 1, 2)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                attempted: 2,
                stored: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stale_or_skipping_saves_are_rejected() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("alice", 1, 1)).await.expect("v1");
        store.save(&checkpoint("alice", 1, 2)).await.expect("v2");
        assert!(store.save(&checkpoint("alice", 1, 2)).await.is_err(), "stale");
        assert!(store.save(&checkpoint("alice", 1, 4)).await.is_err(), "skip");
        let stored = store
            .load(&FlowIdentity::new("alice", Uuid::from_u128(1)))
            .await
            .expect("load")
            .expect("present");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("alice", 1, 1);
        store.save(&cp).await.expect("save");
        store.delete(&cp.identity).await.expect("delete");
        store.delete(&cp.identity).await.expect("delete again");
        assert!(store.is_empty());
        assert_eq!(store.tombstone(&cp.identity).await.expect("tombstone"), Some(1));
    }

    #[tokio::test]
    async fn tombstone_blocks_a_fresh_first_version() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("alice", 1, 1)).await.expect("v1");
        store.save(&checkpoint("alice", 1, 2)).await.expect("v2");
        let id = FlowIdentity::new("alice", Uuid::from_u128(1));
        store.delete(&id).await.expect("delete");
        assert_eq!(store.load(&id).await.expect("load"), None);

        let err = store.save(&checkpoint("alice", 1, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                attempted: 1,
                stored: 2,
                ..
            }
        ));
        store.save(&checkpoint("alice", 1, 3)).await.expect("continues from tombstone");
        assert_eq!(store.tombstone(&id).await.expect("tombstone"), None);
    }

    #[tokio::test]
    async fn never_deleted_flow_has_no_tombstone() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("alice", 1, 1);
        assert_eq!(store.tombstone(&cp.identity).await.expect("tombstone"), None);
        store.save(&cp).await.expect("save");
        assert_eq!(store.tombstone(&cp.identity).await.expect("tombstone"), None);
    }

    #[tokio::test]
    async fn list_filters_by_party() {
        let store = InMemoryCheckpointStore::new();
        for (party, n) in [("alice", 1), ("bob", 2), ("alice", 3)] {
            store.save(&checkpoint(party, n, 1)).await.expect("save");
        }
        assert_eq!(store.list(None).await.expect("all").len(), 3);
        let alice = store.list(Some(&PartyId::new("alice"))).await.expect("alice");
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|cp| cp.identity.party.as_str() == "alice"));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = InMemoryCheckpointStore::new();
        store.fail_next(1);
        let err = store.load(&FlowIdentity::new("alice", Uuid::nil())).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.load(&FlowIdentity::new("alice", Uuid::nil())).await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_bytes_surface_with_their_version() {
        let store = InMemoryCheckpointStore::new();
        let id = FlowIdentity::new("alice", Uuid::nil());
        store.put_raw(id.clone(), 4, b"not json".to_vec());
        assert!(matches!(
            store.load(&id).await,
            Err(StoreError::Corrupt { version: 4, ref identity, .. }) if *identity == id
        ));
    }

    #[tokio::test]
    async fn list_skips_corrupt_checkpoints() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("alice", 1, 1)).await.expect("save");
        store.put_raw(FlowIdentity::new("alice", Uuid::from_u128(2)), 1, b"{".to_vec());
        let listed = store.list(None).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity.flow_id, Uuid::from_u128(1));
    }
}
