//! Fiber cache: a bounded arena of warm fibers with an identity index.
//!
//! The cache only saves deserialization work. A miss is always answered
//! by rebuilding the fiber from the checkpoint store, so any entry may be
//! dropped at any time. Eviction triggers:
//!
//! - capacity: the least recently used entry goes when a new one arrives;
//! - idle expiry: [`FiberCache::sweep_idle`] drops untouched entries;
//! - terminal states: a fiber whose checkpoint is terminal is never stored;
//! - explicit removal by identity or by owning party (operator actions,
//!   version conflicts, publish failures).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

use crate::config::CacheConfig;
use crate::fiber::FlowFiber;
use crate::identity::{FlowIdentity, PartyId};

struct Slot {
    identity: FlowIdentity,
    fiber: FlowFiber,
    last_used: u64,
    touched_at: Instant,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<FlowIdentity, usize>,
    clock: u64,
    stats: CacheStats,
}

impl Arena {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn release(&mut self, at: usize) -> Option<Slot> {
        let slot = self.slots.get_mut(at)?.take()?;
        self.index.remove(&slot.identity);
        self.free.push(at);
        Some(slot)
    }

    fn least_recently_used(&self) -> Option<usize> {
        self.index
            .values()
            .copied()
            .min_by_key(|&at| self.slots[at].as_ref().map_or(u64::MAX, |s| s.last_used))
    }
}

/// Hit, miss, and eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries dropped for capacity or idleness.
    pub evictions: u64,
}

/// Bounded, identity-keyed cache of [`FlowFiber`]s.
///
/// Returns clones, so callers can run a step on their copy and only write
/// it back once the step has been persisted.
pub struct FiberCache {
    config: CacheConfig,
    arena: Mutex<Arena>,
}

impl FiberCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            arena: Mutex::new(Arena::default()),
        }
    }

    /// Look up the fiber for `identity`.
    pub fn get(&self, identity: &FlowIdentity) -> Option<FlowFiber> {
        let mut arena = self.lock();
        let Some(at) = arena.index.get(identity).copied() else {
            arena.stats.misses += 1;
            return None;
        };
        let tick = arena.tick();
        let slot = arena.slots[at].as_mut()?;
        slot.last_used = tick;
        slot.touched_at = Instant::now();
        let fiber = slot.fiber.clone();
        arena.stats.hits += 1;
        Some(fiber)
    }

    /// Store `fiber` under `identity`, replacing any previous entry.
    ///
    /// A fiber whose checkpoint is terminal is not stored; any existing
    /// entry for the identity is removed instead. With a capacity of zero
    /// nothing is ever stored.
    pub fn put(&self, identity: FlowIdentity, fiber: FlowFiber) {
        if fiber.checkpoint().is_terminal() || self.config.capacity == 0 {
            self.remove(&identity);
            return;
        }
        let mut arena = self.lock();
        let tick = arena.tick();
        let slot = Slot {
            identity: identity.clone(),
            fiber,
            last_used: tick,
            touched_at: Instant::now(),
        };
        if let Some(at) = arena.index.get(&identity).copied() {
            arena.slots[at] = Some(slot);
            return;
        }
        if arena.index.len() >= self.config.capacity
            && let Some(victim) = arena.least_recently_used()
            && let Some(evicted) = arena.release(victim)
        {
            arena.stats.evictions += 1;
            debug!(flow = %evicted.identity, "fiber evicted for capacity");
        }
        let at = match arena.free.pop() {
            Some(at) => {
                arena.slots[at] = Some(slot);
                at
            }
            None => {
                arena.slots.push(Some(slot));
                arena.slots.len() - 1
            }
        };
        arena.index.insert(identity, at);
    }

    /// Remove the entry for `identity`.
    ///
    /// # Returns
    ///
    /// `true` if an entry was removed.
    pub fn remove(&self, identity: &FlowIdentity) -> bool {
        let mut arena = self.lock();
        match arena.index.get(identity).copied() {
            Some(at) => arena.release(at).is_some(),
            None => false,
        }
    }

    /// Remove every entry owned by one of `parties`.
    ///
    /// # Returns
    ///
    /// How many entries were removed.
    pub fn remove_parties<'a>(&self, parties: impl IntoIterator<Item = &'a PartyId>) -> usize {
        let parties: Vec<&PartyId> = parties.into_iter().collect();
        let mut arena = self.lock();
        let doomed: Vec<usize> = arena
            .index
            .iter()
            .filter(|(identity, _)| parties.contains(&&identity.party))
            .map(|(_, &at)| at)
            .collect();
        let removed = doomed.iter().filter(|&&at| arena.release(at).is_some()).count();
        if removed > 0 {
            debug!(removed, "fibers evicted for parties");
        }
        removed
    }

    /// Drop entries untouched for longer than the configured idle expiry.
    ///
    /// # Returns
    ///
    /// How many entries were dropped.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    fn sweep_idle_at(&self, now: Instant) -> usize {
        let expiry = self.config.idle_expiry;
        let mut arena = self.lock();
        let stale: Vec<usize> = arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(at, slot)| {
                let slot = slot.as_ref()?;
                (now.saturating_duration_since(slot.touched_at) >= expiry).then_some(at)
            })
            .collect();
        let removed = stale.iter().filter(|&&at| arena.release(at).is_some()).count();
        arena.stats.evictions += removed as u64;
        removed
    }

    /// Returns `true` if `identity` has an entry.
    pub fn contains(&self, identity: &FlowIdentity) -> bool {
        self.lock().index.contains_key(identity)
    }

    /// Number of resident fibers.
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    /// Returns `true` if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters since creation.
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for FiberCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberCache")
            .field("capacity", &self.config.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FlowStatus;
    use crate::context::FlowContext;
    use crate::error::FlowFailure;
    use crate::flow::{Flow, FlowRegistry, FlowResume, FlowStep};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Idle;

    impl Flow for Idle {
        const NAME: &'static str = "idle";

        fn resume(&mut self, _ctx: &mut FlowContext<'_>, _input: FlowResume) -> Result<FlowStep, FlowFailure> {
            Ok(FlowStep::Complete(serde_json::Value::Null))
        }
    }

    fn fiber(party: &str, n: u128) -> (FlowIdentity, FlowFiber) {
        let identity = FlowIdentity::new(party, Uuid::from_u128(n));
        let registry = FlowRegistry::new().register::<Idle>();
        let fiber = FlowFiber::create(&registry, identity.clone(), "idle", Utc::now()).expect("create");
        (identity, fiber)
    }

    fn cache(capacity: usize) -> FiberCache {
        FiberCache::new(CacheConfig {
            capacity,
            idle_expiry: Duration::from_secs(60),
        })
    }

    #[test]
    fn get_after_put_returns_fiber() {
        let cache = cache(4);
        let (id, fiber) = fiber("alice", 1);
        cache.put(id.clone(), fiber);
        assert_eq!(cache.get(&id).map(|f| f.identity().clone()), Some(id));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn miss_is_counted() {
        let cache = cache(4);
        let (id, _) = fiber("alice", 1);
        assert!(cache.get(&id).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn least_recently_used_is_evicted_at_capacity() {
        let cache = cache(2);
        let (a, fa) = fiber("alice", 1);
        let (b, fb) = fiber("alice", 2);
        let (c, fc) = fiber("alice", 3);
        cache.put(a.clone(), fa);
        cache.put(b.clone(), fb);
        cache.get(&a);
        cache.put(c.clone(), fc);

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn replacing_an_entry_does_not_evict() {
        let cache = cache(1);
        let (a, fa) = fiber("alice", 1);
        cache.put(a.clone(), fa.clone());
        cache.put(a.clone(), fa);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn terminal_fiber_is_never_cached() {
        let cache = cache(4);
        let (id, mut fiber) = fiber("alice", 1);
        cache.put(id.clone(), fiber.clone());
        fiber.checkpoint_mut().status = FlowStatus::Killed;
        cache.put(id.clone(), fiber);
        assert!(!cache.contains(&id));
        assert!(cache.get(&id).is_none());
    }

    #[test]
    fn remove_parties_only_touches_listed_parties() {
        let cache = cache(8);
        for (party, n) in [("alice", 1), ("alice", 2), ("bob", 3), ("carol", 4)] {
            let (id, f) = fiber(party, n);
            cache.put(id, f);
        }
        let removed = cache.remove_parties([&PartyId::new("alice"), &PartyId::new("carol")]);
        assert_eq!(removed, 3);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&FlowIdentity::new("bob", Uuid::from_u128(3))));
    }

    #[test]
    fn freed_slots_are_reused() {
        let cache = cache(8);
        let (a, fa) = fiber("alice", 1);
        let (b, fb) = fiber("alice", 2);
        cache.put(a.clone(), fa);
        assert!(cache.remove(&a));
        assert!(!cache.remove(&a));
        cache.put(b.clone(), fb);
        assert_eq!(cache.lock().slots.len(), 1);
    }

    #[test]
    fn idle_entries_are_swept() {
        let cache = cache(8);
        let (a, fa) = fiber("alice", 1);
        cache.put(a.clone(), fa);
        assert_eq!(cache.sweep_idle_at(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(cache.sweep_idle_at(later), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let cache = cache(0);
        let (a, fa) = fiber("alice", 1);
        cache.put(a.clone(), fa);
        assert!(cache.is_empty());
    }
}
