//! LRU cache of replay deciders with per-execution leases

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::{CacheError, EvictionPolicy};
use crate::history::{HistoryEvent, WorkflowExecutionKey};
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::replay::{RegistryError, ReplayDecider, SelfEviction};

struct DeciderSlot {
    decider: Arc<AsyncMutex<ReplayDecider>>,
    evicted: AtomicBool,
}

impl DeciderSlot {
    fn new(decider: ReplayDecider) -> Self {
        Self {
            decider: Arc::new(AsyncMutex::new(decider)),
            evicted: AtomicBool::new(false),
        }
    }

    fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Mark evicted and close now if nobody is driving the decider
    ///
    /// A holder closes it on release otherwise.
    fn tear_down(&self) {
        self.evicted.store(true, Ordering::Release);
        if let Ok(mut decider) = self.decider.try_lock() {
            decider.close();
        }
    }
}

struct CacheEntry {
    slot: Arc<DeciderSlot>,
    /// Tasks holding or waiting for the slot
    users: usize,
}

struct CacheInner {
    entries: Mutex<LruCache<WorkflowExecutionKey, CacheEntry>>,
    /// Per-key gates held while a freshly built decider is leased
    builds: Mutex<HashMap<WorkflowExecutionKey, Arc<AsyncMutex<()>>>>,
    capacity: usize,
    policy: EvictionPolicy,
    metrics: Arc<dyn MetricsSink>,
}

/// Bounded LRU cache of deciders keyed by workflow execution
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct DeciderCache {
    inner: Arc<CacheInner>,
}

impl DeciderCache {
    pub fn new(capacity: usize, policy: EvictionPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(LruCache::unbounded()),
                builds: Mutex::new(HashMap::new()),
                capacity,
                policy,
                metrics,
            }),
        }
    }

    /// Cache with the default eviction policy and no metrics
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, EvictionPolicy::default(), Arc::new(NoopMetrics))
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.inner.policy
    }

    /// Number of cached deciders
    pub fn size(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn contains(&self, key: &WorkflowExecutionKey) -> bool {
        self.inner.entries.lock().contains(key)
    }

    /// Lease the decider for `key`
    ///
    /// A window starting at event 1 always gets a freshly built decider and
    /// drops any stale entry for the key; the fresh decider is not cached
    /// until [`add_to_cache`](Self::add_to_cache). Fresh builds for one key
    /// are serialized: a second full-history caller waits until the first
    /// lease is released. Any other window is served from the cache only,
    /// waiting while another task holds the decider.
    pub async fn get_or_create<F>(
        &self,
        key: &WorkflowExecutionKey,
        window: &[HistoryEvent],
        build: F,
    ) -> Result<DeciderLease, CacheError>
    where
        F: FnOnce() -> Result<ReplayDecider, RegistryError>,
    {
        let full_history = window.first().is_some_and(|event| event.event_id == 1);

        if full_history {
            let gate = self.lock_build(key).await;
            let decider = build()?;
            self.invalidate(key, "full history received");
            self.inner.metrics.increment(names::STICKY_CACHE_MISS, 1);

            let slot = Arc::new(DeciderSlot::new(decider));
            let guard = slot.decider.clone().lock_owned().await;
            let mut lease = DeciderLease::new(self.clone(), key.clone(), slot, guard, false);
            lease.build_gate = Some(gate);
            return Ok(lease);
        }

        let slot = self.inner.entries.lock().get_mut(key).map(|entry| {
            entry.users += 1;
            entry.slot.clone()
        });

        let Some(slot) = slot else {
            self.inner.metrics.increment(names::STICKY_CACHE_MISS, 1);
            return Err(CacheError::MissingDecider(key.clone()));
        };

        self.inner.metrics.increment(names::STICKY_CACHE_HIT, 1);
        let mut guard = slot.decider.clone().lock_owned().await;

        if slot.is_evicted() {
            guard.close();
            drop(guard);
            self.release_user(key, &slot);
            debug!(workflow_id = %key.workflow_id(), "cached decider evicted while waiting");
            return Err(CacheError::Evicted(key.clone()));
        }

        Ok(DeciderLease::new(self.clone(), key.clone(), slot, guard, true))
    }

    /// Insert or refresh the leased decider
    ///
    /// Makes room by evicting the least recently used idle entries. Returns
    /// false, and closes the decider, if it could not be cached.
    pub fn add_to_cache(&self, mut lease: DeciderLease) -> bool {
        let key = lease.release.key.clone();
        let slot = lease.release.slot.clone();
        let mut victims = Vec::new();

        let cached = {
            let mut entries = self.inner.entries.lock();
            if slot.is_evicted() || self.inner.capacity == 0 {
                false
            } else if lease.release.cached {
                entries
                    .get(&key)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.slot, &slot))
            } else {
                if let Some(stale) = entries.pop(&key) {
                    victims.push((key.clone(), stale.slot));
                }
                while entries.len() >= self.inner.capacity {
                    let Some(victim) = least_recent_idle(&entries, None) else {
                        break;
                    };
                    if let Some(entry) = entries.pop(&victim) {
                        victims.push((victim, entry.slot));
                    }
                }
                if entries.len() < self.inner.capacity {
                    entries.put(
                        key.clone(),
                        CacheEntry {
                            slot: slot.clone(),
                            users: 1,
                        },
                    );
                    lease.release.cached = true;
                    true
                } else {
                    false
                }
            }
        };

        for (victim, slot) in victims {
            debug!(workflow_id = %victim.workflow_id(), "evicting decider to make room");
            slot.tear_down();
            self.inner.metrics.increment(names::STICKY_CACHE_EVICTION, 1);
        }

        if !cached {
            debug!(workflow_id = %key.workflow_id(), "decider not cached");
            lease.guard.close();
        }
        self.report_size();
        cached
    }

    /// Release a lease without caching anything new
    pub fn mark_processing_done(&self, lease: DeciderLease) {
        drop(lease);
    }

    /// Remove and close the decider for `key`, if cached
    pub fn invalidate(&self, key: &WorkflowExecutionKey, reason: &str) {
        let removed = self.inner.entries.lock().pop(key);
        if let Some(entry) = removed {
            warn!(
                workflow_id = %key.workflow_id(),
                run_id = %key.run_id(),
                reason,
                "invalidating cached decider"
            );
            entry.slot.tear_down();
            self.inner.metrics.increment(names::STICKY_CACHE_EVICTION, 1);
            self.report_size();
        }
    }

    /// Close the leased decider and make sure it is never reused
    pub fn invalidate_lease(&self, mut lease: DeciderLease, reason: &str) {
        let key = lease.release.key.clone();
        let slot = lease.release.slot.clone();
        slot.evicted.store(true, Ordering::Release);

        let removed = {
            let mut entries = self.inner.entries.lock();
            let owned = entries
                .peek(&key)
                .is_some_and(|entry| Arc::ptr_eq(&entry.slot, &slot));
            owned && entries.pop(&key).is_some()
        };

        lease.guard.close();
        if removed {
            warn!(
                workflow_id = %key.workflow_id(),
                run_id = %key.run_id(),
                reason,
                "invalidating cached decider"
            );
            self.inner.metrics.increment(names::STICKY_CACHE_EVICTION, 1);
            self.report_size();
        }
    }

    /// Evict every entry
    pub fn invalidate_all(&self) {
        let drained: Vec<(WorkflowExecutionKey, CacheEntry)> = {
            let mut entries = self.inner.entries.lock();
            std::iter::from_fn(|| entries.pop_lru()).collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "invalidating all cached deciders");
        for (_, entry) in drained {
            entry.slot.tear_down();
        }
        self.report_size();
    }

    fn release_user(&self, key: &WorkflowExecutionKey, slot: &Arc<DeciderSlot>) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.peek_mut(key) {
            if Arc::ptr_eq(&entry.slot, slot) {
                entry.users = entry.users.saturating_sub(1);
            }
        }
    }

    async fn lock_build(&self, key: &WorkflowExecutionKey) -> BuildGate {
        let gate = self
            .inner
            .builds
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let mut build = BuildGate {
            cache: self.clone(),
            key: key.clone(),
            gate,
            guard: None,
        };
        build.guard = Some(build.gate.clone().lock_owned().await);
        build
    }

    fn report_size(&self) {
        let size = self.size();
        self.inner.metrics.gauge(names::STICKY_CACHE_SIZE, size as f64);
    }
}

impl SelfEviction for DeciderCache {
    fn evict_any_not_in_processing(&self, except: &WorkflowExecutionKey) -> bool {
        if self.inner.policy == EvictionPolicy::CapacityOnly {
            return false;
        }

        let evicted = {
            let mut entries = self.inner.entries.lock();
            least_recent_idle(&entries, Some(except))
                .and_then(|victim| entries.pop(&victim).map(|entry| (victim, entry)))
        };

        match evicted {
            Some((victim, entry)) => {
                warn!(
                    workflow_id = %victim.workflow_id(),
                    requested_by = %except.workflow_id(),
                    "evicting idle decider to free workflow threads"
                );
                entry.slot.tear_down();
                self.inner
                    .metrics
                    .increment(names::STICKY_CACHE_THREAD_FORCED_EVICTION, 1);
                self.report_size();
                true
            }
            None => {
                self.inner.metrics.increment(names::STICKY_CACHE_STALL, 1);
                false
            }
        }
    }
}

impl fmt::Debug for DeciderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeciderCache")
            .field("capacity", &self.inner.capacity)
            .field("size", &self.size())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

fn least_recent_idle(
    entries: &LruCache<WorkflowExecutionKey, CacheEntry>,
    except: Option<&WorkflowExecutionKey>,
) -> Option<WorkflowExecutionKey> {
    entries
        .iter()
        .rev()
        .find(|(key, entry)| entry.users == 0 && Some(*key) != except)
        .map(|(key, _)| key.clone())
}

/// Decrements the entry's user count once the guard is gone
struct LeaseRelease {
    cache: DeciderCache,
    key: WorkflowExecutionKey,
    slot: Arc<DeciderSlot>,
    cached: bool,
}

impl Drop for LeaseRelease {
    fn drop(&mut self) {
        if self.cached {
            self.cache.release_user(&self.key, &self.slot);
        }
    }
}

/// Exclusive right to build a fresh decider for one key
struct BuildGate {
    cache: DeciderCache,
    key: WorkflowExecutionKey,
    gate: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BuildGate {
    fn drop(&mut self) {
        self.guard = None;
        let mut builds = self.cache.inner.builds.lock();
        // The map and this gate hold the only references when nobody waits.
        let idle = builds
            .get(&self.key)
            .is_some_and(|gate| Arc::ptr_eq(gate, &self.gate) && Arc::strong_count(gate) == 2);
        if idle {
            builds.remove(&self.key);
        }
    }
}

/// Exclusive access to one execution's decider
///
/// Dropping the lease releases the decider. If the decider was evicted
/// while leased, it is closed on release.
pub struct DeciderLease {
    // Field order matters: the guard is dropped before the user count
    // is released.
    guard: OwnedMutexGuard<ReplayDecider>,
    release: LeaseRelease,
    build_gate: Option<BuildGate>,
}

impl DeciderLease {
    fn new(
        cache: DeciderCache,
        key: WorkflowExecutionKey,
        slot: Arc<DeciderSlot>,
        guard: OwnedMutexGuard<ReplayDecider>,
        cached: bool,
    ) -> Self {
        Self {
            guard,
            release: LeaseRelease {
                cache,
                key,
                slot,
                cached,
            },
            build_gate: None,
        }
    }

    pub fn key(&self) -> &WorkflowExecutionKey {
        &self.release.key
    }

    /// Whether the decider came from (or was added to) the cache
    pub fn is_cached(&self) -> bool {
        self.release.cached
    }
}

impl Deref for DeciderLease {
    type Target = ReplayDecider;

    fn deref(&self) -> &ReplayDecider {
        &self.guard
    }
}

impl DerefMut for DeciderLease {
    fn deref_mut(&mut self) -> &mut ReplayDecider {
        &mut self.guard
    }
}

impl Drop for DeciderLease {
    fn drop(&mut self) {
        if self.release.slot.is_evicted() {
            self.guard.close();
        }
    }
}

impl fmt::Debug for DeciderLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeciderLease")
            .field("key", &self.release.key)
            .field("cached", &self.release.cached)
            .finish()
    }
}
