//! Pipeline table: `PipelineKey` -> single-flight build slot.
//!
//! The first caller to miss on a key inserts a `Pending` slot while holding the write lock (the
//! claim), releases the lock, and then runs the build callback with a [`BuildTicket`]. Every
//! later caller finds the claimed slot and never starts a second build. The ticket publishes the
//! result into the slot, either on the claiming thread or later from a pool worker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::config::FailurePolicy;
use crate::error::BuildError;
use crate::pipeline_key::PipelineKey;
use crate::slot::{Slot, SlotStatus};
use crate::stats::{PipelineCacheStats, PipelineTableCounters};

type PipelineSlot<A> = Slot<Arc<A>, BuildError>;

pub(crate) type PipelineMap<A> = HashMap<PipelineKey, Arc<PipelineSlot<A>>>;

/// Called once with the key after the claiming build succeeds.
pub type FirstBuildHook = Box<dyn FnOnce(&PipelineKey) + Send + 'static>;

#[derive(Debug, Default)]
struct TableShared {
    /// Bumped by every clear; tickets from an older generation do not notify.
    generation: AtomicU64,
    counters: PipelineTableCounters,
}

/// Shared reference to one pipeline slot.
pub struct PipelineHandle<A> {
    key: PipelineKey,
    slot: Arc<PipelineSlot<A>>,
}

impl<A> PipelineHandle<A> {
    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn status(&self) -> SlotStatus {
        self.slot.status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == SlotStatus::Ready
    }

    /// Non-blocking; `None` while the build is in flight.
    pub fn try_get(&self) -> Option<Result<Arc<A>, BuildError>> {
        self.slot.try_get()
    }

    /// Blocks until the build has published.
    pub fn wait(&self) -> Result<Arc<A>, BuildError> {
        self.slot.wait()
    }

    /// True if both handles refer to the same cache entry.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<A> Clone for PipelineHandle<A> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<A> fmt::Debug for PipelineHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("key", &self.key)
            .field("status", &self.slot.status())
            .finish()
    }
}

#[derive(Debug)]
pub struct PipelineLookup<A> {
    pub handle: PipelineHandle<A>,
    /// `true` unless this call found the pipeline already `Ready`.
    ///
    /// A hint for fallback decisions (e.g. skipping a draw), not a consistency signal.
    pub cache_miss: bool,
}

/// Completion callback handed to the build function of a claimed key.
///
/// Exactly one ticket exists per claim. Dropping it without calling [`BuildTicket::complete`]
/// publishes [`BuildError::Abandoned`].
pub struct BuildTicket<A> {
    key: PipelineKey,
    slot: Arc<PipelineSlot<A>>,
    shared: Arc<TableShared>,
    generation: u64,
    on_first_build: Option<FirstBuildHook>,
    completed: bool,
}

impl<A> BuildTicket<A> {
    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn set_first_build_hook(&mut self, hook: FirstBuildHook) {
        self.on_first_build = Some(hook);
    }

    /// Publishes the build result and, on success, runs the first-build hook.
    ///
    /// The hook is skipped when the table was cleared after this ticket's claim. The generation
    /// is checked without the table lock and the hook runs unlocked, so a `clear` that lands after
    /// the check still sees the notification for the detached entry. At most one notification is
    /// sent per claim either way.
    pub fn complete(mut self, result: Result<A, BuildError>) {
        self.completed = true;
        let counters = &self.shared.counters;

        let succeeded = match &result {
            Ok(_) => {
                counters.inc_builds_succeeded();
                debug!(
                    vs = self.key.vertex_program_id.0,
                    fs = self.key.fragment_program_id.0,
                    "pipeline build completed"
                );
                true
            }
            Err(err) => {
                counters.inc_builds_failed();
                warn!(
                    vs = self.key.vertex_program_id.0,
                    fs = self.key.fragment_program_id.0,
                    %err,
                    "pipeline build failed"
                );
                false
            }
        };
        self.slot.publish(result.map(Arc::new));

        let Some(hook) = self.on_first_build.take() else {
            return;
        };
        if !succeeded {
            return;
        }
        if self.shared.generation.load(Ordering::Acquire) != self.generation {
            debug!("pipeline built before a cache clear; skipping first-build notification");
            return;
        }
        counters.inc_first_build_notifications();
        hook(&self.key);
    }
}

impl<A> Drop for BuildTicket<A> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.shared.counters.inc_builds_failed();
        warn!(
            vs = self.key.vertex_program_id.0,
            fs = self.key.fragment_program_id.0,
            "pipeline build abandoned"
        );
        self.slot.publish(Err(BuildError::Abandoned));
    }
}

impl<A> fmt::Debug for BuildTicket<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildTicket")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

pub struct PipelineTable<A> {
    entries: RwLock<PipelineMap<A>>,
    shared: Arc<TableShared>,
    failure_policy: FailurePolicy,
}

impl<A> PipelineTable<A> {
    pub fn new(failure_policy: FailurePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            shared: Arc::new(TableShared::default()),
            failure_policy,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Returns the pipeline for `key`, claiming it and calling `build` on a miss.
    ///
    /// `try_fast_path` allows a shared-lock lookup first; callers pass `true` when both programs
    /// were already cached, which makes a hit likely. `build` is called at most once per claim,
    /// after the table lock has been released, and owns the only [`BuildTicket`] for the key.
    pub fn get<F>(&self, key: &PipelineKey, try_fast_path: bool, build: F) -> PipelineLookup<A>
    where
        F: FnOnce(BuildTicket<A>),
    {
        if try_fast_path {
            if let Some(slot) = self.entries.read().get(key) {
                if let Some(lookup) = self.observe(key, slot) {
                    return lookup;
                }
            }
        }

        let entries = self.entries.upgradable_read();
        if let Some(slot) = entries.get(key) {
            if let Some(lookup) = self.observe(key, slot) {
                return lookup;
            }
        }

        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let slot = Arc::new(Slot::pending());
        let replaced = entries.insert(*key, Arc::clone(&slot)).is_some();
        let generation = self.shared.generation.load(Ordering::Acquire);
        drop(entries);

        let counters = &self.shared.counters;
        counters.inc_misses();
        counters.inc_builds_started();
        debug!(
            vs = key.vertex_program_id.0,
            fs = key.fragment_program_id.0,
            retry = replaced,
            "pipeline cache miss; building"
        );

        build(BuildTicket {
            key: *key,
            slot: Arc::clone(&slot),
            shared: Arc::clone(&self.shared),
            generation,
            on_first_build: None,
            completed: false,
        });

        PipelineLookup {
            handle: PipelineHandle { key: *key, slot },
            cache_miss: true,
        }
    }

    /// Classifies an existing slot. `None` means the caller must claim the key again.
    fn observe(&self, key: &PipelineKey, slot: &Arc<PipelineSlot<A>>) -> Option<PipelineLookup<A>> {
        let status = slot.status();
        let reclaim = match (status, self.failure_policy) {
            (SlotStatus::Failed, FailurePolicy::Retry) => true,
            (SlotStatus::Failed, FailurePolicy::CachePermanently)
            | (SlotStatus::Pending | SlotStatus::Ready, _) => false,
        };
        if reclaim {
            return None;
        }

        let counters = &self.shared.counters;
        match status {
            SlotStatus::Ready => counters.inc_hits(),
            SlotStatus::Pending => counters.inc_pending_hits(),
            SlotStatus::Failed => counters.inc_failed_hits(),
        }
        trace!(
            vs = key.vertex_program_id.0,
            fs = key.fragment_program_id.0,
            ?status,
            "pipeline entry found"
        );
        Some(PipelineLookup {
            handle: PipelineHandle {
                key: *key,
                slot: Arc::clone(slot),
            },
            cache_miss: status != SlotStatus::Ready,
        })
    }

    pub fn find(&self, key: &PipelineKey) -> Option<PipelineHandle<A>> {
        self.entries.read().get(key).map(|slot| PipelineHandle {
            key: *key,
            slot: Arc::clone(slot),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.write_entries();
        self.clear_locked(&mut entries);
    }

    pub(crate) fn write_entries(&self) -> RwLockWriteGuard<'_, PipelineMap<A>> {
        self.entries.write()
    }

    /// Empties the map and retires outstanding tickets. Requires the write guard.
    pub(crate) fn clear_locked(&self, entries: &mut PipelineMap<A>) {
        entries.clear();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn fill_stats(&self, stats: &mut PipelineCacheStats) {
        self.shared.counters.fill(stats, self.len());
    }
}

impl<A> fmt::Debug for PipelineTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTable")
            .field("entries", &self.len())
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_key::{ProgramId, StateBlob};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, Mutex};

    fn key(vs: u32, fs: u32) -> PipelineKey {
        PipelineKey::new(ProgramId(vs), ProgramId(fs), StateBlob::default())
    }

    fn stats(table: &PipelineTable<u32>) -> PipelineCacheStats {
        let mut stats = PipelineCacheStats::default();
        table.fill_stats(&mut stats);
        stats
    }

    #[test]
    fn inline_build_then_hit() {
        let table = PipelineTable::new(FailurePolicy::CachePermanently);
        let k = key(5, 7);

        let first = table.get(&k, false, |ticket| ticket.complete(Ok(11)));
        assert!(first.cache_miss);
        assert!(first.handle.is_ready());

        let second = table.get(&k, true, |_| panic!("pipeline should have been cached"));
        assert!(!second.cache_miss);
        assert!(second.handle.ptr_eq(&first.handle));
        assert_eq!(*second.handle.wait().unwrap(), 11);

        let stats = stats(&table);
        assert_eq!(stats.pipeline_hits, 1);
        assert_eq!(stats.pipeline_misses, 1);
        assert_eq!(stats.pipelines, 1);
    }

    #[test]
    fn pending_claim_blocks_second_build() {
        let table = PipelineTable::new(FailurePolicy::CachePermanently);
        let k = key(5, 7);
        let parked = Mutex::new(None);

        let first = table.get(&k, false, |ticket| *parked.lock().unwrap() = Some(ticket));
        assert_eq!(first.handle.status(), SlotStatus::Pending);

        let second = table.get(&k, true, |_| panic!("key already claimed"));
        assert!(second.cache_miss);
        assert_eq!(second.handle.try_get(), None);

        let stats_while_pending = stats(&table);
        assert_eq!(stats_while_pending.pipeline_hits, 0);
        assert_eq!(stats_while_pending.pipeline_pending_hits, 1);
        assert_eq!(stats_while_pending.pipeline_misses, 1);

        let ticket = parked.lock().unwrap().take().unwrap();
        assert_eq!(ticket.key(), &k);
        ticket.complete(Ok(3));
        assert_eq!(*second.handle.wait().unwrap(), 3);
        assert!(first.handle.ptr_eq(&second.handle));

        let third = table.get(&k, true, |_| panic!("key already built"));
        assert!(!third.cache_miss);
        let stats = stats(&table);
        assert_eq!(stats.pipeline_hits, 1);
        assert_eq!(stats.pipeline_pending_hits, 1);
    }

    #[test]
    fn concurrent_gets_build_once() {
        const THREADS: usize = 8;
        let table = PipelineTable::new(FailurePolicy::CachePermanently);
        let builds = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);
        let k = key(5, 7);

        let (table, builds, barrier, k) = (&table, &builds, &barrier, &k);
        let values: Vec<Arc<u32>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        let lookup = table.get(k, false, |ticket| {
                            builds.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            ticket.complete(Ok(99));
                        });
                        lookup.handle.wait().unwrap()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("thread join"))
                .collect()
        });

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn failed_build_is_cached_permanently_by_default() {
        let table: PipelineTable<u32> = PipelineTable::new(FailurePolicy::default());
        assert_eq!(table.failure_policy(), FailurePolicy::CachePermanently);
        let k = key(1, 2);

        let first = table.get(&k, false, |ticket| {
            ticket.complete(Err(BuildError::Link("bad attachment".into())))
        });
        assert_eq!(first.handle.status(), SlotStatus::Failed);

        let second = table.get(&k, true, |_| panic!("failure is cached"));
        assert_eq!(
            second.handle.wait(),
            Err(BuildError::Link("bad attachment".into()))
        );
        let stats = stats(&table);
        assert_eq!(stats.pipeline_builds_failed, 1);
        assert_eq!(stats.pipeline_failed_hits, 1);
        assert_eq!(stats.pipeline_hits, 0);
    }

    #[test]
    fn failed_build_is_retried_under_retry_policy() {
        let table: PipelineTable<u32> = PipelineTable::new(FailurePolicy::Retry);
        assert_eq!(table.failure_policy(), FailurePolicy::Retry);
        let k = key(1, 2);

        let first = table.get(&k, false, |ticket| {
            ticket.complete(Err(BuildError::Link("transient".into())))
        });
        let second = table.get(&k, true, |ticket| ticket.complete(Ok(4)));
        assert!(second.cache_miss);
        assert!(!second.handle.ptr_eq(&first.handle));
        assert_eq!(*second.handle.wait().unwrap(), 4);
        // The earlier handle keeps its own terminal state.
        assert_eq!(first.handle.status(), SlotStatus::Failed);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn first_build_hook_fires_once_and_only_on_success() {
        let table: PipelineTable<u32> = PipelineTable::new(FailurePolicy::CachePermanently);
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            table.get(&key(1, 1), true, move |mut ticket| {
                ticket.set_first_build_hook(Box::new(move |_: &PipelineKey| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }));
                ticket.complete(Ok(1));
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let failed = Arc::clone(&fired);
        table.get(&key(2, 2), true, move |mut ticket| {
            ticket.set_first_build_hook(Box::new(move |_: &PipelineKey| {
                failed.fetch_add(1, Ordering::SeqCst);
            }));
            ticket.complete(Err(BuildError::Link("nope".into())));
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(stats(&table).first_build_notifications, 1);
    }

    #[test]
    fn dropped_ticket_fails_the_slot() {
        let table: PipelineTable<u32> = PipelineTable::new(FailurePolicy::CachePermanently);
        let lookup = table.get(&key(3, 4), false, drop);
        assert_eq!(lookup.handle.wait(), Err(BuildError::Abandoned));
    }

    #[test]
    fn build_finishing_after_clear_is_detached() {
        let table: PipelineTable<u32> = PipelineTable::new(FailurePolicy::CachePermanently);
        let k = key(8, 9);
        let fired = Arc::new(AtomicUsize::new(0));
        let parked = Mutex::new(None);

        let hook_fired = Arc::clone(&fired);
        let stale = table.get(&k, false, |mut ticket| {
            ticket.set_first_build_hook(Box::new(move |_: &PipelineKey| {
                hook_fired.fetch_add(1, Ordering::SeqCst);
            }));
            *parked.lock().unwrap() = Some(ticket);
        });

        table.clear();
        assert!(table.is_empty());
        parked.lock().unwrap().take().unwrap().complete(Ok(1));

        assert!(stale.handle.is_ready());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(table.find(&k).is_none());

        let fresh = table.get(&k, true, |ticket| ticket.complete(Ok(2)));
        assert!(fresh.cache_miss);
        assert!(!fresh.handle.ptr_eq(&stale.handle));
    }
}
