//! Content-addressed table of decoded programs, one per program kind.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::error::{DecodeError, ResolveError};
use crate::pipeline_key::{ProgramDescriptor, ProgramId, ProgramKind};
use crate::slot::{PublishGuard, Slot, SlotStatus};
use crate::stats::{ProgramTableCounters, ProgramTableStats};

/// Hands out [`ProgramId`]s. Shared by both program tables of one cache.
#[derive(Debug, Default)]
pub struct ProgramIdAllocator {
    next: AtomicU32,
}

impl ProgramIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out ids starting at `first` instead of zero.
    pub fn starting_at(first: ProgramId) -> Self {
        Self {
            next: AtomicU32::new(first.0),
        }
    }

    /// Returns `None` once the id space is used up.
    pub fn next_id(&self) -> Option<ProgramId> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| next.checked_add(1))
            .ok()
            .map(ProgramId)
    }
}

/// One program descriptor and its decode result.
///
/// The id and descriptor are fixed at insertion; the decode result is published once.
pub struct ProgramEntry<P> {
    id: ProgramId,
    kind: ProgramKind,
    descriptor: ProgramDescriptor,
    program: Slot<Arc<P>, DecodeError>,
}

pub type ProgramHandle<P> = Arc<ProgramEntry<P>>;

impl<P> ProgramEntry<P> {
    fn pending(id: ProgramId, kind: ProgramKind, descriptor: ProgramDescriptor) -> Self {
        Self {
            id,
            kind,
            descriptor,
            program: Slot::pending(),
        }
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn descriptor(&self) -> &ProgramDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> SlotStatus {
        self.program.status()
    }

    /// True once decoding has succeeded.
    pub fn is_valid(&self) -> bool {
        self.status() == SlotStatus::Ready
    }

    /// Decoded program, blocking while another thread is still decoding it.
    pub fn program(&self) -> Result<Arc<P>, DecodeError> {
        self.program.wait()
    }

    pub fn try_program(&self) -> Option<Result<Arc<P>, DecodeError>> {
        self.program.try_get()
    }
}

impl<P> fmt::Debug for ProgramEntry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("descriptor", &self.descriptor)
            .field("status", &self.program.status())
            .finish()
    }
}

pub(crate) type ProgramMap<P> = HashMap<ProgramDescriptor, ProgramHandle<P>>;

pub struct ProgramTable<P> {
    kind: ProgramKind,
    entries: RwLock<ProgramMap<P>>,
    ids: Arc<ProgramIdAllocator>,
    counters: ProgramTableCounters,
}

impl<P> ProgramTable<P> {
    pub fn new(kind: ProgramKind, ids: Arc<ProgramIdAllocator>) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
            ids,
            counters: ProgramTableCounters::default(),
        }
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    /// Returns the entry for `descriptor`, decoding it on first sight.
    ///
    /// The second element is `true` when the entry already existed. At most one `decode` call
    /// happens per descriptor value; it runs after the table lock has been released, so callers
    /// that race on the same descriptor wait on the entry (see [`ProgramEntry::program`]) rather
    /// than on the table.
    ///
    /// Fails only when a new entry is needed and the id allocator is exhausted.
    pub fn lookup_or_decode<F>(
        &self,
        descriptor: &ProgramDescriptor,
        decode: F,
    ) -> Result<(ProgramHandle<P>, bool), ResolveError>
    where
        F: FnOnce(&ProgramDescriptor, ProgramId) -> Result<P, DecodeError>,
    {
        if let Some(entry) = self.entries.read().get(descriptor) {
            self.counters.inc_hits();
            trace!(kind = self.kind.as_str(), id = entry.id.0, "program cache hit");
            return Ok((Arc::clone(entry), true));
        }

        let entries = self.entries.upgradable_read();
        if let Some(entry) = entries.get(descriptor) {
            self.counters.inc_hits();
            return Ok((Arc::clone(entry), true));
        }

        let Some(id) = self.ids.next_id() else {
            warn!(kind = self.kind.as_str(), "program id space exhausted");
            return Err(ResolveError::ProgramIdsExhausted { kind: self.kind });
        };
        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let entry = Arc::new(ProgramEntry::pending(id, self.kind, descriptor.clone()));
        entries.insert(descriptor.clone(), Arc::clone(&entry));
        drop(entries);

        self.counters.inc_misses();
        debug!(
            kind = self.kind.as_str(),
            id = id.0,
            len = descriptor.bytecode().len(),
            "decoding program"
        );

        let guard = PublishGuard::new(&entry.program);
        let result = decode(&entry.descriptor, id).map(Arc::new);
        if let Err(err) = &result {
            self.counters.inc_decode_failures();
            warn!(kind = self.kind.as_str(), id = id.0, %err, "program decode failed");
        }
        guard.publish(result);

        Ok((entry, false))
    }

    /// Looks up an existing entry without decoding.
    pub fn find(&self, descriptor: &ProgramDescriptor) -> Option<ProgramHandle<P>> {
        self.entries.read().get(descriptor).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write_entries().clear();
    }

    pub fn stats(&self) -> ProgramTableStats {
        self.counters.snapshot(self.len())
    }

    /// Exclusive access for a cache-wide clear that must hold several tables at once.
    pub(crate) fn write_entries(&self) -> RwLockWriteGuard<'_, ProgramMap<P>> {
        self.entries.write()
    }
}

impl<P> fmt::Debug for ProgramTable<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramTable")
            .field("kind", &self.kind)
            .field("entries", &self.len())
            .finish()
    }
}
