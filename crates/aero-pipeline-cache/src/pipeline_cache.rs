//! Front door of the crate: resolve a (vertex, fragment, state) triple to a pipeline.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{CompileBackend, PipelineObserver};
use crate::config::PipelineCacheConfig;
use crate::error::ResolveError;
use crate::job::CompileJob;
use crate::pipeline_key::{PipelineKey, ProgramDescriptor, ProgramKind, StateBlob};
use crate::pipeline_table::{PipelineHandle, PipelineTable};
use crate::program_table::{ProgramHandle, ProgramIdAllocator, ProgramTable};
use crate::stats::{PipelineCacheStats, ResolveCounters};
use crate::worker_pool::{BuildMode, WorkerPool};

/// Result of [`PipelineCache::resolve`].
pub struct Resolved<B: CompileBackend> {
    pub pipeline: PipelineHandle<B::Artifact>,
    pub vertex: ProgramHandle<B::Program>,
    pub fragment: ProgramHandle<B::Program>,
    /// `true` unless the pipeline was already `Ready`. Use for fallback decisions only.
    pub cache_miss: bool,
}

impl<B: CompileBackend> fmt::Debug for Resolved<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("pipeline", &self.pipeline)
            .field("vertex", &self.vertex)
            .field("fragment", &self.fragment)
            .field("cache_miss", &self.cache_miss)
            .finish()
    }
}

/// Programs used by a caller's previous [`PipelineCache::resolve_with_hint`].
///
/// When a stage's descriptor is unchanged since the last call, the hinted handle is reused and
/// that program table is not consulted at all. A hint belongs to the cache it was used with;
/// [`PipelineCache::clear`] invalidates it.
pub struct ResolveHint<P> {
    epoch: u64,
    vertex: Option<ProgramHandle<P>>,
    fragment: Option<ProgramHandle<P>>,
}

impl<P> ResolveHint<P> {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            vertex: None,
            fragment: None,
        }
    }

    pub fn has_vertex_program(&self) -> bool {
        self.vertex.is_some()
    }

    pub fn has_fragment_program(&self) -> bool {
        self.fragment.is_some()
    }

    /// Forgets both programs; the next hinted resolve looks both up.
    pub fn reset(&mut self) {
        self.vertex = None;
        self.fragment = None;
    }

    fn program_mut(&mut self, kind: ProgramKind) -> &mut Option<ProgramHandle<P>> {
        match kind {
            ProgramKind::Vertex => &mut self.vertex,
            ProgramKind::Fragment => &mut self.fragment,
        }
    }
}

impl<P> Default for ResolveHint<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for ResolveHint<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveHint")
            .field("epoch", &self.epoch)
            .field("vertex", &self.vertex.as_ref().map(|entry| entry.id()))
            .field("fragment", &self.fragment.as_ref().map(|entry| entry.id()))
            .finish()
    }
}

/// Content-addressed program and pipeline cache with single-flight builds.
///
/// Owns one program table per kind, the pipeline table, the program id counter and the worker
/// pool used for [`BuildMode::Deferred`] builds. All methods take `&self`; share the cache across
/// threads with `Arc` or scoped borrows.
pub struct PipelineCache<B: CompileBackend> {
    backend: Arc<B>,
    observer: Option<Arc<dyn PipelineObserver>>,
    ids: Arc<ProgramIdAllocator>,
    vertex_programs: ProgramTable<B::Program>,
    fragment_programs: ProgramTable<B::Program>,
    pipelines: PipelineTable<B::Artifact>,
    workers: WorkerPool,
    /// Bumped by every `clear`; hints from an older epoch are discarded.
    epoch: AtomicU64,
    counters: ResolveCounters,
}

impl<B: CompileBackend> PipelineCache<B> {
    pub fn new(backend: B, config: PipelineCacheConfig) -> Self {
        let ids = Arc::new(ProgramIdAllocator::new());
        let cache = Self {
            backend: Arc::new(backend),
            observer: None,
            vertex_programs: ProgramTable::new(ProgramKind::Vertex, Arc::clone(&ids)),
            fragment_programs: ProgramTable::new(ProgramKind::Fragment, Arc::clone(&ids)),
            ids,
            pipelines: PipelineTable::new(config.failure_policy),
            workers: WorkerPool::new(&config.workers),
            epoch: AtomicU64::new(0),
            counters: ResolveCounters::default(),
        };
        info!(
            workers = cache.workers.worker_count(),
            failure_policy = ?config.failure_policy,
            "pipeline cache created"
        );
        cache
    }

    /// Registers the receiver of first-build notifications.
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn programs(&self, kind: ProgramKind) -> &ProgramTable<B::Program> {
        match kind {
            ProgramKind::Vertex => &self.vertex_programs,
            ProgramKind::Fragment => &self.fragment_programs,
        }
    }

    pub fn pipelines(&self) -> &PipelineTable<B::Artifact> {
        &self.pipelines
    }

    /// Finds or decodes one program. The flag is `true` when the entry already existed.
    pub fn lookup_program(
        &self,
        kind: ProgramKind,
        descriptor: &ProgramDescriptor,
    ) -> Result<(ProgramHandle<B::Program>, bool), ResolveError> {
        let table = self.programs(kind);
        table.lookup_or_decode(descriptor, |descriptor, id| {
            self.backend.decode(table.kind(), descriptor, id)
        })
    }

    /// Resolves the pipeline for two programs and fixed-function state.
    ///
    /// With [`BuildMode::Inline`] a miss is built on this thread and the returned handle is
    /// already published. With [`BuildMode::Deferred`] the build is queued and the handle may
    /// still be pending; poll it with [`PipelineHandle::try_get`] or block with
    /// [`PipelineHandle::wait`]. A handle found pending because another caller claimed the key
    /// is returned as-is in either mode.
    ///
    /// Fails without touching the pipeline table if either program failed to decode.
    pub fn resolve(
        &self,
        vertex: &ProgramDescriptor,
        fragment: &ProgramDescriptor,
        state: &StateBlob,
        mode: BuildMode,
    ) -> Result<Resolved<B>, ResolveError> {
        self.resolve_inner(None, vertex, fragment, state, mode)
    }

    /// Like [`PipelineCache::resolve`], but skips the program table lookup for any stage whose
    /// descriptor matches the one in `hint`, and records the programs used in `hint`.
    pub fn resolve_with_hint(
        &self,
        hint: &mut ResolveHint<B::Program>,
        vertex: &ProgramDescriptor,
        fragment: &ProgramDescriptor,
        state: &StateBlob,
        mode: BuildMode,
    ) -> Result<Resolved<B>, ResolveError> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if hint.epoch != epoch {
            hint.reset();
            hint.epoch = epoch;
        }
        self.resolve_inner(Some(hint), vertex, fragment, state, mode)
    }

    fn resolve_inner(
        &self,
        mut hint: Option<&mut ResolveHint<B::Program>>,
        vertex: &ProgramDescriptor,
        fragment: &ProgramDescriptor,
        state: &StateBlob,
        mode: BuildMode,
    ) -> Result<Resolved<B>, ResolveError> {
        let (vertex, vertex_preexisting) =
            self.hinted_program(hint.as_deref_mut(), ProgramKind::Vertex, vertex)?;
        let (fragment, fragment_preexisting) =
            self.hinted_program(hint, ProgramKind::Fragment, fragment)?;

        let vs = decoded(&vertex)?;
        let fs = decoded(&fragment)?;

        let key = PipelineKey::new(vertex.id(), fragment.id(), *state);
        let lookup = self.pipelines.get(
            &key,
            vertex_preexisting && fragment_preexisting,
            |mut ticket| {
                if let Some(observer) = &self.observer {
                    let observer = Arc::clone(observer);
                    let vertex_desc = vertex.descriptor().clone();
                    let fragment_desc = fragment.descriptor().clone();
                    ticket.set_first_build_hook(Box::new(move |key: &PipelineKey| {
                        observer.on_first_build(key, &vertex_desc, &fragment_desc);
                    }));
                }

                let job = CompileJob {
                    backend: Arc::clone(&self.backend),
                    vertex: vs,
                    fragment: fs,
                    state: *state,
                    ticket,
                };
                self.workers.execute(mode, Box::new(move || job.run()));
            },
        );

        Ok(Resolved {
            pipeline: lookup.handle,
            vertex,
            fragment,
            cache_miss: lookup.cache_miss,
        })
    }

    fn hinted_program(
        &self,
        hint: Option<&mut ResolveHint<B::Program>>,
        kind: ProgramKind,
        descriptor: &ProgramDescriptor,
    ) -> Result<(ProgramHandle<B::Program>, bool), ResolveError> {
        self.counters.inc_program_lookups();
        let Some(hint) = hint else {
            return self.lookup_program(kind, descriptor);
        };

        let cached = hint.program_mut(kind);
        if let Some(entry) = cached.as_ref() {
            if entry.descriptor() == descriptor {
                self.counters.inc_program_lookups_elided();
                return Ok((Arc::clone(entry), true));
            }
        }

        let (entry, preexisting) = self.lookup_program(kind, descriptor)?;
        *cached = Some(Arc::clone(&entry));
        Ok((entry, preexisting))
    }

    /// Drops every program and pipeline entry and invalidates every [`ResolveHint`].
    ///
    /// Takes the table locks in a fixed order (vertex programs, fragment programs, pipelines).
    /// Handles obtained earlier stay valid but are detached from the cache, and builds still in
    /// flight publish only into their detached entries. Lookups racing with `clear` may observe
    /// either side of it; callers that need a clean cut must synchronize externally.
    pub fn clear(&self) {
        let mut vertex = self.vertex_programs.write_entries();
        let mut fragment = self.fragment_programs.write_entries();
        let mut pipelines = self.pipelines.write_entries();

        let dropped = vertex.len() + fragment.len() + pipelines.len();
        vertex.clear();
        fragment.clear();
        self.pipelines.clear_locked(&mut pipelines);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        debug!(dropped, "pipeline cache cleared");
    }

    /// Total number of entries across all tables.
    pub fn size(&self) -> usize {
        self.vertex_programs.len() + self.fragment_programs.len() + self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn program_count(&self, kind: ProgramKind) -> usize {
        self.programs(kind).len()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Blocks until every deferred build queued so far has completed.
    pub fn wait_idle(&self) {
        self.workers.wait_idle();
    }

    pub fn stats(&self) -> PipelineCacheStats {
        let mut stats = PipelineCacheStats {
            vertex_programs: self.vertex_programs.stats(),
            fragment_programs: self.fragment_programs.stats(),
            ..PipelineCacheStats::default()
        };
        self.pipelines.fill_stats(&mut stats);
        self.counters.fill(&mut stats);

        let pool = self.workers.stats();
        stats.workers = pool.workers;
        stats.jobs_submitted = pool.submitted;
        stats.jobs_completed = pool.completed;
        stats.jobs_inline = pool.inline;
        stats.jobs_panicked = pool.panicked;
        stats
    }
}

impl<B: CompileBackend> fmt::Debug for PipelineCache<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("vertex_programs", &self.vertex_programs)
            .field("fragment_programs", &self.fragment_programs)
            .field("pipelines", &self.pipelines)
            .field("next_program_id", &self.ids)
            .field("workers", &self.workers.worker_count())
            .finish()
    }
}

fn decoded<P>(entry: &ProgramHandle<P>) -> Result<Arc<P>, ResolveError> {
    entry.program().map_err(|source| {
        debug!(kind = entry.kind().as_str(), id = entry.id().0, "refusing to link invalid program");
        ResolveError::InvalidProgram {
            kind: entry.kind(),
            id: entry.id(),
            source,
        }
    })
}
