use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one program table's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgramTableStats {
    pub hits: u64,
    pub misses: u64,
    pub decode_failures: u64,
    pub entries: u64,
}

/// Snapshot of pipeline cache counters, suitable for profiling/telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    pub vertex_programs: ProgramTableStats,
    pub fragment_programs: ProgramTableStats,
    /// Program lookups requested by `resolve`, two per call.
    pub program_lookups: u64,
    /// Lookups answered from a caller's `ResolveHint` without touching a program table.
    pub program_lookups_elided: u64,

    /// Lookups that found the pipeline `Ready`; matches the calls that returned `cache_miss == false`.
    pub pipeline_hits: u64,
    /// Lookups that found another caller's build still in flight.
    pub pipeline_pending_hits: u64,
    /// Lookups that found a cached build failure.
    pub pipeline_failed_hits: u64,
    pub pipeline_misses: u64,
    pub pipeline_builds_started: u64,
    pub pipeline_builds_succeeded: u64,
    pub pipeline_builds_failed: u64,
    pub first_build_notifications: u64,
    pub pipelines: u64,

    pub workers: u64,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_inline: u64,
    pub jobs_panicked: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProgramTableCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    decode_failures: AtomicU64,
}

impl ProgramTableCounters {
    pub(crate) fn inc_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_decode_failures(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entries: usize) -> ProgramTableStats {
        ProgramTableStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            entries: entries as u64,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ResolveCounters {
    program_lookups: AtomicU64,
    program_lookups_elided: AtomicU64,
}

impl ResolveCounters {
    pub(crate) fn inc_program_lookups(&self) {
        self.program_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_program_lookups_elided(&self) {
        self.program_lookups_elided.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, stats: &mut PipelineCacheStats) {
        stats.program_lookups = self.program_lookups.load(Ordering::Relaxed);
        stats.program_lookups_elided = self.program_lookups_elided.load(Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PipelineTableCounters {
    hits: AtomicU64,
    pending_hits: AtomicU64,
    failed_hits: AtomicU64,
    misses: AtomicU64,
    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    first_build_notifications: AtomicU64,
}

impl PipelineTableCounters {
    pub(crate) fn inc_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_pending_hits(&self) {
        self.pending_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failed_hits(&self) {
        self.failed_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_builds_started(&self) {
        self.builds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_builds_succeeded(&self) {
        self.builds_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_builds_failed(&self) {
        self.builds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_first_build_notifications(&self) {
        self.first_build_notifications
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Fills the pipeline fields of `stats`.
    pub(crate) fn fill(&self, stats: &mut PipelineCacheStats, entries: usize) {
        stats.pipeline_hits = self.hits.load(Ordering::Relaxed);
        stats.pipeline_pending_hits = self.pending_hits.load(Ordering::Relaxed);
        stats.pipeline_failed_hits = self.failed_hits.load(Ordering::Relaxed);
        stats.pipeline_misses = self.misses.load(Ordering::Relaxed);
        stats.pipeline_builds_started = self.builds_started.load(Ordering::Relaxed);
        stats.pipeline_builds_succeeded = self.builds_succeeded.load(Ordering::Relaxed);
        stats.pipeline_builds_failed = self.builds_failed.load(Ordering::Relaxed);
        stats.first_build_notifications = self.first_build_notifications.load(Ordering::Relaxed);
        stats.pipelines = entries as u64;
    }
}

/// Snapshot of worker pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub workers: u64,
    pub submitted: u64,
    pub completed: u64,
    pub inline: u64,
    pub panicked: u64,
}

#[derive(Debug, Default)]
pub(crate) struct WorkerPoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    inline: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerPoolCounters {
    pub(crate) fn inc_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_inline(&self) {
        self.inline.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, workers: usize) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: workers as u64,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            inline: self.inline.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}
