//! `aero-pipeline-cache` deduplicates shader program decoding and pipeline linking for the GPU
//! command translators.
//!
//! - Programs are cached by content in one [`ProgramTable`] per [`ProgramKind`]; each distinct
//!   descriptor is decoded once and gets a stable [`ProgramId`].
//! - Pipelines are cached by [`PipelineKey`] (two program ids plus a [`StateBlob`]) in a
//!   [`PipelineTable`] with single-flight claims: under any amount of concurrent demand a key is
//!   built exactly once.
//! - Builds run inline or on a fixed-size [`WorkerPool`] (see [`BuildMode`]).
//!
//! [`PipelineCache`] ties these together behind [`PipelineCache::resolve`]. Callers that resolve
//! draws back to back can keep a [`ResolveHint`] so unchanged programs skip their table lookup.

mod backend;
mod config;
mod error;
mod job;
mod slot;

pub mod pipeline_cache;
pub mod pipeline_key;
pub mod pipeline_table;
pub mod program_table;
pub mod stats;
pub mod worker_pool;

pub use backend::{CompileBackend, PipelineObserver};
pub use config::{
    default_worker_count, FailurePolicy, PipelineCacheConfig, WorkerPoolConfig,
    MAX_DEFAULT_WORKERS, RETRY_FAILED_ENV, WORKERS_ENV,
};
pub use error::{BuildError, ConfigError, DecodeError, ResolveError};
pub use job::CompileJob;
pub use pipeline_cache::{PipelineCache, ResolveHint, Resolved};
pub use pipeline_key::{
    ColorAttachmentState, DepthStencilState, PipelineKey, ProgramDescriptor, ProgramId,
    ProgramKind, ProgramMetadata, RasterizerState, StateBlob, MAX_COLOR_ATTACHMENTS,
};
pub use pipeline_table::{BuildTicket, FirstBuildHook, PipelineHandle, PipelineLookup, PipelineTable};
pub use program_table::{ProgramEntry, ProgramHandle, ProgramIdAllocator, ProgramTable};
pub use slot::SlotStatus;
pub use stats::{PipelineCacheStats, ProgramTableStats, WorkerPoolStats};
pub use worker_pool::{BuildMode, Job, WorkerPool};
