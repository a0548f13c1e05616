use std::num::NonZeroUsize;

use crate::error::ConfigError;

pub const WORKERS_ENV: &str = "AERO_PIPELINE_CACHE_WORKERS";
pub const RETRY_FAILED_ENV: &str = "AERO_PIPELINE_CACHE_RETRY_FAILED";

/// Upper bound on the automatically chosen worker count.
pub const MAX_DEFAULT_WORKERS: usize = 6;

/// What a `resolve` does when it finds a pipeline whose build previously failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep returning the recorded failure until the cache is cleared.
    #[default]
    CachePermanently,
    /// Replace the failed entry with a fresh claim and build again.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Explicit worker count. `None` picks [`default_worker_count`].
    pub worker_count: Option<NonZeroUsize>,
    /// Prefix for worker thread names; the worker index is appended.
    pub thread_name: String,
}

impl WorkerPoolConfig {
    pub fn with_workers(count: NonZeroUsize) -> Self {
        Self {
            worker_count: Some(count),
            ..Self::default()
        }
    }

    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count
            .map(NonZeroUsize::get)
            .unwrap_or_else(default_worker_count)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            thread_name: "aero-pipeline-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineCacheConfig {
    pub workers: WorkerPoolConfig,
    pub failure_policy: FailurePolicy,
}

impl PipelineCacheConfig {
    /// Default config with overrides from `AERO_PIPELINE_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(WORKERS_ENV) {
            let count = raw
                .trim()
                .parse::<NonZeroUsize>()
                .map_err(|_| ConfigError::InvalidWorkerCount {
                    var: WORKERS_ENV,
                    value: raw.clone(),
                })?;
            config.workers.worker_count = Some(count);
        }

        if let Some(raw) = lookup(RETRY_FAILED_ENV) {
            config.failure_policy = if parse_bool(RETRY_FAILED_ENV, &raw)? {
                FailurePolicy::Retry
            } else {
                FailurePolicy::CachePermanently
            };
        }

        Ok(config)
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    let v = raw.trim();
    if v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
    {
        return Ok(true);
    }
    if v == "0"
        || v.eq_ignore_ascii_case("false")
        || v.eq_ignore_ascii_case("no")
        || v.eq_ignore_ascii_case("off")
    {
        return Ok(false);
    }
    Err(ConfigError::InvalidBool {
        var,
        value: raw.to_string(),
    })
}

/// Half the logical cores, clamped to `1..=MAX_DEFAULT_WORKERS`.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    workers_for_cores(cores)
}

fn workers_for_cores(cores: usize) -> usize {
    (cores / 2).clamp(1, MAX_DEFAULT_WORKERS)
}
