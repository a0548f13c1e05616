use thiserror::Error;

use crate::pipeline_key::{ProgramId, ProgramKind};

/// A program descriptor could not be decoded into a backend program.
///
/// Decode failures are cached: the entry stays in its table, flagged invalid, and every later
/// lookup of the same descriptor observes the same error without calling the backend again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed program descriptor: {0}")]
    Malformed(String),
    #[error("unsupported program feature: {0}")]
    Unsupported(String),
    #[error("program decode was abandoned before it completed")]
    Abandoned,
}

/// The backend failed to link a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("pipeline link failed: {0}")]
    Link(String),
    /// The build ticket was dropped without publishing a result (e.g. the job panicked).
    #[error("pipeline build was abandoned before it completed")]
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("{kind:?} program {id} is invalid: {source}")]
    InvalidProgram {
        kind: ProgramKind,
        id: ProgramId,
        #[source]
        source: DecodeError,
    },
    /// Every `u32` program id has been handed out; ids are never reused.
    #[error("{kind:?} program table cannot allocate another program id")]
    ProgramIdsExhausted { kind: ProgramKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidWorkerCount { var: &'static str, value: String },
    #[error("{var} must be a boolean (1/0, true/false, yes/no, on/off), got {value:?}")]
    InvalidBool { var: &'static str, value: String },
}
