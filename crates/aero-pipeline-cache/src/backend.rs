use crate::error::{BuildError, DecodeError};
use crate::pipeline_key::{PipelineKey, ProgramDescriptor, ProgramId, ProgramKind, StateBlob};

/// Shader transpiler + graphics-API linker used by [`crate::PipelineCache`].
///
/// Both calls are synchronous. Whether `link` runs on the caller or on a pool worker is decided
/// by the cache per request (see [`crate::BuildMode`]), so implementations must be `Send + Sync`.
pub trait CompileBackend: Send + Sync + 'static {
    type Program: Send + Sync + 'static;
    type Artifact: Send + Sync + 'static;

    /// Decodes a program descriptor. Called at most once per distinct descriptor per kind.
    fn decode(
        &self,
        kind: ProgramKind,
        descriptor: &ProgramDescriptor,
        id: ProgramId,
    ) -> Result<Self::Program, DecodeError>;

    /// Links two decoded programs with fixed-function state. Called at most once per key.
    fn link(
        &self,
        vertex: &Self::Program,
        fragment: &Self::Program,
        state: &StateBlob,
    ) -> Result<Self::Artifact, BuildError>;
}

/// Receives a notification the first time each pipeline key is built successfully.
///
/// Intended for a disk-backed pipeline store or telemetry. Never called for cache hits. Builds
/// claimed before a `clear` are not reported, except when the `clear` races with the very end of
/// the build.
pub trait PipelineObserver: Send + Sync + 'static {
    fn on_first_build(
        &self,
        key: &PipelineKey,
        vertex: &ProgramDescriptor,
        fragment: &ProgramDescriptor,
    );
}
