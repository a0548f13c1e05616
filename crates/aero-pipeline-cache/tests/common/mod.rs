//! Shared helpers for `aero-pipeline-cache` integration tests.
#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aero_pipeline_cache::{
    BuildError, CompileBackend, DecodeError, FailurePolicy, PipelineCache, PipelineCacheConfig,
    PipelineKey, PipelineObserver, ProgramDescriptor, ProgramId, ProgramKind, ProgramMetadata,
    StateBlob, WorkerPoolConfig,
};

/// Bytecode starting with this byte fails to decode.
pub const MALFORMED_TOKEN: u8 = 0xff;
/// `sample_count` values that make `link` fail or panic.
pub const LINK_FAIL_SAMPLES: u8 = 0xfe;
pub const LINK_PANIC_SAMPLES: u8 = 0xfd;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct MockProgram {
    pub id: ProgramId,
    pub kind: ProgramKind,
}

#[derive(Debug)]
pub struct MockPipeline {
    pub vertex: ProgramId,
    pub fragment: ProgramId,
    pub state: StateBlob,
}

/// Counts every backend call; optionally slows `link` down to widen race windows.
#[derive(Debug, Default)]
pub struct MockBackend {
    decodes: AtomicUsize,
    links: AtomicUsize,
    link_delay: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link_delay(link_delay: Duration) -> Self {
        Self {
            link_delay,
            ..Self::default()
        }
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> usize {
        self.links.load(Ordering::SeqCst)
    }
}

impl CompileBackend for MockBackend {
    type Program = MockProgram;
    type Artifact = MockPipeline;

    fn decode(
        &self,
        kind: ProgramKind,
        descriptor: &ProgramDescriptor,
        id: ProgramId,
    ) -> Result<MockProgram, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        match descriptor.bytecode().first() {
            None => Err(DecodeError::Malformed("empty instruction stream".into())),
            Some(&MALFORMED_TOKEN) => Err(DecodeError::Malformed("bad opcode 0xff".into())),
            Some(_) => Ok(MockProgram { id, kind }),
        }
    }

    fn link(
        &self,
        vertex: &MockProgram,
        fragment: &MockProgram,
        state: &StateBlob,
    ) -> Result<MockPipeline, BuildError> {
        self.links.fetch_add(1, Ordering::SeqCst);
        if !self.link_delay.is_zero() {
            std::thread::sleep(self.link_delay);
        }
        match state.sample_count {
            LINK_FAIL_SAMPLES => Err(BuildError::Link("unsupported sample count".into())),
            LINK_PANIC_SAMPLES => panic!("backend crashed while linking"),
            _ => Ok(MockPipeline {
                vertex: vertex.id,
                fragment: fragment.id,
                state: *state,
            }),
        }
    }
}

/// Records every first-build notification.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub builds: Mutex<Vec<(PipelineKey, usize, usize)>>,
}

impl RecordingObserver {
    pub fn keys(&self) -> Vec<PipelineKey> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _, _)| *key)
            .collect()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_first_build(
        &self,
        key: &PipelineKey,
        vertex: &ProgramDescriptor,
        fragment: &ProgramDescriptor,
    ) {
        self.builds.lock().unwrap().push((
            *key,
            vertex.bytecode().len(),
            fragment.bytecode().len(),
        ));
    }
}

pub fn vertex_program(n: u32) -> ProgramDescriptor {
    let mut bytes = vec![0x10, 0x00];
    bytes.extend_from_slice(&n.to_le_bytes());
    ProgramDescriptor::new(
        bytes,
        ProgramMetadata {
            instruction_mask: 0b11,
            resource_mask: 0,
        },
    )
}

pub fn fragment_program(n: u32) -> ProgramDescriptor {
    let mut bytes = vec![0x20, 0x00, 0x00];
    bytes.extend_from_slice(&n.to_le_bytes());
    ProgramDescriptor::new(
        bytes,
        ProgramMetadata {
            instruction_mask: 0b111,
            resource_mask: 0b1,
        },
    )
}

pub fn malformed_program() -> ProgramDescriptor {
    ProgramDescriptor::new(vec![MALFORMED_TOKEN, 0x00], ProgramMetadata::default())
}

pub fn state_a() -> StateBlob {
    let mut state = StateBlob::default();
    state.rasterizer.topology = 3;
    state.rasterizer.cull_mode = 1;
    state.depth_stencil.depth_test = 1;
    state.depth_stencil.depth_write = 1;
    state.color_attachment_count = 1;
    state.color_attachments[0].format = 1;
    state.color_attachments[0].write_mask = 0xf;
    state.sample_count = 1;
    state
}

pub fn state_b() -> StateBlob {
    let mut state = state_a();
    state.color_attachments[0].blend_enable = 1;
    state
}

pub fn state_with_samples(sample_count: u8) -> StateBlob {
    let mut state = state_a();
    state.sample_count = sample_count;
    state
}

pub fn config(workers: usize, failure_policy: FailurePolicy) -> PipelineCacheConfig {
    PipelineCacheConfig {
        workers: WorkerPoolConfig::with_workers(NonZeroUsize::new(workers).unwrap()),
        failure_policy,
    }
}

pub fn cache(workers: usize) -> PipelineCache<MockBackend> {
    init_tracing();
    PipelineCache::new(
        MockBackend::new(),
        config(workers, FailurePolicy::CachePermanently),
    )
}

pub fn observed_cache(
    backend: MockBackend,
    workers: usize,
) -> (PipelineCache<MockBackend>, Arc<RecordingObserver>) {
    init_tracing();
    let observer = Arc::new(RecordingObserver::default());
    let cache = PipelineCache::new(backend, config(workers, FailurePolicy::CachePermanently))
        .with_observer(observer.clone());
    (cache, observer)
}
