//! Content-addressed keys for programs and pipelines.
//!
//! Programs are keyed by their full descriptor (bytecode plus metadata). Pipelines are keyed by
//! the ids the program tables assigned to their two stages plus a fixed-size POD state block.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

pub const MAX_COLOR_ATTACHMENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Vertex,
    Fragment,
}

impl ProgramKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
        }
    }
}

/// Identifier assigned to a program the first time its descriptor is seen.
///
/// Ids increase monotonically and are never reused for the lifetime of the owning cache, even
/// across [`crate::PipelineCache::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramId(pub u32);

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Side-band information decoded alongside the instruction stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProgramMetadata {
    /// One bit per live instruction slot.
    pub instruction_mask: u64,
    /// One bit per texture/constant resource referenced by the program.
    pub resource_mask: u32,
}

/// A decoded GPU program as produced by the command decoder.
///
/// Equality is structural; the content hash is computed once at construction.
#[derive(Clone)]
pub struct ProgramDescriptor {
    bytecode: Arc<[u8]>,
    metadata: ProgramMetadata,
    hash: u64,
}

impl ProgramDescriptor {
    pub fn new(bytecode: impl Into<Arc<[u8]>>, metadata: ProgramMetadata) -> Self {
        let bytecode = bytecode.into();
        let mut hasher = Xxh3::new();
        hasher.update(&bytecode);
        hasher.update(&metadata.instruction_mask.to_le_bytes());
        hasher.update(&metadata.resource_mask.to_le_bytes());
        Self {
            bytecode,
            metadata,
            hash: hasher.digest(),
        }
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn metadata(&self) -> ProgramMetadata {
        self.metadata
    }

    pub fn content_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for ProgramDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.metadata == other.metadata
            && (Arc::ptr_eq(&self.bytecode, &other.bytecode)
                || self.bytecode[..] == other.bytecode[..])
    }
}

impl Eq for ProgramDescriptor {}

impl Hash for ProgramDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for ProgramDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramDescriptor")
            .field("len", &self.bytecode.len())
            .field("metadata", &self.metadata)
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct RasterizerState {
    pub topology: u8,
    pub cull_mode: u8,
    pub front_face: u8,
    pub polygon_mode: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DepthStencilState {
    pub depth_test: u8,
    pub depth_write: u8,
    pub depth_compare: u8,
    pub stencil_test: u8,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    /// `[fail, depth_fail, pass, compare]` for front faces.
    pub stencil_front: [u8; 4],
    /// `[fail, depth_fail, pass, compare]` for back faces.
    pub stencil_back: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ColorAttachmentState {
    pub format: u8,
    pub blend_enable: u8,
    pub src_color: u8,
    pub dst_color: u8,
    pub color_op: u8,
    pub src_alpha: u8,
    pub dst_alpha: u8,
    pub alpha_op: u8,
    pub write_mask: u8,
}

/// Fixed-function state that participates in pipeline identity.
///
/// Every field is a raw byte so the block has no padding and can be hashed as plain memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct StateBlob {
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    pub color_attachments: [ColorAttachmentState; MAX_COLOR_ATTACHMENTS],
    pub color_attachment_count: u8,
    pub depth_format: u8,
    pub sample_count: u8,
}

impl StateBlob {
    pub fn content_hash(&self) -> u64 {
        xxh3_64(bytemuck::bytes_of(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineKey {
    pub vertex_program_id: ProgramId,
    pub fragment_program_id: ProgramId,
    pub state: StateBlob,
}

impl PipelineKey {
    pub fn new(vertex: ProgramId, fragment: ProgramId, state: StateBlob) -> Self {
        Self {
            vertex_program_id: vertex,
            fragment_program_id: fragment,
            state,
        }
    }

    /// Ordered XOR-fold of the per-field hashes.
    ///
    /// This is not a mixing function; collisions are resolved by the map's equality check.
    pub fn key_hash(&self) -> u64 {
        [
            xxh3_64(&self.vertex_program_id.0.to_le_bytes()),
            xxh3_64(&self.fragment_program_id.0.to_le_bytes()),
            self.state.content_hash(),
        ]
        .into_iter()
        .fold(0, |acc, h| acc.rotate_left(1) ^ h)
    }
}

impl Hash for PipelineKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.key_hash());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_cull(cull_mode: u8) -> StateBlob {
        let mut state = StateBlob::default();
        state.rasterizer.cull_mode = cull_mode;
        state.color_attachment_count = 1;
        state.color_attachments[0].write_mask = 0xf;
        state
    }

    #[test]
    fn state_blob_has_no_padding() {
        assert_eq!(
            std::mem::size_of::<StateBlob>(),
            4 + 14 + 9 * MAX_COLOR_ATTACHMENTS + 3
        );
    }

    #[test]
    fn descriptor_equality_is_by_content() {
        let meta = ProgramMetadata {
            instruction_mask: 0b1011,
            resource_mask: 0x3,
        };
        let a = ProgramDescriptor::new(vec![1u8, 2, 3, 4], meta);
        let b = ProgramDescriptor::new(vec![1u8, 2, 3, 4], meta);
        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());

        let other_bytes = ProgramDescriptor::new(vec![1u8, 2, 3, 5], meta);
        assert_ne!(a, other_bytes);

        let other_meta = ProgramDescriptor::new(
            vec![1u8, 2, 3, 4],
            ProgramMetadata {
                resource_mask: 0x7,
                ..meta
            },
        );
        assert_ne!(a, other_meta);
    }

    #[test]
    fn key_hash_is_order_sensitive() {
        let state = state_with_cull(1);
        let ab = PipelineKey::new(ProgramId(5), ProgramId(7), state);
        let ba = PipelineKey::new(ProgramId(7), ProgramId(5), state);
        assert_ne!(ab, ba);
        assert_ne!(ab.key_hash(), ba.key_hash());
    }

    #[test]
    fn key_hash_tracks_state() {
        let a = PipelineKey::new(ProgramId(5), ProgramId(7), state_with_cull(1));
        let b = PipelineKey::new(ProgramId(5), ProgramId(7), state_with_cull(2));
        assert_ne!(a, b);
        assert_ne!(a.key_hash(), b.key_hash());
        let a_again = PipelineKey::new(ProgramId(5), ProgramId(7), state_with_cull(1));
        assert_eq!(a.key_hash(), a_again.key_hash());
    }
}
