use std::sync::Arc;

use crate::backend::CompileBackend;
use crate::pipeline_key::StateBlob;
use crate::pipeline_table::BuildTicket;

/// Everything a worker needs to link one pipeline.
///
/// Owns its inputs so it can be moved onto a pool thread after the caller has returned.
pub struct CompileJob<B: CompileBackend> {
    pub backend: Arc<B>,
    pub vertex: Arc<B::Program>,
    pub fragment: Arc<B::Program>,
    pub state: StateBlob,
    pub ticket: BuildTicket<B::Artifact>,
}

impl<B: CompileBackend> CompileJob<B> {
    pub fn run(self) {
        let result = self.backend.link(&self.vertex, &self.fragment, &self.state);
        self.ticket.complete(result);
    }
}
