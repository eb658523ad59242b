//! Built-in stages.
//!
//! Single-kernel stages are a parameter struct implementing [`StageKernel`] wrapped in
//! either [`Generator`] (no upstream) or [`Modifier`] (one upstream). The wrappers own
//! the output allocation, the compiled kernel and the uniform buffer, and run the
//! caching protocol of [`TextureProvider`](crate::TextureProvider).

pub mod generator;
pub mod modifier;
pub mod normal_map;
pub mod round;
pub mod step;

pub use generator::{Constant, ConstantGenerator, Generator, Noise, NoiseGenerator};
pub use modifier::Modifier;
pub use normal_map::NormalMapModifier;
pub use round::{Round, RoundModifier};
pub use step::{Step, StepModifier};

use crate::backend::{BufferId, ComputeBackend, Extent, KernelId};
use crate::controls::ControlTable;
use crate::error::BackendResult;
use crate::graph::{NodeId, TextureGraph};

/// Parameters of a stage backed by one catalogue kernel.
pub trait StageKernel: Default + 'static {
    /// Kernel name, also used as the stage name.
    const KERNEL: &'static str;

    /// Uniform block written to binding 2 before each dispatch.
    type Uniforms: bytemuck::Pod;

    fn uniforms(&self) -> Self::Uniforms;

    fn controls() -> &'static ControlTable<Self>;
}

/// A stage's compiled kernel and uniform buffer, created on first use.
#[derive(Debug, Default)]
pub(crate) struct KernelBinding {
    kernel: Option<KernelId>,
    uniforms: Option<BufferId>,
}

impl KernelBinding {
    /// Compiles the kernel and allocates the uniform buffer if needed, then uploads
    /// `bytes`.
    pub(crate) fn prepare(
        &mut self,
        backend: &dyn ComputeBackend,
        kernel: &str,
        label: &str,
        bytes: &[u8],
    ) -> BackendResult<(KernelId, BufferId)> {
        let kernel = match self.kernel {
            Some(id) => id,
            None => *self.kernel.insert(backend.compile_kernel(kernel)?),
        };
        let buffer = match self.uniforms {
            Some(id) => id,
            None => *self.uniforms.insert(backend.allocate_buffer(bytes.len(), label)?),
        };
        backend.write_buffer(buffer, bytes)?;
        Ok((kernel, buffer))
    }

    pub(crate) fn release(&mut self, backend: &dyn ComputeBackend) {
        if let Some(buffer) = self.uniforms.take() {
            backend.release_buffer(buffer);
        }
        self.kernel = None;
    }
}

/// A consumer's edge to its upstream node.
///
/// Besides the node, the link remembers the upstream revision the consumer last
/// computed from. When several consumers share an upstream, one of them may pull it
/// clean; the others still see a revision they have not consumed and stay dirty.
#[derive(Debug, Default)]
pub(crate) struct UpstreamLink {
    node: Option<NodeId>,
    consumed: Option<u64>,
}

impl UpstreamLink {
    pub(crate) fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub(crate) fn set(&mut self, node: Option<NodeId>) {
        self.node = node;
        self.consumed = None;
    }

    /// The upstream's size, or the configured default when detached.
    pub(crate) fn size(&self, graph: &TextureGraph<'_>) -> Extent {
        self.node
            .and_then(|id| graph.texture_size(id).ok())
            .unwrap_or(graph.config().default_size)
    }

    /// Whether the upstream is dirty or has produced output this link has not consumed.
    pub(crate) fn is_stale(&self, graph: &TextureGraph<'_>) -> bool {
        let Some(id) = self.node else {
            return false;
        };
        graph.is_dirty(id).unwrap_or(true) || graph.revision(id).ok() != self.consumed
    }

    /// Records the upstream's current revision as consumed.
    pub(crate) fn mark_consumed(&mut self, graph: &TextureGraph<'_>) {
        self.consumed = self.node.and_then(|id| graph.revision(id).ok());
    }
}
