//! Single-input stages.

use std::any::Any;

use log::{debug, warn};

use crate::backend::{ComputeBackend, Extent, KernelArgs, TextureHandle};
use crate::controls::{ControlValue, Controls};
use crate::error::GraphResult;
use crate::graph::{NodeId, TextureGraph};
use crate::provider::TextureProvider;
use crate::stages::{KernelBinding, StageKernel, UpstreamLink};
use crate::target::OutputTarget;

/// A stage that maps its upstream texture through one kernel.
///
/// The output always has the upstream's size. A modifier without an upstream cannot
/// update; its [`texture`](TextureProvider::texture) returns `Ok(None)` and it never
/// allocates.
///
/// An update runs in this order:
///
/// 1. Return `Ok(None)` if detached.
/// 2. Pull the upstream texture through the graph, which recomputes it first if needed.
///    If it produces nothing, stop there and stay dirty.
/// 3. Size the output to the upstream texture, reallocating only on mismatch.
/// 4. Upload the uniforms and dispatch over the output.
/// 5. Clear dirty and record the upstream revision that was consumed.
///
/// A fault in any step is returned and leaves the modifier dirty.
#[derive(Debug)]
pub struct Modifier<K: StageKernel> {
    params: K,
    link: UpstreamLink,
    dirty: bool,
    revision: u64,
    output: OutputTarget,
    binding: KernelBinding,
}

impl<K: StageKernel> Default for Modifier<K> {
    fn default() -> Self {
        Self::with_params(K::default())
    }
}

impl<K: StageKernel> Modifier<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: K) -> Self {
        Self {
            params,
            link: UpstreamLink::default(),
            dirty: true,
            revision: 0,
            output: OutputTarget::new(),
            binding: KernelBinding::default(),
        }
    }

    pub fn params(&self) -> &K {
        &self.params
    }

    /// Mutable access to the parameters. Marks the stage dirty.
    pub fn params_mut(&mut self) -> &mut K {
        self.dirty = true;
        &mut self.params
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }
}

impl<K: StageKernel> TextureProvider for Modifier<K> {
    fn stage_name(&self) -> &'static str {
        K::KERNEL
    }

    fn upstream(&self) -> Option<NodeId> {
        self.link.node()
    }

    fn set_upstream(&mut self, upstream: Option<NodeId>) -> GraphResult<()> {
        self.link.set(upstream);
        self.dirty = true;
        Ok(())
    }

    fn texture_size(&self, graph: &TextureGraph<'_>) -> Extent {
        self.link.size(graph)
    }

    fn is_dirty(&self, graph: &TextureGraph<'_>) -> bool {
        self.dirty || self.link.is_stale(graph)
    }

    fn can_update(&self) -> bool {
        self.link.node().is_some()
    }

    fn update_texture(
        &mut self,
        graph: &mut TextureGraph<'_>,
    ) -> GraphResult<Option<TextureHandle>> {
        let Some(upstream) = self.link.node() else {
            return Ok(None);
        };
        let backend = graph.backend();
        let label = graph.config().resource_label(K::KERNEL);

        let Some(input) = graph.texture(upstream)? else {
            debug!("{label}: upstream {upstream:?} produced nothing, staying dirty");
            return Ok(None);
        };
        let extent = input.extent;
        let output = self
            .output
            .ensure(backend, extent, graph.config().format, &label)?;

        let uniforms = self.params.uniforms();
        let (kernel, buffer) =
            self.binding
                .prepare(backend, K::KERNEL, &label, bytemuck::bytes_of(&uniforms))?;

        let args = KernelArgs {
            input: Some(input),
            output,
            uniforms: Some(buffer),
        };
        backend
            .dispatch(kernel, &args, extent)
            .inspect_err(|e| warn!("{label}: {e}"))?;

        self.link.mark_consumed(graph);
        self.dirty = false;
        self.revision += 1;
        Ok(Some(output))
    }

    fn cached(&self) -> Option<TextureHandle> {
        self.output.handle()
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn controls(&self) -> Controls {
        K::controls().snapshot(&self.params)
    }

    fn set_control(&mut self, name: &str, value: ControlValue) -> GraphResult<()> {
        K::controls().set(&mut self.params, K::KERNEL, name, value)?;
        self.dirty = true;
        Ok(())
    }

    fn release(&mut self, backend: &dyn ComputeBackend) {
        self.output.release(backend);
        self.binding.release(backend);
        self.dirty = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
