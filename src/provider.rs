//! The stage contract shared by every node in a [`TextureGraph`].

use std::any::Any;

use log::trace;

use crate::backend::{ComputeBackend, Extent, TextureHandle};
use crate::controls::{ControlValue, Controls};
use crate::error::GraphResult;
use crate::graph::{NodeId, TextureGraph};

/// A node that produces one texture, lazily.
///
/// Providers are owned by a [`TextureGraph`] and reach their upstream through it, by
/// [`NodeId`]. Each provider tracks whether its output still reflects its parameters and
/// its upstream; [`texture`](Self::texture) recomputes only when it does not.
///
/// # Contract
///
/// - [`texture_size`](Self::texture_size) and [`is_dirty`](Self::is_dirty) are queries
///   with no side effects.
/// - [`texture`](Self::texture) is the only entry point that may issue GPU work. It
///   returns `Ok(None)` without side effects when [`can_update`](Self::can_update) is
///   false, the cached output when clean, and otherwise calls
///   [`update_texture`](Self::update_texture).
/// - Dirty is cleared only by an update that finished without error, and the
///   [`revision`](Self::revision) is bumped at the same time.
///
/// # Implementing a stage
///
/// Most stages should be a [`Modifier`](crate::stages::Modifier) or
/// [`Generator`](crate::stages::Generator) with a [`StageKernel`](crate::stages::StageKernel),
/// which handles allocation, uniforms and dispatch. Implement this trait directly for
/// compute paths that are not a single kernel, like
/// [`NormalMapModifier`](crate::stages::NormalMapModifier).
pub trait TextureProvider: Any {
    /// Name used in logs and errors.
    fn stage_name(&self) -> &'static str;

    /// The node this stage reads from, if any.
    fn upstream(&self) -> Option<NodeId> {
        None
    }

    /// Connects or disconnects the upstream node and marks the stage dirty.
    ///
    /// Use [`TextureGraph::attach`] rather than calling this directly: the graph checks
    /// that the edge does not close a cycle.
    fn set_upstream(&mut self, upstream: Option<NodeId>) -> GraphResult<()>;

    /// Size of the output, derived from the upstream or the stage's own setting.
    fn texture_size(&self, graph: &TextureGraph<'_>) -> Extent;

    /// Whether the cached output is stale, here or anywhere upstream.
    fn is_dirty(&self, graph: &TextureGraph<'_>) -> bool;

    /// Whether the stage has everything it needs to compute.
    fn can_update(&self) -> bool {
        true
    }

    /// Returns the up-to-date output, recomputing it if needed.
    fn texture(&mut self, graph: &mut TextureGraph<'_>) -> GraphResult<Option<TextureHandle>> {
        if !self.can_update() {
            return Ok(None);
        }
        if !self.is_dirty(graph) {
            trace!("{}: cache hit", self.stage_name());
            return Ok(self.cached());
        }
        self.update_texture(graph)
    }

    /// Recomputes the output unconditionally.
    fn update_texture(
        &mut self,
        graph: &mut TextureGraph<'_>,
    ) -> GraphResult<Option<TextureHandle>>;

    /// The current output allocation, whether or not it is up to date.
    fn cached(&self) -> Option<TextureHandle>;

    /// Number of completed updates.
    fn revision(&self) -> u64;

    /// The stage's persistable parameters.
    fn controls(&self) -> Controls {
        Controls::new()
    }

    /// Writes one named parameter and marks the stage dirty.
    fn set_control(&mut self, name: &str, value: ControlValue) -> GraphResult<()>;

    /// Frees every backend resource the stage holds and marks it dirty.
    fn release(&mut self, backend: &dyn ComputeBackend);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
