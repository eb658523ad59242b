//! The node arena and the pull-based evaluation entry points.

use log::debug;

use crate::backend::{ComputeBackend, Extent, TextureHandle};
use crate::config::GraphConfig;
use crate::controls::{ControlValue, Controls};
use crate::error::{GraphError, GraphResult};
use crate::provider::TextureProvider;

/// Identifies a node in a [`TextureGraph`]. Ids are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

enum Entry {
    Occupied(Box<dyn TextureProvider>),
    /// The node is out of its slot, computing.
    Evaluating,
    Vacant,
}

/// A graph of texture stages sharing one compute backend.
///
/// The graph owns its stages and stores edges as [`NodeId`]s, each stage naming at most
/// one upstream. Asking for a node's [`texture`](Self::texture) recomputes whatever is
/// dirty between it and its generator, bottom-up, and returns the cached output for
/// everything else.
///
/// Evaluation is synchronous and single-threaded. The graph borrows the backend and
/// releases every allocation its stages hold when a stage is removed or the graph is
/// dropped.
///
/// # Example
///
/// ```
/// use proctex::{CpuBackend, NoiseGenerator, RoundModifier, TextureGraph};
///
/// let backend = CpuBackend::new();
/// let mut graph = TextureGraph::new(&backend);
/// let noise = graph.add(NoiseGenerator::new().with_size(64, 64));
/// let round = graph.add_after(RoundModifier::new(), noise)?;
///
/// let texture = graph.texture(round)?.expect("round is attached");
/// assert_eq!((texture.width(), texture.height()), (64, 64));
/// assert!(!graph.is_dirty(round)?);
/// # Ok::<(), proctex::GraphError>(())
/// ```
pub struct TextureGraph<'b> {
    backend: &'b dyn ComputeBackend,
    config: GraphConfig,
    entries: Vec<Entry>,
}

impl<'b> TextureGraph<'b> {
    pub fn new(backend: &'b dyn ComputeBackend) -> Self {
        Self::with_config(backend, GraphConfig::default())
    }

    pub fn with_config(backend: &'b dyn ComputeBackend, config: GraphConfig) -> Self {
        Self {
            backend,
            config,
            entries: Vec::new(),
        }
    }

    pub fn backend(&self) -> &'b dyn ComputeBackend {
        self.backend
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(
            self.entries.get(id.0),
            Some(Entry::Occupied(_) | Entry::Evaluating)
        )
    }

    /// Ids of all live nodes, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !matches!(entry, Entry::Vacant))
            .map(|(index, _)| NodeId(index))
    }

    pub fn add<P: TextureProvider>(&mut self, provider: P) -> NodeId {
        self.add_boxed(Box::new(provider))
    }

    pub fn add_boxed(&mut self, provider: Box<dyn TextureProvider>) -> NodeId {
        let id = NodeId(self.entries.len());
        debug!("added {} as {id:?}", provider.stage_name());
        self.entries.push(Entry::Occupied(provider));
        id
    }

    /// Adds `provider` and attaches it to `upstream`.
    pub fn add_after<P: TextureProvider>(
        &mut self,
        provider: P,
        upstream: NodeId,
    ) -> GraphResult<NodeId> {
        if !self.contains(upstream) {
            return Err(GraphError::UnknownNode(upstream));
        }
        let id = self.add(provider);
        if let Err(err) = self.attach(id, upstream) {
            self.remove(id)?;
            return Err(err);
        }
        Ok(id)
    }

    /// Removes a node, releasing its backend resources.
    ///
    /// Consumers of the node are detached (and so become dirty and unable to update).
    /// The returned stage keeps its parameters and can be added again.
    pub fn remove(&mut self, id: NodeId) -> GraphResult<Box<dyn TextureProvider>> {
        let entry = self.entries.get_mut(id.0).ok_or(GraphError::UnknownNode(id))?;
        let mut provider = match std::mem::replace(entry, Entry::Vacant) {
            Entry::Occupied(provider) => provider,
            other => {
                *entry = other;
                return Err(GraphError::UnknownNode(id));
            }
        };
        provider.release(self.backend);

        for consumer in self.consumers(id) {
            self.provider_mut(consumer)?.set_upstream(None)?;
        }
        debug!("removed {} {id:?}", provider.stage_name());
        Ok(provider)
    }

    /// Makes `upstream` the input of `consumer`, replacing any previous input.
    ///
    /// Fails with [`GraphError::Cycle`] if `consumer` is reachable from `upstream`, and
    /// with [`GraphError::NoInput`] if `consumer` is a generator.
    pub fn attach(&mut self, consumer: NodeId, upstream: NodeId) -> GraphResult<()> {
        self.provider(consumer)?;
        let mut cursor = Some(upstream);
        let mut steps = 0;
        while let Some(node) = cursor {
            if node == consumer || steps > self.entries.len() {
                return Err(GraphError::Cycle(consumer));
            }
            cursor = self.provider(node)?.upstream();
            steps += 1;
        }
        self.provider_mut(consumer)?.set_upstream(Some(upstream))
    }

    /// Disconnects `consumer` from its input.
    pub fn detach(&mut self, consumer: NodeId) -> GraphResult<()> {
        self.provider_mut(consumer)?.set_upstream(None)
    }

    pub fn upstream(&self, id: NodeId) -> GraphResult<Option<NodeId>> {
        Ok(self.provider(id)?.upstream())
    }

    /// Nodes reading directly from `id`.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied(p) if p.upstream() == Some(id) => Some(NodeId(index)),
                _ => None,
            })
            .collect()
    }

    pub fn texture_size(&self, id: NodeId) -> GraphResult<Extent> {
        Ok(self.provider(id)?.texture_size(self))
    }

    pub fn is_dirty(&self, id: NodeId) -> GraphResult<bool> {
        Ok(self.provider(id)?.is_dirty(self))
    }

    pub fn can_update(&self, id: NodeId) -> GraphResult<bool> {
        Ok(self.provider(id)?.can_update())
    }

    pub fn revision(&self, id: NodeId) -> GraphResult<u64> {
        Ok(self.provider(id)?.revision())
    }

    /// Returns the node's up-to-date output, recomputing the dirty part of its chain.
    ///
    /// `Ok(None)` means the node (or something upstream) cannot produce yet, typically
    /// because a modifier is detached. Backend faults are returned as errors; the failing
    /// node and everything downstream of it stay dirty.
    pub fn texture(&mut self, id: NodeId) -> GraphResult<Option<TextureHandle>> {
        let mut provider = self.take(id)?;
        let before = provider.revision();
        let result = provider.texture(self);
        if provider.revision() != before {
            debug!(
                "recomputed {} {id:?} at {}",
                provider.stage_name(),
                provider.texture_size(self)
            );
        }
        self.entries[id.0] = Entry::Occupied(provider);
        result
    }

    /// Pulls the node's texture and reads it back as interleaved RGBA.
    pub fn read_texels(&mut self, id: NodeId) -> GraphResult<Option<Vec<f32>>> {
        match self.texture(id)? {
            Some(handle) => Ok(Some(self.backend.read_texels(handle)?)),
            None => Ok(None),
        }
    }

    pub fn provider(&self, id: NodeId) -> GraphResult<&dyn TextureProvider> {
        match self.entries.get(id.0) {
            Some(Entry::Occupied(provider)) => Ok(provider.as_ref()),
            Some(Entry::Evaluating) => Err(GraphError::Cycle(id)),
            _ => Err(GraphError::UnknownNode(id)),
        }
    }

    /// Mutable access to a node. Prefer [`attach`](Self::attach) over calling
    /// [`TextureProvider::set_upstream`] through this, which skips the cycle check.
    pub fn provider_mut(&mut self, id: NodeId) -> GraphResult<&mut dyn TextureProvider> {
        match self.entries.get_mut(id.0) {
            Some(Entry::Occupied(provider)) => Ok(provider.as_mut()),
            Some(Entry::Evaluating) => Err(GraphError::Cycle(id)),
            _ => Err(GraphError::UnknownNode(id)),
        }
    }

    /// Typed access to a stage.
    pub fn stage<T: TextureProvider>(&self, id: NodeId) -> Option<&T> {
        self.provider(id).ok()?.as_any().downcast_ref()
    }

    /// Typed mutable access to a stage, for its setters.
    pub fn stage_mut<T: TextureProvider>(&mut self, id: NodeId) -> Option<&mut T> {
        self.provider_mut(id).ok()?.as_any_mut().downcast_mut()
    }

    pub fn controls(&self, id: NodeId) -> GraphResult<Controls> {
        Ok(self.provider(id)?.controls())
    }

    pub fn set_control(&mut self, id: NodeId, name: &str, value: ControlValue) -> GraphResult<()> {
        self.provider_mut(id)?.set_control(name, value)
    }

    /// Writes every control in `controls`, as produced by [`controls`](Self::controls).
    ///
    /// Stops at the first rejected entry; earlier entries stay applied.
    pub fn apply_controls(&mut self, id: NodeId, controls: &Controls) -> GraphResult<()> {
        let provider = self.provider_mut(id)?;
        for (name, value) in controls {
            provider.set_control(name, *value)?;
        }
        Ok(())
    }

    fn take(&mut self, id: NodeId) -> GraphResult<Box<dyn TextureProvider>> {
        let entry = self.entries.get_mut(id.0).ok_or(GraphError::UnknownNode(id))?;
        match std::mem::replace(entry, Entry::Evaluating) {
            Entry::Occupied(provider) => Ok(provider),
            Entry::Evaluating => Err(GraphError::Cycle(id)),
            Entry::Vacant => {
                *entry = Entry::Vacant;
                Err(GraphError::UnknownNode(id))
            }
        }
    }
}

impl Drop for TextureGraph<'_> {
    fn drop(&mut self) {
        for entry in &mut self.entries {
            if let Entry::Occupied(provider) = entry {
                provider.release(self.backend);
            }
        }
    }
}

impl std::fmt::Debug for TextureGraph<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes: Vec<_> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied(p) => Some((index, p.stage_name(), p.upstream())),
                Entry::Evaluating => Some((index, "<evaluating>", None)),
                Entry::Vacant => None,
            })
            .collect();
        f.debug_struct("TextureGraph")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("nodes", &nodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, TextureFormat};
    use crate::error::BackendError;
    use crate::kernels::{CONSTANT_GENERATOR, NOISE_GENERATOR, ROUND_MODIFIER, STEP_MODIFIER};
    use crate::stages::{
        ConstantGenerator, NoiseGenerator, NormalMapModifier, RoundModifier, StepModifier,
    };

    /// noise -> round -> step
    fn chain(graph: &mut TextureGraph<'_>) -> (NodeId, NodeId, NodeId) {
        let noise = graph.add(NoiseGenerator::new().with_size(16, 16));
        let round = graph.add_after(RoundModifier::new(), noise).unwrap();
        let step = graph.add_after(StepModifier::new(), round).unwrap();
        (noise, round, step)
    }

    #[test]
    fn new_nodes_are_dirty() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let (noise, round, step) = chain(&mut graph);
        let detached = graph.add(RoundModifier::new());

        for id in [noise, round, step, detached] {
            assert!(graph.is_dirty(id).unwrap());
        }
        assert_eq!(graph.texture(detached).unwrap(), None);
        let handle = graph.texture(step).unwrap().unwrap();
        assert_eq!(handle.extent, graph.texture_size(step).unwrap());
    }

    #[test]
    fn second_pull_is_a_cache_hit() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let (_, _, step) = chain(&mut graph);

        let first = graph.texture(step).unwrap();
        let dispatches = backend.stats().dispatches;
        assert_eq!(dispatches, 3);

        let second = graph.texture(step).unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.stats().dispatches, dispatches);
    }

    #[test]
    fn mutation_dirties_downstream_only() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let (noise, round, step) = chain(&mut graph);
        graph.texture(step).unwrap();

        graph.stage_mut::<RoundModifier>(round).unwrap().set_round(0.25);
        assert!(!graph.is_dirty(noise).unwrap());
        assert!(graph.is_dirty(round).unwrap());
        assert!(graph.is_dirty(step).unwrap());

        graph.texture(step).unwrap();
        assert_eq!(backend.dispatches_of(NOISE_GENERATOR), 1);
        assert_eq!(backend.dispatches_of(ROUND_MODIFIER), 2);
        assert_eq!(backend.dispatches_of(STEP_MODIFIER), 2);
    }

    #[test]
    fn resize_propagates_with_one_reallocation_per_node() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let (noise, round, step) = chain(&mut graph);
        graph.texture(step).unwrap();
        assert_eq!(backend.stats().textures_allocated, 3);

        graph
            .stage_mut::<NoiseGenerator>(noise)
            .unwrap()
            .set_size(32, 8);
        let handle = graph.texture(step).unwrap().unwrap();

        assert_eq!(handle.extent, Extent::new(32, 8));
        for id in [noise, round, step] {
            assert_eq!(graph.texture_size(id).unwrap(), Extent::new(32, 8));
        }
        let stats = backend.stats();
        assert_eq!(stats.textures_allocated, 6);
        assert_eq!(stats.textures_released, 3);
        assert_eq!(backend.live_textures(), 3);
        assert_eq!(graph.stage::<StepModifier>(step).unwrap().output().allocations(), 2);
    }

    #[test]
    fn detached_modifier_stays_inert() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let (_, round, step) = chain(&mut graph);
        graph.texture(step).unwrap();
        let allocated = backend.stats().textures_allocated;

        graph.detach(round).unwrap();
        assert!(!graph.can_update(round).unwrap());
        for _ in 0..3 {
            assert_eq!(graph.texture(round).unwrap(), None);
            assert_eq!(graph.texture(step).unwrap(), None);
        }
        assert!(graph.is_dirty(step).unwrap());
        assert_eq!(backend.stats().textures_allocated, allocated);
    }

    #[test]
    fn round_then_step_values() {
        let backend = CpuBackend::new();
        let config = GraphConfig::new().format(TextureFormat::Rgba32Float);
        let mut graph = TextureGraph::with_config(&backend, config);
        let source = graph.add(ConstantGenerator::from_color([0.6, 0.6, 0.6, 1.0]).with_size(4, 4));
        let round = graph.add_after(RoundModifier::new(), source).unwrap();
        graph.stage_mut::<RoundModifier>(round).unwrap().set_round(0.5);
        let step = graph
            .add_after(StepModifier::with_levels(0.1, 0.7, 0.5), source)
            .unwrap();

        let rounded = graph.read_texels(round).unwrap().unwrap();
        assert!(rounded.chunks(4).all(|t| t == [0.5, 0.5, 0.5, 1.0]));
        let stepped = graph.read_texels(step).unwrap().unwrap();
        assert!(stepped.chunks(4).all(|t| t == [0.7, 0.7, 0.7, 1.0]));
    }

    #[test]
    fn upstream_fault_is_isolated() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let source = graph.add(ConstantGenerator::new().with_size(4, 4));
        let round = graph.add_after(RoundModifier::new(), source).unwrap();

        backend.fail_dispatch(CONSTANT_GENERATOR);
        let err = graph.texture(round).unwrap_err();
        assert!(matches!(err, GraphError::Backend(BackendError::Dispatch { .. })));
        assert!(graph.is_dirty(source).unwrap());
        assert!(graph.is_dirty(round).unwrap());
        assert_eq!(graph.revision(round).unwrap(), 0);
        assert_eq!(backend.dispatches_of(ROUND_MODIFIER), 0);

        backend.clear_faults();
        assert!(graph.texture(round).unwrap().is_some());
        assert!(!graph.is_dirty(source).unwrap());
        assert!(!graph.is_dirty(round).unwrap());
    }

    #[test]
    fn shared_upstream_keeps_both_consumers_fresh() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let noise = graph.add(NoiseGenerator::new().with_size(8, 8));
        let round = graph.add_after(RoundModifier::new(), noise).unwrap();
        let step = graph.add_after(StepModifier::new(), noise).unwrap();
        graph.texture(round).unwrap();
        graph.texture(step).unwrap();

        graph.stage_mut::<NoiseGenerator>(noise).unwrap().set_seed(7);
        graph.texture(round).unwrap();

        // noise is clean again, but step has not seen its new output
        assert!(!graph.is_dirty(noise).unwrap());
        assert!(graph.is_dirty(step).unwrap());
        graph.texture(step).unwrap();
        assert_eq!(backend.dispatches_of(STEP_MODIFIER), 2);
        assert_eq!(backend.dispatches_of(NOISE_GENERATOR), 2);
    }

    #[test]
    fn attach_rejects_cycles() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let a = graph.add(RoundModifier::new());
        let b = graph.add_after(StepModifier::new(), a).unwrap();
        let c = graph.add_after(NormalMapModifier::new(), b).unwrap();

        assert_eq!(graph.attach(a, c).unwrap_err(), GraphError::Cycle(a));
        assert_eq!(graph.attach(a, a).unwrap_err(), GraphError::Cycle(a));
        assert_eq!(graph.upstream(a).unwrap(), None);
    }

    #[test]
    fn removal_releases_and_detaches() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let (noise, round, step) = chain(&mut graph);
        graph.texture(step).unwrap();
        assert_eq!(backend.live_textures(), 3);
        assert_eq!(backend.live_buffers(), 3);

        let removed = graph.remove(round).unwrap();
        assert_eq!(removed.stage_name(), ROUND_MODIFIER);
        assert_eq!(backend.live_textures(), 2);
        assert_eq!(backend.live_buffers(), 2);
        assert!(!graph.contains(round));
        assert_eq!(graph.upstream(step).unwrap(), None);
        assert!(graph.consumers(noise).is_empty());
        assert_eq!(graph.texture(round).unwrap_err(), GraphError::UnknownNode(round));

        let readded = graph.add_boxed(removed);
        assert_ne!(readded, round);
        graph.attach(readded, noise).unwrap();
        graph.attach(step, readded).unwrap();
        assert!(graph.texture(step).unwrap().is_some());
    }

    #[test]
    fn dropping_the_graph_releases_everything() {
        let backend = CpuBackend::new();
        {
            let mut graph = TextureGraph::new(&backend);
            let (_, _, step) = chain(&mut graph);
            graph.texture(step).unwrap();
            assert_eq!(graph.len(), 3);
        }
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn controls_round_trip_through_json() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let noise = graph.add(NoiseGenerator::new());
        graph.set_control(noise, "frequency", ControlValue::Float(4.0)).unwrap();
        graph.set_control(noise, "octaves", ControlValue::Int(3)).unwrap();

        let json = serde_json::to_string(&graph.controls(noise).unwrap()).unwrap();
        let snapshot: Controls = serde_json::from_str(&json).unwrap();

        let copy = graph.add(NoiseGenerator::new());
        graph.apply_controls(copy, &snapshot).unwrap();
        assert_eq!(graph.controls(copy).unwrap(), graph.controls(noise).unwrap());
        assert_eq!(graph.stage::<NoiseGenerator>(copy).unwrap().params().octaves, 3);
    }

    #[test]
    fn unknown_controls_are_reported() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let step = graph.add(StepModifier::new());

        let err = graph
            .set_control(step, "frequency", ControlValue::Float(1.0))
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownControl {
                stage: STEP_MODIFIER,
                name: "frequency".to_string()
            }
        );
    }

    #[test]
    fn typed_access_checks_the_stage_type() {
        let backend = CpuBackend::new();
        let mut graph = TextureGraph::new(&backend);
        let round = graph.add(RoundModifier::new());

        assert!(graph.stage::<RoundModifier>(round).is_some());
        assert!(graph.stage::<StepModifier>(round).is_none());
        assert!(graph.stage_mut::<NoiseGenerator>(round).is_none());
    }
}
