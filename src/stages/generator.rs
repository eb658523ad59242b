//! Source stages: no upstream, a configurable size.

use std::any::Any;

use log::warn;

use crate::backend::{ComputeBackend, Extent, KernelArgs, TextureHandle};
use crate::controls::{self, Control, ControlTable, ControlValue, Controls};
use crate::error::{GraphError, GraphResult};
use crate::graph::{NodeId, TextureGraph};
use crate::kernels::{CONSTANT_GENERATOR, ConstantUniforms, NOISE_GENERATOR, NoiseUniforms};
use crate::provider::TextureProvider;
use crate::stages::{KernelBinding, StageKernel};
use crate::target::OutputTarget;

/// A stage that produces a texture from its parameters alone.
///
/// The size defaults to the graph's [`default_size`](crate::GraphConfig::default_size)
/// until set explicitly. Consumers follow it.
#[derive(Debug)]
pub struct Generator<K: StageKernel> {
    params: K,
    size: Option<Extent>,
    dirty: bool,
    revision: u64,
    output: OutputTarget,
    binding: KernelBinding,
}

pub type ConstantGenerator = Generator<Constant>;
pub type NoiseGenerator = Generator<Noise>;

impl<K: StageKernel> Default for Generator<K> {
    fn default() -> Self {
        Self::with_params(K::default())
    }
}

impl<K: StageKernel> Generator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: K) -> Self {
        Self {
            params,
            size: None,
            dirty: true,
            revision: 0,
            output: OutputTarget::new(),
            binding: KernelBinding::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.set_size(width, height);
        self
    }

    /// The explicit size, if one was set.
    pub fn size(&self) -> Option<Extent> {
        self.size
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        self.size = Some(Extent::new(width, height));
        self.dirty = true;
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

impl<K: StageKernel> TextureProvider for Generator<K> {
    fn stage_name(&self) -> &'static str {
        K::KERNEL
    }

    fn set_upstream(&mut self, upstream: Option<NodeId>) -> GraphResult<()> {
        match upstream {
            Some(_) => Err(GraphError::NoInput(K::KERNEL)),
            None => Ok(()),
        }
    }

    fn texture_size(&self, graph: &TextureGraph<'_>) -> Extent {
        self.size.unwrap_or(graph.config().default_size)
    }

    fn is_dirty(&self, _graph: &TextureGraph<'_>) -> bool {
        self.dirty
    }

    fn update_texture(
        &mut self,
        graph: &mut TextureGraph<'_>,
    ) -> GraphResult<Option<TextureHandle>> {
        let backend = graph.backend();
        let extent = self.texture_size(graph);
        let config = graph.config();
        let label = config.resource_label(K::KERNEL);

        let output = self.output.ensure(backend, extent, config.format, &label)?;
        let uniforms = self.params.uniforms();
        let (kernel, buffer) =
            self.binding
                .prepare(backend, K::KERNEL, &label, bytemuck::bytes_of(&uniforms))?;

        let args = KernelArgs {
            input: None,
            output,
            uniforms: Some(buffer),
        };
        backend
            .dispatch(kernel, &args, extent)
            .inspect_err(|e| warn!("{label}: {e}"))?;

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

/// A solid colour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Constant {
    pub color: [f32; 4],
}

impl Default for Constant {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

static CONSTANT_CONTROLS: ControlTable<Constant> = ControlTable::new(&[
    Control {
        name: "red",
        get: |c| c.color[0].into(),
        set: |c, v| {
            c.color[0] = controls::float("red", v)?;
            Ok(())
        },
    },
    Control {
        name: "green",
        get: |c| c.color[1].into(),
        set: |c, v| {
            c.color[1] = controls::float("green", v)?;
            Ok(())
        },
    },
    Control {
        name: "blue",
        get: |c| c.color[2].into(),
        set: |c, v| {
            c.color[2] = controls::float("blue", v)?;
            Ok(())
        },
    },
    Control {
        name: "alpha",
        get: |c| c.color[3].into(),
        set: |c, v| {
            c.color[3] = controls::float("alpha", v)?;
            Ok(())
        },
    },
]);

impl StageKernel for Constant {
    const KERNEL: &'static str = CONSTANT_GENERATOR;
    type Uniforms = ConstantUniforms;

    fn uniforms(&self) -> ConstantUniforms {
        ConstantUniforms { color: self.color }
    }

    fn controls() -> &'static ControlTable<Self> {
        &CONSTANT_CONTROLS
    }
}

impl Generator<Constant> {
    /// A generator filling every texel with `color`.
    pub fn from_color(color: [f32; 4]) -> Self {
        Self::with_params(Constant { color })
    }

    pub fn color(&self) -> [f32; 4] {
        self.params.color
    }

    pub fn set_color(&mut self, color: [f32; 4]) {
        self.params_mut().color = color;
    }
}

/// Fractal value noise in `[0, 1]`, written to RGB with opaque alpha.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Noise {
    /// Base frequency, in cells across the texture.
    pub frequency: f32,
    pub octaves: u32,
    /// Amplitude multiplier between octaves.
    pub persistence: f32,
    /// Frequency multiplier between octaves.
    pub lacunarity: f32,
    pub seed: u32,
}

impl Default for Noise {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            octaves: 6,
            persistence: 0.5,
            lacunarity: 2.0,
            seed: 0,
        }
    }
}

const MAX_OCTAVES: i64 = 16;

static NOISE_CONTROLS: ControlTable<Noise> = ControlTable::new(&[
    Control {
        name: "frequency",
        get: |n| n.frequency.into(),
        set: |n, v| {
            n.frequency = controls::float("frequency", v)?;
            Ok(())
        },
    },
    Control {
        name: "octaves",
        get: |n| i64::from(n.octaves).into(),
        set: |n, v| {
            n.octaves = controls::int("octaves", v)?.clamp(1, MAX_OCTAVES) as u32;
            Ok(())
        },
    },
    Control {
        name: "persistence",
        get: |n| n.persistence.into(),
        set: |n, v| {
            n.persistence = controls::float("persistence", v)?;
            Ok(())
        },
    },
    Control {
        name: "lacunarity",
        get: |n| n.lacunarity.into(),
        set: |n, v| {
            n.lacunarity = controls::float("lacunarity", v)?;
            Ok(())
        },
    },
    Control {
        name: "seed",
        get: |n| i64::from(n.seed).into(),
        set: |n, v| {
            n.seed = controls::int("seed", v)?.clamp(0, i64::from(u32::MAX)) as u32;
            Ok(())
        },
    },
]);

impl StageKernel for Noise {
    const KERNEL: &'static str = NOISE_GENERATOR;
    type Uniforms = NoiseUniforms;

    fn uniforms(&self) -> NoiseUniforms {
        NoiseUniforms {
            frequency: self.frequency,
            octaves: self.octaves,
            persistence: self.persistence,
            lacunarity: self.lacunarity,
            seed: self.seed,
            _padding: [0; 3],
        }
    }

    fn controls() -> &'static ControlTable<Self> {
        &NOISE_CONTROLS
    }
}

impl Generator<Noise> {
    pub fn set_frequency(&mut self, frequency: f32) {
        self.params_mut().frequency = frequency;
    }

    pub fn set_octaves(&mut self, octaves: u32) {
        self.params_mut().octaves = octaves;
    }

    pub fn set_seed(&mut self, seed: u32) {
        self.params_mut().seed = seed;
    }
}
