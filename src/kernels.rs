//! The kernel catalogue: names, uniform layouts, WGSL sources and per-texel math.
//!
//! Each stage refers to its kernel by name only. Backends resolve the name here: the
//! wgpu backend compiles the WGSL, the CPU backend evaluates [`Kernel::texel`].
//! Both follow the same bindings:
//!
//! ```text
//! @binding(0) input   texture_2d<f32>                 (modifiers only)
//! @binding(1) output  texture_storage_2d<FORMAT, write>
//! @binding(2) params  uniform                          (stage uniforms)
//! ```

use bytemuck::{Pod, Zeroable};

use crate::backend::Extent;

pub const CONSTANT_GENERATOR: &str = "constantGenerator";
pub const NOISE_GENERATOR: &str = "noiseGenerator";
pub const ROUND_MODIFIER: &str = "roundModifier";
pub const STEP_MODIFIER: &str = "stepModifier";

/// Uniforms for [`CONSTANT_GENERATOR`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ConstantUniforms {
    pub color: [f32; 4],
}

/// Uniforms for [`NOISE_GENERATOR`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct NoiseUniforms {
    pub frequency: f32,
    pub octaves: u32,
    pub persistence: f32,
    pub lacunarity: f32,
    pub seed: u32,
    /// Padding for 16-byte alignment.
    pub _padding: [u32; 3],
}

/// Uniforms for [`ROUND_MODIFIER`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RoundUniforms {
    pub round: f32,
    /// Padding for 16-byte alignment.
    pub _padding: [f32; 3],
}

/// Uniforms for [`STEP_MODIFIER`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct StepUniforms {
    pub low: f32,
    pub high: f32,
    pub boundary: f32,
    /// Padding for 16-byte alignment.
    pub _padding: f32,
}

/// A kernel known to the built-in backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    Constant,
    Noise,
    Round,
    Step,
}

impl Kernel {
    pub const ALL: [Kernel; 4] = [Kernel::Constant, Kernel::Noise, Kernel::Round, Kernel::Step];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Kernel::Constant => CONSTANT_GENERATOR,
            Kernel::Noise => NOISE_GENERATOR,
            Kernel::Round => ROUND_MODIFIER,
            Kernel::Step => STEP_MODIFIER,
        }
    }

    /// Whether the kernel reads an upstream texture at binding 0.
    pub fn reads_input(self) -> bool {
        matches!(self, Kernel::Round | Kernel::Step)
    }

    /// Size of the uniform block the kernel expects at binding 2.
    pub fn uniform_size(self) -> usize {
        match self {
            Kernel::Constant => std::mem::size_of::<ConstantUniforms>(),
            Kernel::Noise => std::mem::size_of::<NoiseUniforms>(),
            Kernel::Round => std::mem::size_of::<RoundUniforms>(),
            Kernel::Step => std::mem::size_of::<StepUniforms>(),
        }
    }

    /// WGSL source with `FORMAT` standing in for the storage texel format.
    pub fn wgsl_template(self) -> &'static str {
        match self {
            Kernel::Constant => CONSTANT_SHADER,
            Kernel::Noise => NOISE_SHADER,
            Kernel::Round => ROUND_SHADER,
            Kernel::Step => STEP_SHADER,
        }
    }

    /// Computes one output texel.
    ///
    /// `uniforms` must hold at least [`uniform_size`](Self::uniform_size) bytes; extra
    /// bytes are ignored. Returns `None` when they are too short.
    pub fn texel(
        self,
        x: u32,
        y: u32,
        domain: Extent,
        input: [f32; 4],
        uniforms: &[u8],
    ) -> Option<[f32; 4]> {
        let bytes = uniforms.get(..self.uniform_size())?;
        let texel = match self {
            Kernel::Constant => {
                let u: ConstantUniforms = bytemuck::pod_read_unaligned(bytes);
                u.color
            }
            Kernel::Noise => {
                let u: NoiseUniforms = bytemuck::pod_read_unaligned(bytes);
                let uv = (
                    x as f32 / domain.width as f32,
                    y as f32 / domain.height as f32,
                );
                let v = fbm(uv, &u);
                [v, v, v, 1.0]
            }
            Kernel::Round => {
                let u: RoundUniforms = bytemuck::pod_read_unaligned(bytes);
                [
                    round_to_multiple(input[0], u.round),
                    round_to_multiple(input[1], u.round),
                    round_to_multiple(input[2], u.round),
                    input[3],
                ]
            }
            Kernel::Step => {
                let u: StepUniforms = bytemuck::pod_read_unaligned(bytes);
                let v = step(input[0], u.boundary, u.low, u.high);
                [v, v, v, 1.0]
            }
        };
        Some(texel)
    }
}

/// `r * round(value / r)`; a zero multiple leaves the value untouched.
pub fn round_to_multiple(value: f32, r: f32) -> f32 {
    if r == 0.0 {
        return value;
    }
    r * (value / r).round()
}

/// `high` when `value` is strictly above `boundary`, `low` otherwise.
pub fn step(value: f32, boundary: f32, low: f32, high: f32) -> f32 {
    if value > boundary { high } else { low }
}

fn fract(x: f32) -> f32 {
    x - x.floor()
}

fn hash(px: f32, py: f32) -> f32 {
    let (mut a, mut b, mut c) = (fract(px * 0.1031), fract(py * 0.1031), fract(px * 0.1031));
    let d = a * (b + 33.33) + b * (c + 33.33) + c * (a + 33.33);
    a += d;
    b += d;
    c += d;
    fract((a + b) * c)
}

fn fade(t: f32) -> f32 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

fn value_noise(px: f32, py: f32) -> f32 {
    let (ix, iy) = (px.floor(), py.floor());
    let (fx, fy) = (px - ix, py - iy);
    let (u, v) = (fade(fx), fade(fy));

    let n00 = hash(ix, iy);
    let n10 = hash(ix + 1.0, iy);
    let n01 = hash(ix, iy + 1.0);
    let n11 = hash(ix + 1.0, iy + 1.0);

    lerp(lerp(n00, n10, u), lerp(n01, n11, u), v)
}

fn fbm(uv: (f32, f32), u: &NoiseUniforms) -> f32 {
    let offset = (u.seed as f32 * 0.1, u.seed as f32 * 0.17);
    let (px, py) = (uv.0 * u.frequency + offset.0, uv.1 * u.frequency + offset.1);

    let mut sum = 0.0;
    let mut amplitude = 1.0;
    let mut frequency = 1.0;
    let mut max_value = 0.0;
    for _ in 0..u.octaves.max(1) {
        sum += value_noise(px * frequency, py * frequency) * amplitude;
        max_value += amplitude;
        amplitude *= u.persistence;
        frequency *= u.lacunarity;
    }
    // Alternating persistence can cancel the amplitudes out.
    if max_value.abs() < f32::EPSILON {
        sum
    } else {
        sum / max_value
    }
}

const CONSTANT_SHADER: &str = r#"
struct Params {
    color: vec4<f32>,
}

@group(0) @binding(1) var output: texture_storage_2d<FORMAT, write>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(output);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }
    textureStore(output, vec2<i32>(id.xy), params.color);
}
"#;

const NOISE_SHADER: &str = r#"
struct Params {
    frequency: f32,
    octaves: u32,
    persistence: f32,
    lacunarity: f32,
    seed: u32,
}

@group(0) @binding(1) var output: texture_storage_2d<FORMAT, write>;
@group(0) @binding(2) var<uniform> params: Params;

fn hash(p: vec2<f32>) -> f32 {
    var p3 = fract(vec3<f32>(p.x, p.y, p.x) * 0.1031);
    p3 = p3 + dot(p3, p3.yzx + 33.33);
    return fract((p3.x + p3.y) * p3.z);
}

fn fade(t: f32) -> f32 {
    return t * t * t * (t * (t * 6.0 - 15.0) + 10.0);
}

fn value_noise(p: vec2<f32>) -> f32 {
    let pi = floor(p);
    let pf = p - pi;
    let u = fade(pf.x);
    let v = fade(pf.y);

    let n00 = hash(pi);
    let n10 = hash(pi + vec2<f32>(1.0, 0.0));
    let n01 = hash(pi + vec2<f32>(0.0, 1.0));
    let n11 = hash(pi + vec2<f32>(1.0, 1.0));

    return mix(mix(n00, n10, u), mix(n01, n11, u), v);
}

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(output);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }

    let uv = vec2<f32>(id.xy) / vec2<f32>(size);
    let offset = vec2<f32>(f32(params.seed) * 0.1, f32(params.seed) * 0.17);
    let p = uv * params.frequency + offset;

    var sum = 0.0;
    var amplitude = 1.0;
    var frequency = 1.0;
    var max_value = 0.0;
    for (var i = 0u; i < max(params.octaves, 1u); i++) {
        sum += value_noise(p * frequency) * amplitude;
        max_value += amplitude;
        amplitude *= params.persistence;
        frequency *= params.lacunarity;
    }

    var value = sum;
    if (abs(max_value) >= 1.1920929e-7) {
        value = sum / max_value;
    }
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(value, value, value, 1.0));
}
"#;

const ROUND_SHADER: &str = r#"
struct Params {
    round: f32,
}

@group(0) @binding(0) var input: texture_2d<f32>;
@group(0) @binding(1) var output: texture_storage_2d<FORMAT, write>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(output);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }

    let texel = textureLoad(input, vec2<i32>(id.xy), 0);
    var rgb = texel.rgb;
    if (params.round != 0.0) {
        rgb = params.round * round(texel.rgb / params.round);
    }
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(rgb, texel.a));
}
"#;

const STEP_SHADER: &str = r#"
struct Params {
    low: f32,
    high: f32,
    boundary: f32,
}

@group(0) @binding(0) var input: texture_2d<f32>;
@group(0) @binding(1) var output: texture_storage_2d<FORMAT, write>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let size = textureDimensions(output);
    if (id.x >= size.x || id.y >= size.y) {
        return;
    }

    let value = textureLoad(input, vec2<i32>(id.xy), 0).r;
    let level = select(params.low, params.high, value > params.boundary);
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(level, level, level, 1.0));
}
"#;
