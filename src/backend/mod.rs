//! The compute device boundary.
//!
//! The graph never talks to a GPU directly. It asks a [`ComputeBackend`] for named
//! kernels, fixed-size textures and uniform buffers, and for blocking dispatches over a
//! 2-D domain. Device selection, memory pools and kernel source all live behind this
//! trait.
//!
//! Two implementations ship with the crate:
//!
//! - [`CpuBackend`]: a software reference that runs the kernel catalogue on the CPU and
//!   counts allocations and dispatches. Tests drive the graph through it.
//! - [`WgpuBackend`]: compute pipelines compiled from the WGSL catalogue.

pub mod cpu;
pub mod wgpu;

pub use cpu::CpuBackend;
pub use self::wgpu::{WgpuBackend, WgpuConfig};

use crate::error::BackendResult;

/// Width × height of a texture or dispatch domain, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered.
    pub fn area(self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Storage format of a stage's output texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TextureFormat {
    /// RGBA with 8 bits per channel.
    #[default]
    Rgba8Unorm,
    /// RGBA with 32-bit floats.
    Rgba32Float,
}

impl TextureFormat {
    /// Returns bytes per pixel.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }

    /// Rounds a normalised value the way storing it in this format would.
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            TextureFormat::Rgba8Unorm => (value.clamp(0.0, 1.0) * 255.0).round() / 255.0,
            TextureFormat::Rgba32Float => value,
        }
    }
}

/// A compiled kernel, as returned by [`ComputeBackend::compile_kernel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelId(pub u32);

/// A uniform buffer owned by one stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Identity of a texture allocation inside a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Read-only handle to a backend-resident texture.
///
/// Handles are plain values. Holding one does not keep the allocation alive: the node
/// that owns the texture releases it when it is reallocated or removed, so readers must
/// finish with a handle before changing the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    pub id: TextureId,
    pub extent: Extent,
    pub format: TextureFormat,
}

impl TextureHandle {
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }
}

/// Arguments bound to one kernel dispatch.
///
/// Kernels see the upstream texture (if any) at binding 0, the output storage texture
/// at binding 1 and the stage's uniform buffer (if any) at binding 2.
#[derive(Clone, Copy, Debug)]
pub struct KernelArgs {
    pub input: Option<TextureHandle>,
    pub output: TextureHandle,
    pub uniforms: Option<BufferId>,
}

/// The physical compute device, as seen by the graph.
///
/// All methods take `&self`; implementations keep their resource tables behind
/// interior mutability. Dispatch is blocking: it returns once the device has finished
/// writing the output.
pub trait ComputeBackend {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Looks up and compiles a kernel by name.
    fn compile_kernel(&self, name: &str) -> BackendResult<KernelId>;

    /// Allocates a 2-D texture usable both as kernel input and storage output.
    fn allocate_texture(
        &self,
        extent: Extent,
        format: TextureFormat,
        label: &str,
    ) -> BackendResult<TextureHandle>;

    /// Frees a texture. Unknown handles are ignored.
    fn release_texture(&self, texture: TextureHandle);

    /// Allocates a uniform buffer of `byte_len` bytes.
    fn allocate_buffer(&self, byte_len: usize, label: &str) -> BackendResult<BufferId>;

    /// Overwrites the start of a uniform buffer.
    fn write_buffer(&self, buffer: BufferId, bytes: &[u8]) -> BackendResult<()>;

    /// Frees a uniform buffer. Unknown ids are ignored.
    fn release_buffer(&self, buffer: BufferId);

    /// Runs `kernel` over every pixel of `domain`, blocking until it completes.
    fn dispatch(&self, kernel: KernelId, args: &KernelArgs, domain: Extent) -> BackendResult<()>;

    /// Reads a texture back as interleaved, normalised RGBA values.
    fn read_texels(&self, texture: TextureHandle) -> BackendResult<Vec<f32>>;

    /// Uploads interleaved, normalised RGBA values into a texture.
    fn write_texels(&self, texture: TextureHandle, texels: &[f32]) -> BackendResult<()>;
}

/// Number of `f32` components in an RGBA image of `extent`.
pub(crate) fn component_count(extent: Extent) -> usize {
    extent.area() * 4
}
