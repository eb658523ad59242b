//! Software reference backend.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::backend::{
    BufferId, ComputeBackend, Extent, KernelArgs, KernelId, TextureFormat, TextureHandle,
    TextureId, component_count,
};
use crate::error::{BackendError, BackendResult};
use crate::kernels::Kernel;

/// Running totals kept by [`CpuBackend`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub kernels_compiled: usize,
    pub textures_allocated: usize,
    pub textures_released: usize,
    pub buffers_allocated: usize,
    pub buffers_released: usize,
    pub dispatches: usize,
}

struct CpuTexture {
    handle: TextureHandle,
    texels: Vec<f32>,
}

#[derive(Default)]
struct Faults {
    compile: HashSet<String>,
    dispatch: HashSet<String>,
    allocation: bool,
    short_readback: bool,
    upload: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    kernels: Vec<Kernel>,
    textures: HashMap<TextureId, CpuTexture>,
    buffers: HashMap<BufferId, Vec<u8>>,
    stats: BackendStats,
    dispatches_by_kernel: HashMap<&'static str, usize>,
    faults: Faults,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Runs the kernel catalogue on the CPU, one texel at a time.
///
/// Textures are stored as normalised `f32` RGBA and rounded to their declared format on
/// every write, so an `Rgba8Unorm` texture holds the same values a GPU would.
///
/// Besides being a portable fallback, the backend records allocation and dispatch counts
/// and can be told to fail specific operations, which is how the caching behaviour of
/// the graph is observed.
///
/// # Example
///
/// ```
/// use proctex::{ComputeBackend, CpuBackend};
///
/// let backend = CpuBackend::new();
/// assert_eq!(backend.name(), "cpu");
/// assert!(backend.compile_kernel("roundModifier").is_ok());
/// ```
#[derive(Default)]
pub struct CpuBackend {
    state: RefCell<State>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the running totals.
    pub fn stats(&self) -> BackendStats {
        self.state.borrow().stats.clone()
    }

    /// Number of dispatches issued for one kernel.
    pub fn dispatches_of(&self, kernel: &str) -> usize {
        self.state
            .borrow()
            .dispatches_by_kernel
            .get(kernel)
            .copied()
            .unwrap_or(0)
    }

    /// Number of textures currently allocated.
    pub fn live_textures(&self) -> usize {
        self.state.borrow().textures.len()
    }

    /// Number of uniform buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    /// Makes every later `compile_kernel(name)` fail.
    pub fn fail_compile(&self, kernel: &str) {
        self.state.borrow_mut().faults.compile.insert(kernel.to_string());
    }

    /// Makes every later dispatch of `kernel` fail.
    pub fn fail_dispatch(&self, kernel: &str) {
        self.state.borrow_mut().faults.dispatch.insert(kernel.to_string());
    }

    /// Makes texture and buffer allocations fail while `fail` is set.
    pub fn fail_allocations(&self, fail: bool) {
        self.state.borrow_mut().faults.allocation = fail;
    }

    /// Makes `read_texels` return one component short while `short` is set.
    pub fn truncate_readbacks(&self, short: bool) {
        self.state.borrow_mut().faults.short_readback = short;
    }

    /// Makes `write_texels` fail while `fail` is set.
    pub fn fail_uploads(&self, fail: bool) {
        self.state.borrow_mut().faults.upload = fail;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults = Faults::default();
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CpuBackend")
            .field("live_textures", &state.textures.len())
            .field("live_buffers", &state.buffers.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn compile_kernel(&self, name: &str) -> BackendResult<KernelId> {
        let mut state = self.state.borrow_mut();
        if state.faults.compile.contains(name) {
            return Err(BackendError::KernelCompile {
                name: name.to_string(),
                reason: "injected fault".to_string(),
            });
        }
        let kernel =
            Kernel::from_name(name).ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;

        state.stats.kernels_compiled += 1;
        let index = match state.kernels.iter().position(|k| *k == kernel) {
            Some(index) => index,
            None => {
                state.kernels.push(kernel);
                state.kernels.len() - 1
            }
        };
        Ok(KernelId(index as u32))
    }

    fn allocate_texture(
        &self,
        extent: Extent,
        format: TextureFormat,
        _label: &str,
    ) -> BackendResult<TextureHandle> {
        if extent.is_empty() {
            return Err(BackendError::InvalidDimensions(format!(
                "texture dimensions must be > 0, got {extent}"
            )));
        }
        let mut state = self.state.borrow_mut();
        if state.faults.allocation {
            return Err(BackendError::Allocation(format!("{extent} texture refused")));
        }

        let handle = TextureHandle {
            id: TextureId(state.next_id()),
            extent,
            format,
        };
        state.textures.insert(
            handle.id,
            CpuTexture {
                handle,
                texels: vec![0.0; component_count(extent)],
            },
        );
        state.stats.textures_allocated += 1;
        Ok(handle)
    }

    fn release_texture(&self, texture: TextureHandle) {
        let mut state = self.state.borrow_mut();
        if state.textures.remove(&texture.id).is_some() {
            state.stats.textures_released += 1;
        }
    }

    fn allocate_buffer(&self, byte_len: usize, _label: &str) -> BackendResult<BufferId> {
        let mut state = self.state.borrow_mut();
        if state.faults.allocation {
            return Err(BackendError::Allocation(format!("{byte_len} byte buffer refused")));
        }
        let id = BufferId(state.next_id());
        state.buffers.insert(id, vec![0; byte_len]);
        state.stats.buffers_allocated += 1;
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, bytes: &[u8]) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        let storage = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| BackendError::UnknownResource(format!("buffer {buffer:?}")))?;
        if bytes.len() > storage.len() {
            return Err(BackendError::Allocation(format!(
                "write of {} bytes into {} byte buffer",
                bytes.len(),
                storage.len()
            )));
        }
        storage[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferId) {
        let mut state = self.state.borrow_mut();
        if state.buffers.remove(&buffer).is_some() {
            state.stats.buffers_released += 1;
        }
    }

    fn dispatch(&self, kernel: KernelId, args: &KernelArgs, domain: Extent) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        let kernel = *state
            .kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| BackendError::UnknownResource(format!("kernel {kernel:?}")))?;
        let fail = |reason: String| BackendError::Dispatch {
            kernel: kernel.name().to_string(),
            reason,
        };

        if state.faults.dispatch.contains(kernel.name()) {
            return Err(fail("injected fault".to_string()));
        }

        let output = state
            .textures
            .get(&args.output.id)
            .ok_or_else(|| fail("output texture is not allocated".to_string()))?;
        if output.handle.extent != domain {
            return Err(fail(format!(
                "domain {domain} does not match output {}",
                output.handle.extent
            )));
        }
        let format = output.handle.format;

        let input = match (kernel.reads_input(), args.input) {
            (false, _) => None,
            (true, None) => return Err(fail("kernel requires an input texture".to_string())),
            (true, Some(handle)) => {
                let texture = state
                    .textures
                    .get(&handle.id)
                    .ok_or_else(|| fail("input texture is not allocated".to_string()))?;
                if texture.handle.extent != domain {
                    return Err(fail(format!(
                        "input {} does not match domain {domain}",
                        texture.handle.extent
                    )));
                }
                Some(texture.texels.as_slice())
            }
        };

        let uniforms = match args.uniforms {
            Some(id) => state
                .buffers
                .get(&id)
                .ok_or_else(|| fail(format!("uniform buffer {id:?} is not allocated")))?
                .as_slice(),
            None => &[],
        };

        let mut texels = Vec::with_capacity(component_count(domain));
        for y in 0..domain.height {
            for x in 0..domain.width {
                let offset = (y as usize * domain.width as usize + x as usize) * 4;
                let source = input
                    .map(|t| [t[offset], t[offset + 1], t[offset + 2], t[offset + 3]])
                    .unwrap_or([0.0; 4]);
                let texel = kernel
                    .texel(x, y, domain, source, uniforms)
                    .ok_or_else(|| fail("uniform buffer is too small".to_string()))?;
                texels.extend(texel.iter().map(|&v| format.quantize(v)));
            }
        }

        if let Some(output) = state.textures.get_mut(&args.output.id) {
            output.texels = texels;
        }
        state.stats.dispatches += 1;
        *state.dispatches_by_kernel.entry(kernel.name()).or_insert(0) += 1;
        Ok(())
    }

    fn read_texels(&self, texture: TextureHandle) -> BackendResult<Vec<f32>> {
        let state = self.state.borrow();
        let mut texels = state
            .textures
            .get(&texture.id)
            .map(|t| t.texels.clone())
            .ok_or_else(|| BackendError::UnknownResource(format!("texture {:?}", texture.id)))?;
        if state.faults.short_readback {
            texels.pop();
        }
        Ok(texels)
    }

    fn write_texels(&self, texture: TextureHandle, texels: &[f32]) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        if state.faults.upload {
            return Err(BackendError::Device("injected upload fault".to_string()));
        }
        let target = state
            .textures
            .get_mut(&texture.id)
            .ok_or_else(|| BackendError::UnknownResource(format!("texture {:?}", texture.id)))?;
        let expected = component_count(target.handle.extent);
        if texels.len() != expected {
            return Err(BackendError::TexelCount {
                expected,
                actual: texels.len(),
            });
        }
        let format = target.handle.format;
        for (dst, &src) in target.texels.iter_mut().zip(texels) {
            *dst = format.quantize(src);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{ConstantUniforms, RoundUniforms};

    fn constant_texture(backend: &CpuBackend, extent: Extent, value: f32) -> TextureHandle {
        let texture = backend
            .allocate_texture(extent, TextureFormat::Rgba32Float, "input")
            .unwrap();
        let buffer = backend.allocate_buffer(16, "constant").unwrap();
        let uniforms = ConstantUniforms {
            color: [value, value, value, 1.0],
        };
        backend.write_buffer(buffer, bytemuck::bytes_of(&uniforms)).unwrap();
        let kernel = backend.compile_kernel("constantGenerator").unwrap();
        let args = KernelArgs {
            input: None,
            output: texture,
            uniforms: Some(buffer),
        };
        backend.dispatch(kernel, &args, extent).unwrap();
        texture
    }

    #[test]
    fn unknown_kernel_is_rejected() {
        let backend = CpuBackend::new();
        assert_eq!(
            backend.compile_kernel("blurModifier"),
            Err(BackendError::UnknownKernel("blurModifier".to_string()))
        );
    }

    #[test]
    fn compiling_twice_returns_the_same_kernel() {
        let backend = CpuBackend::new();
        let a = backend.compile_kernel("stepModifier").unwrap();
        let b = backend.compile_kernel("stepModifier").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_sized_textures_are_invalid() {
        let backend = CpuBackend::new();
        let result = backend.allocate_texture(Extent::new(0, 4), TextureFormat::Rgba8Unorm, "t");
        assert!(matches!(result, Err(BackendError::InvalidDimensions(_))));
    }

    #[test]
    fn dispatch_rejects_mismatched_input() {
        let backend = CpuBackend::new();
        let input = constant_texture(&backend, Extent::new(8, 8), 0.6);
        let output = backend
            .allocate_texture(Extent::new(4, 4), TextureFormat::Rgba32Float, "output")
            .unwrap();
        let buffer = backend.allocate_buffer(16, "round").unwrap();
        let kernel = backend.compile_kernel("roundModifier").unwrap();
        let args = KernelArgs {
            input: Some(input),
            output,
            uniforms: Some(buffer),
        };
        assert!(matches!(
            backend.dispatch(kernel, &args, Extent::new(4, 4)),
            Err(BackendError::Dispatch { .. })
        ));
        assert_eq!(backend.dispatches_of("roundModifier"), 0);
    }

    #[test]
    fn round_dispatch_writes_output() {
        let backend = CpuBackend::new();
        let extent = Extent::new(4, 2);
        let input = constant_texture(&backend, extent, 0.6);
        let output = backend
            .allocate_texture(extent, TextureFormat::Rgba32Float, "output")
            .unwrap();
        let buffer = backend.allocate_buffer(16, "round").unwrap();
        let uniforms = RoundUniforms {
            round: 0.5,
            _padding: [0.0; 3],
        };
        backend.write_buffer(buffer, bytemuck::bytes_of(&uniforms)).unwrap();

        let kernel = backend.compile_kernel("roundModifier").unwrap();
        let args = KernelArgs {
            input: Some(input),
            output,
            uniforms: Some(buffer),
        };
        backend.dispatch(kernel, &args, extent).unwrap();

        let texels = backend.read_texels(output).unwrap();
        assert_eq!(texels.len(), 4 * 2 * 4);
        assert!(texels.chunks(4).all(|t| (t[0] - 0.5).abs() < 1e-6 && t[3] == 1.0));
        assert_eq!(backend.dispatches_of("roundModifier"), 1);
    }

    #[test]
    fn modifier_without_input_fails_to_dispatch() {
        let backend = CpuBackend::new();
        let extent = Extent::new(2, 2);
        let output = backend
            .allocate_texture(extent, TextureFormat::Rgba8Unorm, "output")
            .unwrap();
        let kernel = backend.compile_kernel("stepModifier").unwrap();
        let args = KernelArgs {
            input: None,
            output,
            uniforms: None,
        };
        let result = backend.dispatch(kernel, &args, extent);
        assert!(matches!(result, Err(BackendError::Dispatch { .. })));
        assert_eq!(backend.stats().dispatches, 0);
    }

    #[test]
    fn rgba8_textures_are_quantized() {
        let backend = CpuBackend::new();
        let texture = backend
            .allocate_texture(Extent::new(1, 1), TextureFormat::Rgba8Unorm, "t")
            .unwrap();
        backend.write_texels(texture, &[0.5, 1.5, -1.0, 1.0]).unwrap();
        let texels = backend.read_texels(texture).unwrap();
        assert_eq!(texels, vec![128.0 / 255.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn write_texels_checks_length() {
        let backend = CpuBackend::new();
        let texture = backend
            .allocate_texture(Extent::new(2, 2), TextureFormat::Rgba8Unorm, "t")
            .unwrap();
        assert_eq!(
            backend.write_texels(texture, &[0.0; 4]),
            Err(BackendError::TexelCount {
                expected: 16,
                actual: 4
            })
        );
    }

    #[test]
    fn injected_faults_surface_and_clear() {
        let backend = CpuBackend::new();
        backend.fail_compile("roundModifier");
        backend.fail_allocations(true);
        assert!(backend.compile_kernel("roundModifier").is_err());
        assert!(backend.allocate_buffer(16, "b").is_err());

        backend.clear_faults();
        assert!(backend.compile_kernel("roundModifier").is_ok());
        assert!(backend.allocate_buffer(16, "b").is_ok());
    }

    #[test]
    fn texel_transfer_faults_surface_and_clear() {
        let backend = CpuBackend::new();
        let texture = backend
            .allocate_texture(Extent::new(2, 2), TextureFormat::Rgba32Float, "t")
            .unwrap();

        backend.truncate_readbacks(true);
        assert_eq!(backend.read_texels(texture).unwrap().len(), 15);
        backend.fail_uploads(true);
        assert!(matches!(
            backend.write_texels(texture, &[0.0; 16]),
            Err(BackendError::Device(_))
        ));

        backend.clear_faults();
        assert_eq!(backend.read_texels(texture).unwrap().len(), 16);
        assert!(backend.write_texels(texture, &[0.0; 16]).is_ok());
    }

    #[test]
    fn release_is_counted_once() {
        let backend = CpuBackend::new();
        let texture = backend
            .allocate_texture(Extent::new(1, 1), TextureFormat::Rgba8Unorm, "t")
            .unwrap();
        backend.release_texture(texture);
        backend.release_texture(texture);
        assert_eq!(backend.stats().textures_released, 1);
        assert_eq!(backend.live_textures(), 0);
    }
}
