//! wgpu compute backend.
//!
//! Kernels come from the WGSL catalogue in [`crate::kernels`]. Every texture is created
//! with storage, sampling and copy usages so the same allocation can be written by one
//! stage and read by the next. Dispatches are submitted one at a time and waited on,
//! which is what gives the graph its blocking, bottom-up evaluation order.

use std::cell::RefCell;
use std::collections::HashMap;

use log::{debug, info, warn};

use crate::backend::{
    BufferId, ComputeBackend, Extent, KernelArgs, KernelId, TextureFormat, TextureHandle,
    TextureId, component_count,
};
use crate::error::{BackendError, BackendResult};
use crate::kernels::Kernel;

const WORKGROUP_SIZE: u32 = 8;

/// Adapter and device options for [`WgpuBackend`].
#[derive(Clone, Debug)]
pub struct WgpuConfig {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    pub label: String,
}

impl Default for WgpuConfig {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            label: "proctex".to_string(),
        }
    }
}

impl WgpuConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }

    /// Prefer a software adapter (useful on headless CI machines).
    pub fn fallback_adapter(mut self, fallback: bool) -> Self {
        self.force_fallback_adapter = fallback;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

fn wgsl_format(format: TextureFormat) -> &'static str {
    match format {
        TextureFormat::Rgba8Unorm => "rgba8unorm",
        TextureFormat::Rgba32Float => "rgba32float",
    }
}

struct GpuTexture {
    handle: TextureHandle,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// One pipeline per output storage format.
struct Pipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

struct CompiledKernel {
    kernel: Kernel,
    pipelines: HashMap<TextureFormat, Pipeline>,
}

#[derive(Default)]
struct Resources {
    next_id: u64,
    kernels: Vec<CompiledKernel>,
    textures: HashMap<TextureId, GpuTexture>,
    buffers: HashMap<BufferId, wgpu::Buffer>,
}

impl Resources {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// GPU backend built on wgpu compute pipelines.
///
/// Create one backend and share it (by reference) with every graph that should run on
/// the same device.
///
/// ```ignore
/// let backend = WgpuBackend::new(WgpuConfig::default())?;
/// let mut graph = TextureGraph::new(&backend);
/// ```
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    resources: RefCell<Resources>,
}

impl WgpuBackend {
    /// Requests an adapter and device, blocking until both are ready.
    pub fn new(config: WgpuConfig) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(config))
    }

    /// Requests an adapter and device asynchronously.
    pub async fn new_async(config: WgpuConfig) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                force_fallback_adapter: config.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .map_err(|e| BackendError::Device(format!("no suitable adapter: {e}")))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(&config.label),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: Default::default(),
                experimental_features: Default::default(),
            })
            .await
            .map_err(|e| BackendError::Device(e.to_string()))?;

        let adapter_info = adapter.get_info();
        info!(
            "wgpu backend using {} ({:?})",
            adapter_info.name, adapter_info.backend
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
            resources: RefCell::new(Resources::default()),
        })
    }

    /// Returns the selected adapter's description.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Direct access to the device, for callers that want to sample the outputs.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Runs `f` inside a validation error scope, turning captured errors into `Err`.
    fn validated<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(error.to_string()),
            None => Ok(value),
        }
    }

    fn build_pipeline(&self, kernel: Kernel, format: TextureFormat) -> BackendResult<Pipeline> {
        let name = kernel.name();
        let source = kernel.wgsl_template().replace("FORMAT", wgsl_format(format));

        self.validated(|| {
            let bind_group_layout = self.bind_group_layout(kernel, format);
            let pipeline_layout = self
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(name),
                    bind_group_layouts: &[&bind_group_layout],
                    push_constant_ranges: &[],
                });
            let module = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(name),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
            let pipeline = self
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(name),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some("main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                });
            Pipeline {
                bind_group_layout,
                pipeline,
            }
        })
        .map_err(|reason| BackendError::KernelCompile {
            name: name.to_string(),
            reason,
        })
    }

    fn bind_group_layout(&self, kernel: Kernel, format: TextureFormat) -> wgpu::BindGroupLayout {
        let mut entries = Vec::with_capacity(3);
        if kernel.reads_input() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    // rgba32float is not filterable without an extra feature
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: wgpu_format(format),
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 2,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        self.device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(kernel.name()),
                entries: &entries,
            })
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resources = self.resources.borrow();
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter_info.name)
            .field("kernels", &resources.kernels.len())
            .field("textures", &resources.textures.len())
            .field("buffers", &resources.buffers.len())
            .finish()
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn compile_kernel(&self, name: &str) -> BackendResult<KernelId> {
        let kernel =
            Kernel::from_name(name).ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;

        if let Some(index) = self
            .resources
            .borrow()
            .kernels
            .iter()
            .position(|k| k.kernel == kernel)
        {
            return Ok(KernelId(index as u32));
        }

        let format = TextureFormat::default();
        let mut compiled = CompiledKernel {
            kernel,
            pipelines: HashMap::new(),
        };
        compiled
            .pipelines
            .insert(format, self.build_pipeline(kernel, format)?);
        debug!("compiled kernel {name}");

        let mut resources = self.resources.borrow_mut();
        resources.kernels.push(compiled);
        Ok(KernelId((resources.kernels.len() - 1) as u32))
    }

    fn allocate_texture(
        &self,
        extent: Extent,
        format: TextureFormat,
        label: &str,
    ) -> BackendResult<TextureHandle> {
        if extent.is_empty() {
            return Err(BackendError::InvalidDimensions(format!(
                "texture dimensions must be > 0, got {extent}"
            )));
        }

        let texture = self
            .validated(|| {
                self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(label),
                    size: wgpu::Extent3d {
                        width: extent.width,
                        height: extent.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format(format),
                    usage: wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                })
            })
            .map_err(BackendError::Allocation)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut resources = self.resources.borrow_mut();
        let handle = TextureHandle {
            id: TextureId(resources.next_id()),
            extent,
            format,
        };
        resources.textures.insert(
            handle.id,
            GpuTexture {
                handle,
                texture,
                view,
            },
        );
        Ok(handle)
    }

    fn release_texture(&self, texture: TextureHandle) {
        if let Some(gpu) = self.resources.borrow_mut().textures.remove(&texture.id) {
            gpu.texture.destroy();
        }
    }

    fn allocate_buffer(&self, byte_len: usize, label: &str) -> BackendResult<BufferId> {
        let buffer = self
            .validated(|| {
                self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(label),
                    size: byte_len as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .map_err(BackendError::Allocation)?;

        let mut resources = self.resources.borrow_mut();
        let id = BufferId(resources.next_id());
        resources.buffers.insert(id, buffer);
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, bytes: &[u8]) -> BackendResult<()> {
        let resources = self.resources.borrow();
        let target = resources
            .buffers
            .get(&buffer)
            .ok_or_else(|| BackendError::UnknownResource(format!("buffer {buffer:?}")))?;
        self.queue.write_buffer(target, 0, bytes);
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferId) {
        if let Some(buffer) = self.resources.borrow_mut().buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn dispatch(&self, kernel: KernelId, args: &KernelArgs, domain: Extent) -> BackendResult<()> {
        let index = kernel.0 as usize;
        let format = args.output.format;

        // Pipelines for non-default formats are built on first use.
        let missing = {
            let resources = self.resources.borrow();
            let compiled = resources
                .kernels
                .get(index)
                .ok_or_else(|| BackendError::UnknownResource(format!("kernel {kernel:?}")))?;
            if compiled.pipelines.contains_key(&format) {
                None
            } else {
                Some(self.build_pipeline(compiled.kernel, format)?)
            }
        };
        if let Some(pipeline) = missing {
            self.resources.borrow_mut().kernels[index]
                .pipelines
                .insert(format, pipeline);
        }

        let resources = self.resources.borrow();
        let compiled = &resources.kernels[index];
        let name = compiled.kernel.name();
        let fail = |reason: String| BackendError::Dispatch {
            kernel: name.to_string(),
            reason,
        };

        let output = resources
            .textures
            .get(&args.output.id)
            .ok_or_else(|| fail("output texture is not allocated".to_string()))?;
        if output.handle.extent != domain {
            return Err(fail(format!(
                "domain {domain} does not match output {}",
                output.handle.extent
            )));
        }
        let uniforms = args
            .uniforms
            .and_then(|id| resources.buffers.get(&id))
            .ok_or_else(|| fail("uniform buffer is not allocated".to_string()))?;

        let mut entries = Vec::with_capacity(3);
        if compiled.kernel.reads_input() {
            let input = args
                .input
                .and_then(|handle| resources.textures.get(&handle.id))
                .ok_or_else(|| fail("kernel requires an input texture".to_string()))?;
            if input.handle.extent != domain {
                return Err(fail(format!(
                    "input {} does not match domain {domain}",
                    input.handle.extent
                )));
            }
            entries.push(wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&input.view),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: 1,
            resource: wgpu::BindingResource::TextureView(&output.view),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: 2,
            resource: uniforms.as_entire_binding(),
        });

        let pipeline = &compiled.pipelines[&format];
        self.validated(|| {
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(name),
                layout: &pipeline.bind_group_layout,
                entries: &entries,
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(name),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(
                    domain.width.div_ceil(WORKGROUP_SIZE),
                    domain.height.div_ceil(WORKGROUP_SIZE),
                    1,
                );
            }
            self.queue.submit(Some(encoder.finish()));
        })
        .map_err(fail)?;

        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| {
                warn!("device poll failed after {name}: {e}");
                fail(e.to_string())
            })?;
        Ok(())
    }

    fn read_texels(&self, texture: TextureHandle) -> BackendResult<Vec<f32>> {
        let resources = self.resources.borrow();
        let source = resources
            .textures
            .get(&texture.id)
            .ok_or_else(|| BackendError::UnknownResource(format!("texture {:?}", texture.id)))?;
        let Extent { width, height } = source.handle.extent;
        let bytes_per_pixel = source.handle.format.bytes_per_pixel();
        let unpadded_row_bytes = width * bytes_per_pixel;
        let padded_row_bytes = unpadded_row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded_row_bytes * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| BackendError::Device(e.to_string()))?;
        rx.recv()
            .map_err(|e| BackendError::Device(e.to_string()))?
            .map_err(|e| BackendError::Device(e.to_string()))?;

        let mut bytes = Vec::with_capacity((unpadded_row_bytes * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in 0..height {
                let start = (row * padded_row_bytes) as usize;
                bytes.extend_from_slice(&data[start..start + unpadded_row_bytes as usize]);
            }
        }
        staging.unmap();

        Ok(match source.handle.format {
            TextureFormat::Rgba8Unorm => bytes.iter().map(|&b| b as f32 / 255.0).collect(),
            TextureFormat::Rgba32Float => bytes
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect(),
        })
    }

    fn write_texels(&self, texture: TextureHandle, texels: &[f32]) -> BackendResult<()> {
        let resources = self.resources.borrow();
        let target = resources
            .textures
            .get(&texture.id)
            .ok_or_else(|| BackendError::UnknownResource(format!("texture {:?}", texture.id)))?;
        let extent = target.handle.extent;
        let expected = component_count(extent);
        if texels.len() != expected {
            return Err(BackendError::TexelCount {
                expected,
                actual: texels.len(),
            });
        }

        let format = target.handle.format;
        let bytes: Vec<u8> = match format {
            TextureFormat::Rgba8Unorm => texels
                .iter()
                .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect(),
            TextureFormat::Rgba32Float => bytemuck::cast_slice(texels).to_vec(),
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(extent.width * format.bytes_per_pixel()),
                rows_per_image: Some(extent.height),
            },
            wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::StepUniforms;

    fn backend() -> Option<WgpuBackend> {
        WgpuBackend::new(WgpuConfig::default()).ok()
    }

    #[test]
    #[ignore] // Requires GPU
    fn compiles_every_catalogue_kernel() {
        let backend = backend().expect("no GPU adapter");
        for kernel in Kernel::ALL {
            backend.compile_kernel(kernel.name()).unwrap();
        }
    }

    #[test]
    #[ignore] // Requires GPU
    fn texels_round_trip_through_the_device() {
        let backend = backend().expect("no GPU adapter");
        let texture = backend
            .allocate_texture(Extent::new(3, 2), TextureFormat::Rgba32Float, "roundtrip")
            .unwrap();
        let texels: Vec<f32> = (0..24).map(|i| i as f32 / 24.0).collect();
        backend.write_texels(texture, &texels).unwrap();
        assert_eq!(backend.read_texels(texture).unwrap(), texels);
    }

    #[test]
    #[ignore] // Requires GPU
    fn step_kernel_matches_reference() {
        let backend = backend().expect("no GPU adapter");
        let extent = Extent::new(16, 16);
        let input = backend
            .allocate_texture(extent, TextureFormat::Rgba8Unorm, "input")
            .unwrap();
        backend
            .write_texels(input, &vec![0.6; component_count(extent)])
            .unwrap();
        let output = backend
            .allocate_texture(extent, TextureFormat::Rgba8Unorm, "output")
            .unwrap();
        let buffer = backend.allocate_buffer(16, "step").unwrap();
        let uniforms = StepUniforms {
            low: 0.1,
            high: 0.7,
            boundary: 0.5,
            _padding: 0.0,
        };
        backend.write_buffer(buffer, bytemuck::bytes_of(&uniforms)).unwrap();

        let kernel = backend.compile_kernel("stepModifier").unwrap();
        let args = KernelArgs {
            input: Some(input),
            output,
            uniforms: Some(buffer),
        };
        backend.dispatch(kernel, &args, extent).unwrap();

        let texels = backend.read_texels(output).unwrap();
        assert!(texels.chunks(4).all(|t| (t[0] - 0.7).abs() < 1.0 / 255.0));
    }

    #[test]
    #[ignore] // Requires GPU
    fn dispatch_rejects_mismatched_input() {
        let backend = backend().expect("no GPU adapter");
        let input = backend
            .allocate_texture(Extent::new(8, 8), TextureFormat::Rgba8Unorm, "input")
            .unwrap();
        let output = backend
            .allocate_texture(Extent::new(4, 4), TextureFormat::Rgba8Unorm, "output")
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
    }
}
