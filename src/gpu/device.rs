use wgpu::{BindGroup, BindGroupLayout, Buffer, ComputePipeline, Device, Queue};

/// A compute pipeline together with the bind-group layout it was built from.
pub(crate) struct Kernel {
    pipeline: ComputePipeline,
    layout: BindGroupLayout,
}

/// How a shader binds one of its buffers.
#[derive(Clone, Copy)]
enum Binding {
    ReadOnly,
    ReadWrite,
    Uniform,
}

/// Handle to a compute-capable adapter and the crate's pipelines on it.
///
/// Opening the context compiles every kernel once; layers on the
/// [`Accelerated`](crate::Backend::Accelerated) backend share it through an
/// `Rc`.
pub struct GpuContext {
    device: Device,
    queue: Queue,
    pub(crate) vol2col: Kernel,
    pub(crate) col2vol: Kernel,
    pub(crate) gemm: Kernel,
    pub(crate) pool: Kernel,
    pub(crate) pool_backward: Kernel,
    pub(crate) crop: Kernel,
}

impl GpuContext {
    /// Opens the highest-performance adapter available.
    ///
    /// # Errors
    ///
    /// When no suitable adapter exists or the device request is refused.
    pub fn new() -> Result<Self, String> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(async {
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
        })
        .ok_or_else(|| "no suitable adapter".to_string())?;

        let (device, queue) = pollster::block_on(async {
            adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("volumetrika.device"),
                        required_features: wgpu::Features::empty(),
                        required_limits: adapter.limits(),
                    },
                    None,
                )
                .await
        })
        .map_err(|err| err.to_string())?;

        let vol2col = Kernel::new(
            &device,
            "vol2col",
            include_str!("shaders/vol2col.wgsl"),
            &[Binding::ReadOnly, Binding::ReadWrite, Binding::Uniform],
        );
        let col2vol = Kernel::new(
            &device,
            "col2vol",
            include_str!("shaders/col2vol.wgsl"),
            &[Binding::ReadOnly, Binding::ReadWrite, Binding::Uniform],
        );
        let gemm = Kernel::new(
            &device,
            "gemm",
            include_str!("shaders/gemm.wgsl"),
            &[
                Binding::ReadOnly,
                Binding::ReadOnly,
                Binding::ReadWrite,
                Binding::Uniform,
            ],
        );
        let pool = Kernel::new(
            &device,
            "pool3d",
            include_str!("shaders/pool3d.wgsl"),
            &[
                Binding::ReadOnly,
                Binding::ReadWrite,
                Binding::ReadWrite,
                Binding::Uniform,
            ],
        );
        let pool_backward = Kernel::new(
            &device,
            "pool3d_backward",
            include_str!("shaders/pool3d_backward.wgsl"),
            &[
                Binding::ReadOnly,
                Binding::ReadOnly,
                Binding::ReadWrite,
                Binding::Uniform,
            ],
        );
        let crop = Kernel::new(
            &device,
            "crop3d",
            include_str!("shaders/crop3d.wgsl"),
            &[Binding::ReadOnly, Binding::ReadWrite, Binding::Uniform],
        );

        Ok(Self {
            device,
            queue,
            vol2col,
            col2vol,
            gemm,
            pool,
            pool_backward,
            crop,
        })
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }
}

impl Kernel {
    fn new(device: &Device, label: &str, source: &str, bindings: &[Binding]) -> Self {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| wgpu::BindGroupLayoutEntry {
                binding: index as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match binding {
                        Binding::ReadOnly => wgpu::BufferBindingType::Storage { read_only: true },
                        Binding::ReadWrite => {
                            wgpu::BufferBindingType::Storage { read_only: false }
                        }
                        Binding::Uniform => wgpu::BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
        });

        Self { pipeline, layout }
    }

    pub(crate) fn pipeline(&self) -> &ComputePipeline {
        &self.pipeline
    }

    /// Binds `buffers` in declaration order.
    pub(crate) fn bind_group(&self, device: &Device, buffers: &[&Buffer]) -> BindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(index, buffer)| wgpu::BindGroupEntry {
                binding: index as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.layout,
            entries: &entries,
        })
    }
}
