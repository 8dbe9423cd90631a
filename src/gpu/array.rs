use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, Maintain, MapMode};

use super::device::GpuContext;

/// An array of plain-old-data elements resident on the device.
pub(crate) struct GpuArray {
    buffer: Buffer,
    len: usize,
}

impl GpuArray {
    /// Uploads a host slice.
    pub(crate) fn from_slice<T: bytemuck::Pod>(context: &GpuContext, data: &[T]) -> Self {
        let buffer = context
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::cast_slice(data),
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            });

        Self {
            buffer,
            len: data.len(),
        }
    }

    /// Allocates `len` zeroed 4-byte elements.
    pub(crate) fn zeroed(context: &GpuContext, len: usize) -> Self {
        let buffer = context.device().create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: (len * std::mem::size_of::<f32>()) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        Self { buffer, len }
    }

    pub(crate) fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Copies the array back to the host, blocking until the device has
    /// caught up; this is the only point where results become host-visible.
    pub(crate) fn read<T: bytemuck::Pod>(&self, context: &GpuContext) -> Vec<T> {
        let device = context.device();
        let size = (self.len * std::mem::size_of::<T>()) as u64;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
        context.queue().submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(MapMode::Read, move |result| sender.send(result).unwrap());
        device.poll(Maintain::Wait);
        receiver
            .recv()
            .expect("map_async callback dropped")
            .expect("buffer map failed");

        let data = slice.get_mapped_range();
        let out = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();

        out
    }
}
