use bytemuck::{Pod, Zeroable};

use wgpu::util::DeviceExt;

use super::{
    array::GpuArray,
    device::{GpuContext, Kernel},
};

/// Geometry of an unrolling pass over one batch item.
pub(crate) struct Patch {
    pub(crate) channels: usize,
    pub(crate) input: [usize; 3],
    pub(crate) kernel: [usize; 3],
    pub(crate) stride: [usize; 3],
    pub(crate) pad: [usize; 3],
    pub(crate) out: [usize; 3],
}

/// One C = α·op(A)·op(B) + β·C product over row-major device buffers.
pub(crate) struct Gemm {
    pub(crate) m: usize,
    pub(crate) n: usize,
    pub(crate) k: usize,
    pub(crate) transpose_a: bool,
    pub(crate) transpose_b: bool,
    pub(crate) alpha: f32,
    pub(crate) beta: f32,
    pub(crate) a_offset: usize,
    pub(crate) b_offset: usize,
    pub(crate) c_offset: usize,
}

/// Geometry of a pooling pass over every plane at once.
pub(crate) struct Pool {
    pub(crate) planes: usize,
    pub(crate) input: [usize; 3],
    pub(crate) kernel: [usize; 3],
    pub(crate) stride: [usize; 3],
    pub(crate) pad: [usize; 3],
    pub(crate) out: [usize; 3],
    pub(crate) average: bool,
}

/// Geometry of a crop window over every plane at once.
pub(crate) struct CropWindow {
    pub(crate) planes: usize,
    pub(crate) input: [usize; 3],
    pub(crate) crop: [usize; 3],
    pub(crate) offset: [usize; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PatchParams {
    vol: [u32; 4],
    kernel: [u32; 4],
    stride: [u32; 4],
    pad: [i32; 4],
    out: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GemmParams {
    dims: [u32; 4],
    offsets: [u32; 4],
    scale: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PoolParams {
    input: [u32; 4],
    kernel: [u32; 4],
    stride: [u32; 4],
    pad: [i32; 4],
    out: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CropParams {
    input: [u32; 4],
    crop: [u32; 4],
    offset: [u32; 4],
}

fn groups(work: usize, size: u32) -> u32 {
    ((work as u32) + size - 1) / size
}

fn dispatch<P: Pod>(
    context: &GpuContext,
    kernel: &Kernel,
    buffers: &[&GpuArray],
    params: &P,
    workgroups: [u32; 3],
) {
    let device = context.device();

    let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: None,
        contents: bytemuck::bytes_of(params),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let mut bindings: Vec<&wgpu::Buffer> = buffers.iter().map(|array| array.buffer()).collect();
    bindings.push(&params_buffer);
    let bind_group = kernel.bind_group(device, &bindings);

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(kernel.pipeline());
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(
            workgroups[0].max(1),
            workgroups[1].max(1),
            workgroups[2].max(1),
        );
    }
    context.queue().submit(Some(encoder.finish()));
}

impl Patch {
    fn params(&self, offset: usize, beta: u32) -> PatchParams {
        PatchParams {
            vol: [
                self.channels as u32,
                self.input[0] as u32,
                self.input[1] as u32,
                self.input[2] as u32,
            ],
            kernel: [
                self.kernel[0] as u32,
                self.kernel[1] as u32,
                self.kernel[2] as u32,
                offset as u32,
            ],
            stride: [
                self.stride[0] as u32,
                self.stride[1] as u32,
                self.stride[2] as u32,
                beta,
            ],
            pad: [self.pad[0] as i32, self.pad[1] as i32, self.pad[2] as i32, 0],
            out: [self.out[0] as u32, self.out[1] as u32, self.out[2] as u32, 0],
        }
    }

    pub(crate) fn rows(&self) -> usize {
        self.channels * self.kernel[0] * self.kernel[1] * self.kernel[2]
    }

    pub(crate) fn columns(&self) -> usize {
        self.out[0] * self.out[1] * self.out[2]
    }

    pub(crate) fn volume(&self) -> usize {
        self.channels * self.input[0] * self.input[1] * self.input[2]
    }
}

/// Unrolls the batch item at `offset` of `vol` into `col`.
pub(crate) fn vol2col(
    context: &GpuContext,
    vol: &GpuArray,
    col: &GpuArray,
    patch: &Patch,
    offset: usize,
) {
    dispatch(
        context,
        &context.vol2col,
        &[vol, col],
        &patch.params(offset, 0),
        [groups(patch.rows(), 16), groups(patch.columns(), 4), 1],
    );
}

/// Scatter-accumulates `col` into the batch item at `offset` of `vol`;
/// `accumulate` keeps the previous contents, otherwise they are overwritten.
pub(crate) fn col2vol(
    context: &GpuContext,
    col: &GpuArray,
    vol: &GpuArray,
    patch: &Patch,
    offset: usize,
    accumulate: bool,
) {
    dispatch(
        context,
        &context.col2vol,
        &[col, vol],
        &patch.params(offset, accumulate as u32),
        [groups(patch.volume(), 64), 1, 1],
    );
}

pub(crate) fn gemm(context: &GpuContext, a: &GpuArray, b: &GpuArray, c: &GpuArray, args: &Gemm) {
    let flags = args.transpose_a as u32 | (args.transpose_b as u32) << 1;
    let params = GemmParams {
        dims: [args.m as u32, args.n as u32, args.k as u32, flags],
        offsets: [
            args.a_offset as u32,
            args.b_offset as u32,
            args.c_offset as u32,
            0,
        ],
        scale: [args.alpha, args.beta, 0., 0.],
    };

    dispatch(
        context,
        &context.gemm,
        &[a, b, c],
        &params,
        [groups(args.m, 16), groups(args.n, 16), 1],
    );
}

impl Pool {
    fn params(&self) -> PoolParams {
        PoolParams {
            input: [
                self.planes as u32,
                self.input[0] as u32,
                self.input[1] as u32,
                self.input[2] as u32,
            ],
            kernel: [
                self.kernel[0] as u32,
                self.kernel[1] as u32,
                self.kernel[2] as u32,
                self.average as u32,
            ],
            stride: [
                self.stride[0] as u32,
                self.stride[1] as u32,
                self.stride[2] as u32,
                0,
            ],
            pad: [self.pad[0] as i32, self.pad[1] as i32, self.pad[2] as i32, 0],
            out: [
                self.out[0] as u32,
                self.out[1] as u32,
                self.out[2] as u32,
                (self.out[0] * self.out[1] * self.out[2]) as u32,
            ],
        }
    }
}

pub(crate) fn pool_forward(
    context: &GpuContext,
    bottom: &GpuArray,
    top: &GpuArray,
    argmax: &GpuArray,
    pool: &Pool,
) {
    let cells = pool.out[0] * pool.out[1] * pool.out[2];
    dispatch(
        context,
        &context.pool,
        &[bottom, top, argmax],
        &pool.params(),
        [groups(cells, 64), pool.planes as u32, 1],
    );
}

pub(crate) fn pool_backward(
    context: &GpuContext,
    top_grad: &GpuArray,
    argmax: &GpuArray,
    bottom_grad: &GpuArray,
    pool: &Pool,
) {
    let volume = pool.input[0] * pool.input[1] * pool.input[2];
    dispatch(
        context,
        &context.pool_backward,
        &[top_grad, argmax, bottom_grad],
        &pool.params(),
        [groups(volume, 64), pool.planes as u32, 1],
    );
}

impl CropWindow {
    fn params(&self, backward: bool) -> CropParams {
        CropParams {
            input: [
                self.planes as u32,
                self.input[0] as u32,
                self.input[1] as u32,
                self.input[2] as u32,
            ],
            crop: [
                self.crop[0] as u32,
                self.crop[1] as u32,
                self.crop[2] as u32,
                backward as u32,
            ],
            offset: [
                self.offset[0] as u32,
                self.offset[1] as u32,
                self.offset[2] as u32,
                0,
            ],
        }
    }
}

/// Forward gathers the window out of `src`; backward plants `src` into a
/// zero background of the full extent.
pub(crate) fn crop(
    context: &GpuContext,
    src: &GpuArray,
    dst: &GpuArray,
    window: &CropWindow,
    backward: bool,
) {
    let cells = if backward {
        window.input[0] * window.input[1] * window.input[2]
    } else {
        window.crop[0] * window.crop[1] * window.crop[2]
    };
    dispatch(
        context,
        &context.crop,
        &[src, dst],
        &window.params(backward),
        [groups(cells, 64), window.planes as u32, 1],
    );
}

/// Whole-buffer device copy; the stretch remapping preserves flat order.
pub(crate) fn copy(context: &GpuContext, src: &GpuArray, dst: &GpuArray) {
    assert_eq!(src.len(), dst.len());

    let mut encoder = context
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    encoder.copy_buffer_to_buffer(
        src.buffer(),
        0,
        dst.buffer(),
        0,
        (src.len() * std::mem::size_of::<f32>()) as u64,
    );
    context.queue().submit(Some(encoder.finish()));
}
