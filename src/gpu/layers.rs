//! Device renditions of the five kernels, composed from the same
//! unroll+matmul decomposition as the native path. Every function uploads
//! its operands, runs the pipelines and reads the results back before
//! returning, so the pass is synchronous from the caller's point of view.

use crate::{
    convolution::Convolution3d, crop::Crop3d, deconvolution::Deconvolution3d, pooling::PoolMethod,
    pooling::Pooling3d, tensor::Volume,
};

use super::{
    array::GpuArray,
    device::GpuContext,
    ops::{self, CropWindow, Gemm, Patch, Pool},
};

impl Patch {
    fn for_convolution(layer: &Convolution3d) -> Self {
        Self {
            channels: layer.channels,
            input: [layer.length, layer.height, layer.width],
            kernel: layer.kernel(),
            stride: layer.stride(),
            pad: layer.pad(),
            out: [layer.out_length, layer.out_height, layer.out_width],
        }
    }

    /// For a deconvolution the unrolled volume is the larger top; its
    /// "output sites" are the bottom's.
    fn for_deconvolution(layer: &Deconvolution3d) -> Self {
        Self {
            channels: layer.config.num_output,
            input: [layer.out_length, layer.out_height, layer.out_width],
            kernel: layer.kernel(),
            stride: layer.stride(),
            pad: layer.pad(),
            out: [layer.length, layer.height, layer.width],
        }
    }
}

pub(crate) fn convolution_forward(
    context: &GpuContext,
    layer: &Convolution3d,
    bottom: &Volume,
    top: &Volume,
) {
    let (m, k, n) = layer.gemm_dims();
    let groups = layer.config.filter_group;
    let num_output = layer.config.num_output;
    let patch = Patch::for_convolution(layer);

    let bottom_data = bottom.data();
    let bottom_buffer = GpuArray::from_slice(context, bottom_data.as_slice().unwrap());
    let weight = layer.weight.data();
    let weight_buffer = GpuArray::from_slice(context, weight.as_slice().unwrap());
    let col_buffer = GpuArray::zeroed(context, patch.rows() * patch.columns());
    let top_buffer = GpuArray::zeroed(context, layer.num * num_output * n);

    let bias_buffers = layer.config.bias_term.then(|| {
        let bias = layer.bias.data();
        let ones = vec![1.0_f32; n];
        (
            GpuArray::from_slice(context, bias.as_slice().unwrap()),
            GpuArray::from_slice(context, &ones),
        )
    });

    for sample in 0..layer.num {
        ops::vol2col(
            context,
            &bottom_buffer,
            &col_buffer,
            &patch,
            sample * patch.volume(),
        );

        for group in 0..groups {
            ops::gemm(
                context,
                &weight_buffer,
                &col_buffer,
                &top_buffer,
                &Gemm {
                    m,
                    n,
                    k,
                    transpose_a: false,
                    transpose_b: false,
                    alpha: 1.,
                    beta: 0.,
                    a_offset: group * m * k,
                    b_offset: group * k * n,
                    c_offset: sample * num_output * n + group * m * n,
                },
            );
        }

        if let Some((bias_buffer, ones_buffer)) = bias_buffers.as_ref() {
            ops::gemm(
                context,
                bias_buffer,
                ones_buffer,
                &top_buffer,
                &Gemm {
                    m: num_output,
                    n,
                    k: 1,
                    transpose_a: false,
                    transpose_b: false,
                    alpha: 1.,
                    beta: 1.,
                    a_offset: 0,
                    b_offset: 0,
                    c_offset: sample * num_output * n,
                },
            );
        }
    }

    let result = top_buffer.read::<f32>(context);
    top.data_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&result);
}

pub(crate) fn convolution_backward(
    context: &GpuContext,
    layer: &Convolution3d,
    top: &Volume,
    propagate: bool,
    bottom: &Volume,
) {
    let (m, k, n) = layer.gemm_dims();
    let groups = layer.config.filter_group;
    let num_output = layer.config.num_output;
    let patch = Patch::for_convolution(layer);

    let top_grad = top.gradient();
    let top_grad_buffer = GpuArray::from_slice(context, top_grad.as_slice().unwrap());
    let bottom_data = bottom.data();
    let bottom_buffer = GpuArray::from_slice(context, bottom_data.as_slice().unwrap());
    let weight = layer.weight.data();
    let weight_buffer = GpuArray::from_slice(context, weight.as_slice().unwrap());
    let weight_grad_buffer = {
        let weight_grad = layer.weight.gradient();
        GpuArray::from_slice(context, weight_grad.as_slice().unwrap())
    };
    let col_buffer = GpuArray::zeroed(context, patch.rows() * patch.columns());

    let bias_buffers = layer.config.bias_term.then(|| {
        let bias_grad = layer.bias.gradient();
        let ones = vec![1.0_f32; n];
        (
            GpuArray::from_slice(context, bias_grad.as_slice().unwrap()),
            GpuArray::from_slice(context, &ones),
        )
    });
    let bottom_grad_buffer = propagate.then(|| {
        let bottom_grad = bottom.gradient();
        GpuArray::from_slice(context, bottom_grad.as_slice().unwrap())
    });

    for sample in 0..layer.num {
        if let Some((bias_grad_buffer, ones_buffer)) = bias_buffers.as_ref() {
            ops::gemm(
                context,
                &top_grad_buffer,
                ones_buffer,
                bias_grad_buffer,
                &Gemm {
                    m: num_output,
                    n: 1,
                    k: n,
                    transpose_a: false,
                    transpose_b: false,
                    alpha: 1.,
                    beta: 1.,
                    a_offset: sample * num_output * n,
                    b_offset: 0,
                    c_offset: 0,
                },
            );
        }

        ops::vol2col(
            context,
            &bottom_buffer,
            &col_buffer,
            &patch,
            sample * patch.volume(),
        );

        for group in 0..groups {
            ops::gemm(
                context,
                &top_grad_buffer,
                &col_buffer,
                &weight_grad_buffer,
                &Gemm {
                    m,
                    n: k,
                    k: n,
                    transpose_a: false,
                    transpose_b: true,
                    alpha: 1.,
                    beta: 1.,
                    a_offset: sample * num_output * n + group * m * n,
                    b_offset: group * k * n,
                    c_offset: group * m * k,
                },
            );
        }

        if let Some(bottom_grad_buffer) = bottom_grad_buffer.as_ref() {
            for group in 0..groups {
                ops::gemm(
                    context,
                    &weight_buffer,
                    &top_grad_buffer,
                    &col_buffer,
                    &Gemm {
                        m: k,
                        n,
                        k: m,
                        transpose_a: true,
                        transpose_b: false,
                        alpha: 1.,
                        beta: 0.,
                        a_offset: group * m * k,
                        b_offset: sample * num_output * n + group * m * n,
                        c_offset: group * k * n,
                    },
                );
            }

            ops::col2vol(
                context,
                &col_buffer,
                bottom_grad_buffer,
                &patch,
                sample * patch.volume(),
                true,
            );
        }
    }

    let weight_grad = weight_grad_buffer.read::<f32>(context);
    layer
        .weight
        .gradient_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&weight_grad);
    if let Some((bias_grad_buffer, _)) = bias_buffers.as_ref() {
        let bias_grad = bias_grad_buffer.read::<f32>(context);
        layer
            .bias
            .gradient_mut()
            .as_slice_mut()
            .unwrap()
            .copy_from_slice(&bias_grad);
    }
    if let Some(bottom_grad_buffer) = bottom_grad_buffer.as_ref() {
        let bottom_grad = bottom_grad_buffer.read::<f32>(context);
        bottom
            .gradient_mut()
            .as_slice_mut()
            .unwrap()
            .copy_from_slice(&bottom_grad);
    }
}

pub(crate) fn deconvolution_forward(
    context: &GpuContext,
    layer: &Deconvolution3d,
    bottom: &Volume,
    top: &Volume,
) {
    let (m, k, n) = layer.gemm_dims();
    let groups = layer.config.filter_group;
    let num_output = layer.config.num_output;
    let out_spatial = layer.out_length * layer.out_height * layer.out_width;
    let patch = Patch::for_deconvolution(layer);

    let bottom_data = bottom.data();
    let bottom_buffer = GpuArray::from_slice(context, bottom_data.as_slice().unwrap());
    let weight = layer.weight.data();
    let weight_buffer = GpuArray::from_slice(context, weight.as_slice().unwrap());
    let col_buffer = GpuArray::zeroed(context, patch.rows() * patch.columns());
    let top_buffer = GpuArray::zeroed(context, layer.num * num_output * out_spatial);

    let bias_buffers = layer.config.bias_term.then(|| {
        let bias = layer.bias.data();
        let ones = vec![1.0_f32; out_spatial];
        (
            GpuArray::from_slice(context, bias.as_slice().unwrap()),
            GpuArray::from_slice(context, &ones),
        )
    });

    for sample in 0..layer.num {
        for group in 0..groups {
            ops::gemm(
                context,
                &weight_buffer,
                &bottom_buffer,
                &col_buffer,
                &Gemm {
                    m: k,
                    n,
                    k: m,
                    transpose_a: true,
                    transpose_b: false,
                    alpha: 1.,
                    beta: 0.,
                    a_offset: group * m * k,
                    b_offset: sample * layer.channels * n + group * m * n,
                    c_offset: group * k * n,
                },
            );
        }

        ops::col2vol(
            context,
            &col_buffer,
            &top_buffer,
            &patch,
            sample * patch.volume(),
            false,
        );

        if let Some((bias_buffer, ones_buffer)) = bias_buffers.as_ref() {
            ops::gemm(
                context,
                bias_buffer,
                ones_buffer,
                &top_buffer,
                &Gemm {
                    m: num_output,
                    n: out_spatial,
                    k: 1,
                    transpose_a: false,
                    transpose_b: false,
                    alpha: 1.,
                    beta: 1.,
                    a_offset: 0,
                    b_offset: 0,
                    c_offset: sample * num_output * out_spatial,
                },
            );
        }
    }

    let result = top_buffer.read::<f32>(context);
    top.data_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&result);
}

pub(crate) fn deconvolution_backward(
    context: &GpuContext,
    layer: &Deconvolution3d,
    top: &Volume,
    propagate: bool,
    bottom: &Volume,
) {
    let (m, k, n) = layer.gemm_dims();
    let groups = layer.config.filter_group;
    let num_output = layer.config.num_output;
    let out_spatial = layer.out_length * layer.out_height * layer.out_width;
    let patch = Patch::for_deconvolution(layer);

    let top_grad = top.gradient();
    let top_grad_buffer = GpuArray::from_slice(context, top_grad.as_slice().unwrap());
    let bottom_data = bottom.data();
    let bottom_buffer = GpuArray::from_slice(context, bottom_data.as_slice().unwrap());
    let weight = layer.weight.data();
    let weight_buffer = GpuArray::from_slice(context, weight.as_slice().unwrap());
    let weight_grad_buffer = {
        let weight_grad = layer.weight.gradient();
        GpuArray::from_slice(context, weight_grad.as_slice().unwrap())
    };
    let col_buffer = GpuArray::zeroed(context, patch.rows() * patch.columns());

    let bias_buffers = layer.config.bias_term.then(|| {
        let bias_grad = layer.bias.gradient();
        let ones = vec![1.0_f32; out_spatial];
        (
            GpuArray::from_slice(context, bias_grad.as_slice().unwrap()),
            GpuArray::from_slice(context, &ones),
        )
    });
    let bottom_grad_buffer = propagate.then(|| {
        let bottom_grad = bottom.gradient();
        GpuArray::from_slice(context, bottom_grad.as_slice().unwrap())
    });

    for sample in 0..layer.num {
        if let Some((bias_grad_buffer, ones_buffer)) = bias_buffers.as_ref() {
            ops::gemm(
                context,
                &top_grad_buffer,
                ones_buffer,
                bias_grad_buffer,
                &Gemm {
                    m: num_output,
                    n: 1,
                    k: out_spatial,
                    transpose_a: false,
                    transpose_b: false,
                    alpha: 1.,
                    beta: 1.,
                    a_offset: sample * num_output * out_spatial,
                    b_offset: 0,
                    c_offset: 0,
                },
            );
        }

        ops::vol2col(
            context,
            &top_grad_buffer,
            &col_buffer,
            &patch,
            sample * patch.volume(),
        );

        for group in 0..groups {
            ops::gemm(
                context,
                &bottom_buffer,
                &col_buffer,
                &weight_grad_buffer,
                &Gemm {
                    m,
                    n: k,
                    k: n,
                    transpose_a: false,
                    transpose_b: true,
                    alpha: 1.,
                    beta: 1.,
                    a_offset: sample * layer.channels * n + group * m * n,
                    b_offset: group * k * n,
                    c_offset: group * m * k,
                },
            );
        }

        if let Some(bottom_grad_buffer) = bottom_grad_buffer.as_ref() {
            for group in 0..groups {
                ops::gemm(
                    context,
                    &weight_buffer,
                    &col_buffer,
                    bottom_grad_buffer,
                    &Gemm {
                        m,
                        n,
                        k,
                        transpose_a: false,
                        transpose_b: false,
                        alpha: 1.,
                        beta: 1.,
                        a_offset: group * m * k,
                        b_offset: group * k * n,
                        c_offset: sample * layer.channels * n + group * m * n,
                    },
                );
            }
        }
    }

    let weight_grad = weight_grad_buffer.read::<f32>(context);
    layer
        .weight
        .gradient_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&weight_grad);
    if let Some((bias_grad_buffer, _)) = bias_buffers.as_ref() {
        let bias_grad = bias_grad_buffer.read::<f32>(context);
        layer
            .bias
            .gradient_mut()
            .as_slice_mut()
            .unwrap()
            .copy_from_slice(&bias_grad);
    }
    if let Some(bottom_grad_buffer) = bottom_grad_buffer.as_ref() {
        let bottom_grad = bottom_grad_buffer.read::<f32>(context);
        bottom
            .gradient_mut()
            .as_slice_mut()
            .unwrap()
            .copy_from_slice(&bottom_grad);
    }
}

pub(crate) fn pooling_forward(
    context: &GpuContext,
    layer: &mut Pooling3d,
    bottom: &Volume,
    top: &Volume,
) {
    let pool = Pool {
        planes: layer.num * layer.channels,
        input: [layer.length, layer.height, layer.width],
        kernel: layer.kernel(),
        stride: layer.stride(),
        pad: layer.pad(),
        out: [layer.pooled_length, layer.pooled_height, layer.pooled_width],
        average: layer.config.method == PoolMethod::Average,
    };
    let total = pool.planes * pool.out[0] * pool.out[1] * pool.out[2];

    let bottom_data = bottom.data();
    let bottom_buffer = GpuArray::from_slice(context, bottom_data.as_slice().unwrap());
    let top_buffer = GpuArray::zeroed(context, total);
    let argmax_buffer = GpuArray::zeroed(context, total);

    ops::pool_forward(context, &bottom_buffer, &top_buffer, &argmax_buffer, &pool);

    let result = top_buffer.read::<f32>(context);
    top.data_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&result);

    if layer.config.method == PoolMethod::Max {
        let indices = argmax_buffer.read::<u32>(context);
        layer
            .max_indices
            .as_slice_mut()
            .unwrap()
            .iter_mut()
            .zip(indices)
            .for_each(|(recorded, index)| *recorded = index as usize);
    }
}

pub(crate) fn pooling_backward(
    context: &GpuContext,
    layer: &Pooling3d,
    top: &Volume,
    bottom: &Volume,
) {
    let pool = Pool {
        planes: layer.num * layer.channels,
        input: [layer.length, layer.height, layer.width],
        kernel: layer.kernel(),
        stride: layer.stride(),
        pad: layer.pad(),
        out: [layer.pooled_length, layer.pooled_height, layer.pooled_width],
        average: layer.config.method == PoolMethod::Average,
    };
    let total = pool.planes * pool.out[0] * pool.out[1] * pool.out[2];

    let top_grad = top.gradient();
    let top_grad_buffer = GpuArray::from_slice(context, top_grad.as_slice().unwrap());
    let argmax_buffer = if pool.average {
        GpuArray::zeroed(context, total)
    } else {
        let indices: Vec<u32> = layer.max_indices.iter().map(|&index| index as u32).collect();
        GpuArray::from_slice(context, &indices)
    };
    let bottom_grad_buffer = {
        let bottom_grad = bottom.gradient();
        GpuArray::from_slice(context, bottom_grad.as_slice().unwrap())
    };

    ops::pool_backward(
        context,
        &top_grad_buffer,
        &argmax_buffer,
        &bottom_grad_buffer,
        &pool,
    );

    let result = bottom_grad_buffer.read::<f32>(context);
    bottom
        .gradient_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&result);
}

pub(crate) fn crop_forward(context: &GpuContext, layer: &Crop3d, bottom: &Volume, top: &Volume) {
    let window = CropWindow {
        planes: layer.num * layer.channels,
        input: [layer.length, layer.height, layer.width],
        crop: layer.crop(),
        offset: layer.offsets,
    };

    let bottom_data = bottom.data();
    let bottom_buffer = GpuArray::from_slice(context, bottom_data.as_slice().unwrap());
    let top_buffer = GpuArray::zeroed(context, top.len());

    ops::crop(context, &bottom_buffer, &top_buffer, &window, false);

    let result = top_buffer.read::<f32>(context);
    top.data_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&result);
}

pub(crate) fn crop_backward(context: &GpuContext, layer: &Crop3d, top: &Volume, bottom: &Volume) {
    let window = CropWindow {
        planes: layer.num * layer.channels,
        input: [layer.length, layer.height, layer.width],
        crop: layer.crop(),
        offset: layer.offsets,
    };

    let top_grad = top.gradient();
    let top_grad_buffer = GpuArray::from_slice(context, top_grad.as_slice().unwrap());
    let bottom_grad_buffer = GpuArray::zeroed(context, bottom.len());

    ops::crop(context, &top_grad_buffer, &bottom_grad_buffer, &window, true);

    let result = bottom_grad_buffer.read::<f32>(context);
    bottom
        .gradient_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&result);
}

pub(crate) fn stretch_forward(context: &GpuContext, bottom: &Volume, top: &Volume) {
    let bottom_data = bottom.data();
    let bottom_buffer = GpuArray::from_slice(context, bottom_data.as_slice().unwrap());
    let top_buffer = GpuArray::zeroed(context, top.len());

    ops::copy(context, &bottom_buffer, &top_buffer);

    let result = top_buffer.read::<f32>(context);
    top.data_mut()
        .as_slice_mut()
        .unwrap()
        .copy_from_slice(&result);
}

pub(crate) fn stretch_backward(context: &GpuContext, top: &Volume, bottom: &Volume) {
    let top_grad = top.gradient();
    let top_grad_buffer = GpuArray::from_slice(context, top_grad.as_slice().unwrap());
    let routed_buffer = GpuArray::zeroed(context, bottom.len());

    ops::copy(context, &top_grad_buffer, &routed_buffer);

    let routed = routed_buffer.read::<f32>(context);
    bottom
        .gradient_mut()
        .as_slice_mut()
        .unwrap()
        .iter_mut()
        .zip(routed)
        .for_each(|(gradient, share)| *gradient += share);
}
